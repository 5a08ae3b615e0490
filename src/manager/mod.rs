//! Job registry and lifecycle event delivery.
//!
//! The [`JobManager`] tracks which node channels hold sub-bundles of which
//! job and publishes a [`JobEvent`] for every lifecycle step. Events are
//! queued in the order the registry changed and handed to listeners by a
//! single dedicated thread, so listeners never run on the reactor.

pub mod event;

pub use event::{JobEvent, JobEventKind, JobListener};

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::id::{ChannelId, IdGenerator, ListenerId};
use crate::protocol::SystemInfo;
use crate::scheduler::{JobHeader, SubBundle};

type Listeners = Arc<RwLock<Vec<(ListenerId, Arc<dyn JobListener>)>>>;

/// A sub-bundle currently held by a node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchRecord {
    pub bundle_id: Uuid,
    pub channel: ChannelId,
    pub task_count: usize,
    pub dispatched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub uuid: Uuid,
    pub name: String,
    pub priority: i32,
    pub task_count: usize,
    pub queued_at: DateTime<Utc>,
    pub dispatched: Vec<DispatchRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSnapshot {
    pub channel: ChannelId,
    pub connected_at: DateTime<Utc>,
    pub system_info: Option<SystemInfo>,
    /// Jobs with a sub-bundle on this node
    pub jobs: Vec<Uuid>,
}

#[derive(Debug)]
struct JobEntry {
    header: Arc<JobHeader>,
    task_count: usize,
    queued_at: DateTime<Utc>,
    dispatched: Vec<DispatchRecord>,
}

impl JobEntry {
    fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            uuid: self.header.uuid,
            name: self.header.name.clone(),
            priority: self.header.priority,
            task_count: self.task_count,
            queued_at: self.queued_at,
            dispatched: self.dispatched.clone(),
        }
    }
}

#[derive(Debug)]
struct NodeEntry {
    connected_at: DateTime<Utc>,
    system_info: Option<SystemInfo>,
}

#[derive(Debug, Default)]
struct Registry {
    jobs: HashMap<Uuid, JobEntry>,
    nodes: BTreeMap<ChannelId, NodeEntry>,
}

impl Registry {
    fn jobs_for_node(&self, channel: ChannelId) -> Vec<Uuid> {
        let mut jobs: Vec<&JobEntry> = self
            .jobs
            .values()
            .filter(|job| job.dispatched.iter().any(|d| d.channel == channel))
            .collect();
        jobs.sort_by_key(|job| job.queued_at);
        jobs.into_iter().map(|job| job.header.uuid).collect()
    }
}

/// Registry of dispatched work and publisher of job lifecycle events.
pub struct JobManager {
    registry: Mutex<Registry>,
    listeners: Listeners,
    events: mpsc::UnboundedSender<JobEvent>,
    ids: IdGenerator,
}

impl fmt::Debug for JobManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobManager")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl JobManager {
    /// Create the manager and start its event delivery thread. The thread
    /// exits once the manager is dropped and the backlog is delivered.
    pub fn new() -> Result<Self> {
        let (events, receiver) = mpsc::unbounded_channel();
        let listeners: Listeners = Arc::new(RwLock::new(Vec::new()));
        let delivery = Arc::clone(&listeners);
        thread::Builder::new()
            .name("job-events".to_string())
            .spawn(move || deliver_events(receiver, delivery))?;
        Ok(Self {
            registry: Mutex::new(Registry::default()),
            listeners,
            events,
            ids: IdGenerator::new(),
        })
    }

    pub fn add_listener(&self, listener: Arc<dyn JobListener>) -> Result<ListenerId> {
        let id = self.ids.next_listener();
        self.listeners.write()?.push((id, listener));
        Ok(id)
    }

    /// Returns false if no listener had this id.
    pub fn remove_listener(&self, id: ListenerId) -> Result<bool> {
        let mut listeners = self.listeners.write()?;
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        Ok(listeners.len() != before)
    }

    // Called with the registry locked so the event order matches the
    // order of registry changes.
    fn emit(&self, event: JobEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("Job event delivery thread is gone, dropping event");
        }
    }

    pub fn job_queued(&self, header: &Arc<JobHeader>, task_count: usize) -> Result<()> {
        let mut registry = self.registry.lock()?;
        if registry.jobs.contains_key(&header.uuid) {
            return Err(DispatchError::DuplicateJob(header.uuid));
        }
        registry.jobs.insert(
            header.uuid,
            JobEntry {
                header: Arc::clone(header),
                task_count,
                queued_at: Utc::now(),
                dispatched: Vec::new(),
            },
        );
        self.emit(
            JobEvent::new(JobEventKind::Queued, header.uuid, header.name.as_str())
                .with_task_count(task_count),
        );
        Ok(())
    }

    /// Forget a job that never made it into the queue. No event is published.
    pub fn job_rejected(&self, uuid: &Uuid) -> Result<()> {
        self.registry.lock()?.jobs.remove(uuid);
        Ok(())
    }

    pub fn job_dispatched(&self, bundle: &SubBundle, channel: ChannelId) -> Result<()> {
        let mut registry = self.registry.lock()?;
        let uuid = bundle.job_uuid();
        let job = registry
            .jobs
            .get_mut(&uuid)
            .ok_or(DispatchError::JobNotFound(uuid))?;
        job.dispatched.push(DispatchRecord {
            bundle_id: bundle.id,
            channel,
            task_count: bundle.task_count(),
            dispatched_at: Utc::now(),
        });
        self.emit(
            JobEvent::new(JobEventKind::Dispatched, uuid, bundle.header.name.as_str())
                .with_channel(channel)
                .with_task_count(bundle.task_count()),
        );
        Ok(())
    }

    /// A sub-bundle left `channel`, whether with results or to be requeued.
    pub fn job_returned(
        &self,
        bundle: &SubBundle,
        channel: ChannelId,
        elapsed: Option<Duration>,
    ) -> Result<()> {
        let mut registry = self.registry.lock()?;
        let uuid = bundle.job_uuid();
        if let Some(job) = registry.jobs.get_mut(&uuid) {
            job.dispatched.retain(|d| d.bundle_id != bundle.id);
        }
        self.emit(
            JobEvent::new(JobEventKind::Returned, uuid, bundle.header.name.as_str())
                .with_channel(channel)
                .with_task_count(bundle.task_count())
                .with_elapsed(elapsed),
        );
        Ok(())
    }

    /// Publish an update for a registered job. A job that already ended
    /// is skipped, its Ended event was the last one.
    pub fn job_updated(&self, uuid: &Uuid) -> Result<()> {
        let registry = self.registry.lock()?;
        let Some(job) = registry.jobs.get(uuid) else {
            tracing::debug!(job_id = %uuid, "Update for a job no longer registered, skipping");
            return Ok(());
        };
        self.emit(
            JobEvent::new(JobEventKind::Updated, *uuid, job.header.name.as_str())
                .with_task_count(job.task_count),
        );
        Ok(())
    }

    pub fn job_ended(&self, header: &JobHeader, elapsed: Option<Duration>) -> Result<()> {
        let mut registry = self.registry.lock()?;
        let task_count = registry
            .jobs
            .remove(&header.uuid)
            .map(|job| job.task_count)
            .unwrap_or_default();
        self.emit(
            JobEvent::new(JobEventKind::Ended, header.uuid, header.name.as_str())
                .with_task_count(task_count)
                .with_elapsed(elapsed),
        );
        Ok(())
    }

    pub fn node_connected(&self, channel: ChannelId) -> Result<()> {
        self.registry.lock()?.nodes.insert(
            channel,
            NodeEntry {
                connected_at: Utc::now(),
                system_info: None,
            },
        );
        Ok(())
    }

    pub fn node_info_updated(&self, channel: ChannelId, info: SystemInfo) -> Result<()> {
        if let Some(node) = self.registry.lock()?.nodes.get_mut(&channel) {
            node.system_info = Some(info);
        }
        Ok(())
    }

    pub fn node_disconnected(&self, channel: ChannelId) -> Result<()> {
        self.registry.lock()?.nodes.remove(&channel);
        Ok(())
    }

    /// Channels currently holding a sub-bundle of the job.
    pub fn nodes_for_job(&self, uuid: &Uuid) -> Result<Vec<ChannelId>> {
        let registry = self.registry.lock()?;
        let mut channels: Vec<ChannelId> = registry
            .jobs
            .get(uuid)
            .map(|job| job.dispatched.iter().map(|d| d.channel).collect())
            .unwrap_or_default();
        channels.sort();
        channels.dedup();
        Ok(channels)
    }

    /// Every registered job, oldest first.
    pub fn all_job_ids(&self) -> Result<Vec<Uuid>> {
        Ok(self
            .all_jobs()?
            .into_iter()
            .map(|job| job.uuid)
            .collect())
    }

    pub fn all_jobs(&self) -> Result<Vec<JobSnapshot>> {
        let registry = self.registry.lock()?;
        let mut jobs: Vec<JobSnapshot> = registry.jobs.values().map(JobEntry::snapshot).collect();
        jobs.sort_by_key(|job| job.queued_at);
        Ok(jobs)
    }

    pub fn job_snapshot(&self, uuid: &Uuid) -> Result<Option<JobSnapshot>> {
        Ok(self.registry.lock()?.jobs.get(uuid).map(JobEntry::snapshot))
    }

    pub fn jobs_for_node(&self, channel: ChannelId) -> Result<Vec<Uuid>> {
        Ok(self.registry.lock()?.jobs_for_node(channel))
    }

    pub fn nodes(&self) -> Result<Vec<NodeSnapshot>> {
        let registry = self.registry.lock()?;
        Ok(registry
            .nodes
            .iter()
            .map(|(channel, node)| NodeSnapshot {
                channel: *channel,
                connected_at: node.connected_at,
                system_info: node.system_info.clone(),
                jobs: registry.jobs_for_node(*channel),
            })
            .collect())
    }
}

fn deliver_events(mut events: mpsc::UnboundedReceiver<JobEvent>, listeners: Listeners) {
    while let Some(event) = events.blocking_recv() {
        // snapshot so listeners can add or remove listeners while being called
        let current: Vec<Arc<dyn JobListener>> = listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in current {
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(&event)));
            if delivered.is_err() {
                tracing::warn!(
                    job_id = %event.job_uuid,
                    kind = ?event.kind,
                    "Job listener panicked, continuing with the next one"
                );
            }
        }
    }
    tracing::debug!("Job event delivery stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc as std_mpsc;
    use std::sync::Weak;

    use bytes::Bytes;

    use super::*;
    use crate::scheduler::{Job, JobQueue};

    const WAIT: Duration = Duration::from_secs(5);

    struct Panicking;

    impl JobListener for Panicking {
        fn on_event(&self, _event: &JobEvent) {
            panic!("listener failure");
        }
    }

    /// On its first event, unregisters itself and registers `successor`.
    struct Handover {
        manager: Weak<JobManager>,
        own_id: Mutex<Option<ListenerId>>,
        successor: Mutex<Option<Arc<dyn JobListener>>>,
        calls: AtomicUsize,
    }

    impl JobListener for Handover {
        fn on_event(&self, _event: &JobEvent) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let Some(manager) = self.manager.upgrade() else {
                return;
            };
            if let Some(id) = self.own_id.lock().unwrap().take() {
                assert!(manager.remove_listener(id).unwrap());
            }
            if let Some(successor) = self.successor.lock().unwrap().take() {
                manager.add_listener(successor).unwrap();
            }
        }
    }

    fn sink() -> (Arc<dyn JobListener>, std_mpsc::Receiver<JobEvent>) {
        let (tx, rx) = std_mpsc::channel();
        let tx = Mutex::new(tx);
        let listener: Arc<dyn JobListener> = Arc::new(move |event: &JobEvent| {
            let _ = tx.lock().unwrap().send(event.clone());
        });
        (listener, rx)
    }

    fn recorder(manager: &JobManager) -> std_mpsc::Receiver<JobEvent> {
        let (listener, rx) = sink();
        manager.add_listener(listener).unwrap();
        rx
    }

    fn queued(tasks: usize) -> (JobQueue, Arc<JobHeader>) {
        let queue = JobQueue::new();
        let job = Job::new("render", (0..tasks).map(|i| Bytes::from(vec![i as u8])).collect());
        let header = Arc::new(job.header.clone());
        queue.add_job(job, None).unwrap();
        (queue, header)
    }

    #[test]
    fn events_arrive_in_lifecycle_order() {
        let manager = JobManager::new().unwrap();
        let events = recorder(&manager);
        let (queue, header) = queued(4);
        let channel = ChannelId::from(3);

        manager.job_queued(&header, 4).unwrap();
        let bundle = queue.next_bundle_for(channel, 4).unwrap().unwrap();
        manager.job_dispatched(&bundle, channel).unwrap();
        assert_eq!(manager.nodes_for_job(&header.uuid).unwrap(), vec![channel]);
        manager
            .job_returned(&bundle, channel, Some(Duration::from_millis(5)))
            .unwrap();
        manager.job_ended(&header, None).unwrap();

        let kinds: Vec<JobEventKind> = (0..4)
            .map(|_| events.recv_timeout(WAIT).unwrap().kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                JobEventKind::Queued,
                JobEventKind::Dispatched,
                JobEventKind::Returned,
                JobEventKind::Ended,
            ]
        );
        assert!(manager.all_job_ids().unwrap().is_empty());
    }

    #[test]
    fn panicking_listener_does_not_stop_delivery() {
        let manager = JobManager::new().unwrap();
        manager.add_listener(Arc::new(Panicking)).unwrap();
        let events = recorder(&manager);
        let (_, header) = queued(1);

        manager.job_queued(&header, 1).unwrap();
        manager.job_updated(&header.uuid).unwrap();

        assert_eq!(events.recv_timeout(WAIT).unwrap().kind, JobEventKind::Queued);
        assert_eq!(events.recv_timeout(WAIT).unwrap().kind, JobEventKind::Updated);
    }

    #[test]
    fn removed_listener_gets_nothing_more() {
        let manager = JobManager::new().unwrap();
        let (tx, rx) = std_mpsc::channel();
        let tx = Mutex::new(tx);
        let id = manager
            .add_listener(Arc::new(move |event: &JobEvent| {
                let _ = tx.lock().unwrap().send(event.kind);
            }))
            .unwrap();
        let control = recorder(&manager);
        let (_, header) = queued(1);

        assert!(manager.remove_listener(id).unwrap());
        assert!(!manager.remove_listener(id).unwrap());
        manager.job_queued(&header, 1).unwrap();
        control.recv_timeout(WAIT).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn listener_can_swap_listeners_during_delivery() {
        let manager = Arc::new(JobManager::new().unwrap());
        let steady = recorder(&manager);
        let (successor, late) = sink();
        let handover = Arc::new(Handover {
            manager: Arc::downgrade(&manager),
            own_id: Mutex::new(None),
            successor: Mutex::new(Some(successor)),
            calls: AtomicUsize::new(0),
        });
        let id = manager.add_listener(handover.clone()).unwrap();
        *handover.own_id.lock().unwrap() = Some(id);
        let (_, first) = queued(1);
        let (_, second) = queued(1);

        manager.job_queued(&first, 1).unwrap();
        assert_eq!(steady.recv_timeout(WAIT).unwrap().job_uuid, first.uuid);
        manager.job_queued(&second, 1).unwrap();
        manager.job_updated(&second.uuid).unwrap();

        assert_eq!(steady.recv_timeout(WAIT).unwrap().job_uuid, second.uuid);
        assert_eq!(steady.recv_timeout(WAIT).unwrap().kind, JobEventKind::Updated);
        // registered mid-delivery, so it starts with the next event
        let seen = late.recv_timeout(WAIT).unwrap();
        assert_eq!((seen.kind, seen.job_uuid), (JobEventKind::Queued, second.uuid));
        assert_eq!(late.recv_timeout(WAIT).unwrap().kind, JobEventKind::Updated);
        assert_eq!(handover.calls.load(Ordering::SeqCst), 1);
        assert!(!manager.remove_listener(id).unwrap());
    }

    #[test]
    fn snapshots_track_nodes_and_dispatches() {
        let manager = JobManager::new().unwrap();
        let (queue, header) = queued(6);
        let a = ChannelId::from(1);
        let b = ChannelId::from(2);
        manager.node_connected(a).unwrap();
        manager.node_connected(b).unwrap();
        manager
            .node_info_updated(b, SystemInfo::local("node-b", 4))
            .unwrap();
        manager.job_queued(&header, 6).unwrap();

        let first = queue.next_bundle_for(a, 2).unwrap().unwrap();
        manager.job_dispatched(&first, a).unwrap();
        let second = queue.next_bundle_for(b, 2).unwrap().unwrap();
        manager.job_dispatched(&second, b).unwrap();

        assert_eq!(manager.nodes_for_job(&header.uuid).unwrap(), vec![a, b]);
        assert_eq!(manager.jobs_for_node(a).unwrap(), vec![header.uuid]);
        let snapshot = manager.job_snapshot(&header.uuid).unwrap().unwrap();
        assert_eq!(snapshot.task_count, 6);
        assert_eq!(snapshot.dispatched.len(), 2);

        manager.job_returned(&first, a, None).unwrap();
        assert!(manager.jobs_for_node(a).unwrap().is_empty());

        let nodes = manager.nodes().unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[1].jobs, vec![header.uuid]);
        assert_eq!(
            nodes[1].system_info.as_ref().map(|i| i.node_uuid.as_str()),
            Some("node-b")
        );

        manager.node_disconnected(a).unwrap();
        assert_eq!(manager.nodes().unwrap().len(), 1);
    }

    #[test]
    fn updating_ended_job_is_skipped() {
        let manager = JobManager::new().unwrap();
        let events = recorder(&manager);
        let (_, header) = queued(1);
        let (_, next) = queued(1);

        manager.job_queued(&header, 1).unwrap();
        manager.job_ended(&header, None).unwrap();
        manager.job_updated(&header.uuid).unwrap();
        manager.job_updated(&Uuid::new_v4()).unwrap();
        manager.job_queued(&next, 1).unwrap();

        assert_eq!(events.recv_timeout(WAIT).unwrap().kind, JobEventKind::Queued);
        assert_eq!(events.recv_timeout(WAIT).unwrap().kind, JobEventKind::Ended);
        let after = events.recv_timeout(WAIT).unwrap();
        assert_eq!(after.kind, JobEventKind::Queued);
        assert_eq!(after.job_uuid, next.uuid);
    }
}
