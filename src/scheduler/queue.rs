use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Range;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::id::ChannelId;
use crate::scheduler::job::{
    BundleOutcome, Job, JobHeader, JobPayload, JobResults, SubBundle, TaskOutcome,
};

/// Fired exactly once with the aggregated results of a job.
pub type CompletionListener = oneshot::Sender<JobResults>;

/// Higher priority first, then arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: Reverse<i32>,
    seq: u64,
}

/// A dispatched sub-bundle and the node channel holding it.
#[derive(Debug)]
struct InFlight {
    channel: ChannelId,
    task_count: usize,
}

#[derive(Debug)]
struct QueuedJob {
    header: Arc<JobHeader>,
    payload: Arc<JobPayload>,
    key: QueueKey,
    /// Task ranges not dispatched yet, requeued ranges go to the front
    pending: VecDeque<Range<usize>>,
    remaining: usize,
    in_flight: HashMap<Uuid, InFlight>,
    outcomes: Vec<Option<TaskOutcome>>,
    returned: usize,
    suspended: bool,
    cancelled: bool,
    queued_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    listener: Option<CompletionListener>,
}

impl QueuedJob {
    fn is_dispatchable(&self) -> bool {
        !self.suspended
            && !self.cancelled
            && self.remaining > 0
            && self.header.sla.allows_nodes(self.in_flight.len())
    }

    fn is_finished(&self) -> bool {
        self.remaining == 0 && self.in_flight.is_empty()
    }

    fn in_flight_tasks(&self) -> usize {
        self.in_flight.values().map(|b| b.task_count).sum()
    }

    fn in_flight_channels(&self) -> Vec<ChannelId> {
        let mut channels: Vec<ChannelId> = self.in_flight.values().map(|b| b.channel).collect();
        channels.sort();
        channels.dedup();
        channels
    }

    fn record(&mut self, position: usize, outcome: TaskOutcome) {
        if let Some(slot) = self.outcomes.get_mut(position) {
            if slot.replace(outcome).is_none() {
                self.returned += 1;
            }
        }
    }

    fn info(&self) -> QueuedJobInfo {
        QueuedJobInfo {
            uuid: self.header.uuid,
            name: self.header.name.clone(),
            priority: self.header.priority,
            initial_tasks: self.payload.tasks.len(),
            remaining_tasks: self.remaining,
            in_flight_tasks: self.in_flight_tasks(),
            in_flight_bundles: self.in_flight.len(),
            in_flight_channels: self.in_flight_channels(),
            returned_tasks: self.returned,
            suspended: self.suspended,
            cancelled: self.cancelled,
            queued_at: self.queued_at,
            started_at: self.started_at,
        }
    }

    fn into_completed(self) -> CompletedJob {
        let payload = &self.payload;
        let outcomes = self
            .outcomes
            .into_iter()
            .enumerate()
            .map(|(i, outcome)| {
                outcome.unwrap_or_else(|| TaskOutcome::Cancelled(payload.tasks[i].clone()))
            })
            .collect();
        CompletedJob {
            results: JobResults {
                job_uuid: self.header.uuid,
                name: self.header.name.clone(),
                outcomes,
            },
            header: self.header,
            queued_at: self.queued_at,
            started_at: self.started_at,
            listener: self.listener,
        }
    }
}

/// A job that left the queue for good. Whoever receives it owns the only
/// completion listener of that job.
#[derive(Debug)]
pub struct CompletedJob {
    pub header: Arc<JobHeader>,
    pub results: JobResults,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    listener: Option<CompletionListener>,
}

impl CompletedJob {
    /// Deliver the results. Returns false if nobody is waiting anymore.
    pub fn notify(self) -> bool {
        match self.listener {
            Some(listener) => listener.send(self.results).is_ok(),
            None => false,
        }
    }
}

/// Read-only view of a queued job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueuedJobInfo {
    pub uuid: Uuid,
    pub name: String,
    pub priority: i32,
    pub initial_tasks: usize,
    pub remaining_tasks: usize,
    pub in_flight_tasks: usize,
    pub in_flight_bundles: usize,
    /// Node channels holding a sub-bundle of the job
    pub in_flight_channels: Vec<ChannelId>,
    pub returned_tasks: usize,
    pub suspended: bool,
    pub cancelled: bool,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct QueueState {
    order: BTreeMap<QueueKey, Uuid>,
    jobs: HashMap<Uuid, QueuedJob>,
    next_seq: u64,
    schedules: HashMap<Uuid, Vec<JoinHandle<()>>>,
}

impl QueueState {
    fn job_mut(&mut self, uuid: &Uuid) -> Result<&mut QueuedJob> {
        self.jobs
            .get_mut(uuid)
            .ok_or(DispatchError::JobNotFound(*uuid))
    }

    fn remove_if_finished(&mut self, uuid: &Uuid) -> Option<CompletedJob> {
        if !self.jobs.get(uuid)?.is_finished() {
            return None;
        }
        let job = self.jobs.remove(uuid)?;
        self.order.remove(&job.key);
        Some(job.into_completed())
    }
}

/// Priority-ordered holding area for jobs and their remaining tasks.
///
/// Every operation runs under one mutex, so a bundle size applied by
/// [`JobQueue::next_bundle_for`] always sees the current remaining count.
#[derive(Debug)]
pub struct JobQueue {
    state: Mutex<QueueState>,
    work: watch::Sender<u64>,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        let (work, _) = watch::channel(0);
        Self {
            state: Mutex::new(QueueState::default()),
            work,
        }
    }

    /// Receiver that changes whenever new work may be available.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.work.subscribe()
    }

    fn signal_work(&self) {
        self.work.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Add a job behind every job of higher or equal priority.
    ///
    /// A job without tasks is finished on arrival and handed straight back.
    pub fn add_job(
        &self,
        job: Job,
        listener: Option<CompletionListener>,
    ) -> Result<Option<CompletedJob>> {
        let mut state = self.state.lock()?;
        let uuid = job.uuid();
        if state.jobs.contains_key(&uuid) {
            return Err(DispatchError::DuplicateJob(uuid));
        }
        let task_count = job.task_count();
        let key = QueueKey {
            priority: Reverse(job.header.priority),
            seq: state.next_seq,
        };
        state.next_seq += 1;
        let queued = QueuedJob {
            suspended: job.header.sla.suspended,
            header: Arc::new(job.header),
            payload: Arc::new(job.payload),
            key,
            pending: if task_count > 0 {
                VecDeque::from([0..task_count])
            } else {
                VecDeque::new()
            },
            remaining: task_count,
            in_flight: HashMap::new(),
            outcomes: vec![None; task_count],
            returned: 0,
            cancelled: false,
            queued_at: Utc::now(),
            started_at: None,
            listener,
        };
        if task_count == 0 {
            return Ok(Some(queued.into_completed()));
        }
        tracing::debug!(job_id = %uuid, tasks = task_count, "Job added to queue");
        state.order.insert(key, uuid);
        state.jobs.insert(uuid, queued);
        drop(state);
        self.signal_work();
        Ok(None)
    }

    /// Carve up to `size` tasks off the highest-priority dispatchable job.
    pub fn next_bundle_for(&self, channel: ChannelId, size: usize) -> Result<Option<SubBundle>> {
        let mut state = self.state.lock()?;
        let QueueState { order, jobs, .. } = &mut *state;
        let selected = order
            .values()
            .copied()
            .find(|uuid| jobs.get(uuid).is_some_and(QueuedJob::is_dispatchable));
        let Some(job) = selected.and_then(|uuid| jobs.get_mut(&uuid)) else {
            return Ok(None);
        };

        // broadcast: one node runs every remaining task
        let take = if job.header.sla.broadcast {
            job.remaining
        } else {
            size.max(1).min(job.remaining)
        };
        let ranges = carve(&mut job.pending, take);
        job.remaining -= take;
        job.started_at.get_or_insert_with(Utc::now);

        let bundle = SubBundle {
            id: Uuid::new_v4(),
            header: Arc::clone(&job.header),
            payload: Arc::clone(&job.payload),
            ranges,
        };
        job.in_flight.insert(
            bundle.id,
            InFlight {
                channel,
                task_count: take,
            },
        );
        tracing::debug!(
            job_id = %job.header.uuid,
            channel = %channel,
            tasks = take,
            remaining = job.remaining,
            "Bundle carved"
        );
        Ok(Some(bundle))
    }

    /// Put an in-flight bundle's tasks back in front of the job's pending work.
    ///
    /// The job keeps its place in the priority order. If the job was
    /// cancelled meanwhile the tasks are closed out instead, which may finish it.
    pub fn requeue(&self, bundle: &SubBundle, suspend: bool) -> Result<Option<CompletedJob>> {
        let mut state = self.state.lock()?;
        let uuid = bundle.job_uuid();
        let job = state.job_mut(&uuid)?;
        if job.in_flight.remove(&bundle.id).is_none() {
            return Err(DispatchError::Internal(format!(
                "bundle {} of job {uuid} is not in flight",
                bundle.id
            )));
        }
        if job.cancelled {
            for position in bundle.positions() {
                let task = job.payload.tasks[position].clone();
                job.record(position, TaskOutcome::Cancelled(task));
            }
            return Ok(state.remove_if_finished(&uuid));
        }
        for range in bundle.ranges.iter().rev() {
            job.pending.push_front(range.clone());
        }
        job.remaining += bundle.task_count();
        if suspend {
            job.suspended = true;
        }
        tracing::debug!(
            job_id = %uuid,
            tasks = bundle.task_count(),
            remaining = job.remaining,
            suspended = job.suspended,
            "Bundle requeued"
        );
        drop(state);
        self.signal_work();
        Ok(None)
    }

    /// Merge a returned bundle into its job. Returns the job once nothing is
    /// left to dispatch and no bundle is outstanding.
    pub fn bundle_returned(
        &self,
        bundle: &SubBundle,
        outcome: BundleOutcome,
    ) -> Result<Option<CompletedJob>> {
        let mut state = self.state.lock()?;
        let uuid = bundle.job_uuid();
        let job = state.job_mut(&uuid)?;
        if let Some(count) = outcome.result_count() {
            if count != bundle.task_count() {
                return Err(DispatchError::Protocol(format!(
                    "bundle {} returned {count} results for {} tasks",
                    bundle.id,
                    bundle.task_count()
                )));
            }
        }
        if job.in_flight.remove(&bundle.id).is_none() {
            return Err(DispatchError::Internal(format!(
                "bundle {} of job {uuid} is not in flight",
                bundle.id
            )));
        }

        // a cancelled job must not surface partial results as final
        let cancelled = job.cancelled;
        match outcome {
            BundleOutcome::Executed(results) => {
                for (position, result) in bundle.positions().zip(results) {
                    let outcome = if cancelled {
                        TaskOutcome::Cancelled(job.payload.tasks[position].clone())
                    } else {
                        TaskOutcome::Completed(result)
                    };
                    job.record(position, outcome);
                }
            }
            BundleOutcome::PartiallyExecuted(results) => {
                for (position, result) in bundle.positions().zip(results) {
                    let task = job.payload.tasks[position].clone();
                    let outcome = match result {
                        _ if cancelled => TaskOutcome::Cancelled(task),
                        Ok(result) => TaskOutcome::Completed(result),
                        Err(reason) => TaskOutcome::Failed { task, reason },
                    };
                    job.record(position, outcome);
                }
            }
            BundleOutcome::NodeExecutionFailed(reason) => {
                for position in bundle.positions() {
                    let task = job.payload.tasks[position].clone();
                    let outcome = if cancelled {
                        TaskOutcome::Cancelled(task)
                    } else {
                        TaskOutcome::Failed {
                            task,
                            reason: reason.clone(),
                        }
                    };
                    job.record(position, outcome);
                }
            }
        }

        let completed = state.remove_if_finished(&uuid);
        drop(state);
        // a freed node slot may make the job dispatchable again
        self.signal_work();
        Ok(completed)
    }

    /// Stop dispatching a job. Undispatched tasks come back as cancelled; the
    /// job finishes once its outstanding bundles have returned.
    pub fn cancel_job(&self, uuid: &Uuid) -> Result<Option<CompletedJob>> {
        let mut state = self.state.lock()?;
        let job = state.job_mut(uuid)?;
        if job.cancelled {
            return Ok(None);
        }
        job.cancelled = true;
        let pending: Vec<Range<usize>> = job.pending.drain(..).collect();
        for position in pending.into_iter().flatten() {
            let task = job.payload.tasks[position].clone();
            job.record(position, TaskOutcome::Cancelled(task));
        }
        job.remaining = 0;
        tracing::info!(job_id = %uuid, outstanding = job.in_flight.len(), "Job cancelled");
        Ok(state.remove_if_finished(uuid))
    }

    pub fn set_suspended(&self, uuid: &Uuid, suspended: bool) -> Result<()> {
        let mut state = self.state.lock()?;
        state.job_mut(uuid)?.suspended = suspended;
        drop(state);
        if !suspended {
            self.signal_work();
        }
        Ok(())
    }

    /// Remember a timer attached to a job so it can be cancelled on completion.
    pub fn schedule_expiration(&self, uuid: Uuid, timer: JoinHandle<()>) -> Result<()> {
        let mut state = self.state.lock()?;
        if !state.jobs.contains_key(&uuid) {
            timer.abort();
            return Ok(());
        }
        state.schedules.entry(uuid).or_default().push(timer);
        Ok(())
    }

    /// Abort every pending timer of a job. Returns how many were aborted.
    pub fn clear_schedules(&self, uuid: &Uuid) -> Result<usize> {
        let timers = self.state.lock()?.schedules.remove(uuid).unwrap_or_default();
        let count = timers.len();
        for timer in timers {
            timer.abort();
        }
        Ok(count)
    }

    pub fn job_info(&self, uuid: &Uuid) -> Result<Option<QueuedJobInfo>> {
        Ok(self.state.lock()?.jobs.get(uuid).map(QueuedJob::info))
    }

    /// All tracked jobs in dispatch order.
    pub fn snapshot(&self) -> Result<Vec<QueuedJobInfo>> {
        let state = self.state.lock()?;
        Ok(state
            .order
            .values()
            .filter_map(|uuid| state.jobs.get(uuid))
            .map(QueuedJob::info)
            .collect())
    }

    /// Number of jobs still tracked by the queue.
    pub fn depth(&self) -> Result<usize> {
        Ok(self.state.lock()?.jobs.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.depth()? == 0)
    }
}

fn carve(pending: &mut VecDeque<Range<usize>>, mut count: usize) -> Vec<Range<usize>> {
    let mut ranges = Vec::new();
    while count > 0 {
        let Some(front) = pending.pop_front() else {
            break;
        };
        if front.len() <= count {
            count -= front.len();
            ranges.push(front);
        } else {
            let split = front.start + count;
            ranges.push(front.start..split);
            pending.push_front(split..front.end);
            count = 0;
        }
    }
    ranges
}
