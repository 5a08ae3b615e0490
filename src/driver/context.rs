use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::bundler::{Bundler, LoadBalancer};
use crate::config::DriverConfig;
use crate::driver::stats::DriverStatistics;
use crate::error::Result;
use crate::id::{ChannelId, IdGenerator};
use crate::manager::JobManager;
use crate::scheduler::{BundleOutcome, CompletedJob, CompletionListener, Job, JobQueue, SubBundle};

/// State shared by every channel of one driver.
///
/// The queue, the manager registry and the proportional performance table
/// each have their own lock. Methods here call them one after another and
/// never hold two at once.
#[derive(Debug)]
pub struct DispatchContext {
    pub driver_uuid: String,
    pub queue: JobQueue,
    pub manager: JobManager,
    pub load_balancer: LoadBalancer,
    pub stats: DriverStatistics,
    pub max_frame_len: usize,
    ids: IdGenerator,
}

impl DispatchContext {
    pub fn new(config: &DriverConfig) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            driver_uuid: Uuid::new_v4().to_string(),
            queue: JobQueue::new(),
            manager: JobManager::new()?,
            load_balancer: LoadBalancer::new(config.load_balancer.clone())?,
            stats: DriverStatistics::new(),
            max_frame_len: config.max_frame_len,
            ids: IdGenerator::new(),
        }))
    }

    pub fn next_channel_id(&self) -> ChannelId {
        self.ids.next_channel()
    }

    /// Register and enqueue a job. The queued event is published before the
    /// job can be dispatched.
    pub fn submit(self: &Arc<Self>, job: Job, listener: Option<CompletionListener>) -> Result<()> {
        let uuid = job.uuid();
        let header = Arc::new(job.header.clone());
        let task_count = job.task_count();
        self.manager.job_queued(&header, task_count)?;
        let completed = match self.queue.add_job(job, listener) {
            Ok(completed) => completed,
            Err(e) => {
                self.manager.job_rejected(&uuid)?;
                return Err(e);
            }
        };
        self.stats.job_queued();
        tracing::info!(
            job_id = %uuid,
            name = %header.name,
            priority = header.priority,
            tasks = task_count,
            "Job queued"
        );

        if let Some(completed) = completed {
            return self.finish_job(completed);
        }
        if let Some(expiration_ms) = header.sla.expiration_ms {
            self.schedule_expiration(uuid, Duration::from_millis(expiration_ms))?;
        }
        Ok(())
    }

    fn schedule_expiration(self: &Arc<Self>, uuid: Uuid, after: Duration) -> Result<()> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(job_id = %uuid, "No runtime to schedule job expiration on");
            return Ok(());
        };
        let context: Weak<Self> = Arc::downgrade(self);
        let timer = runtime.spawn(async move {
            tokio::time::sleep(after).await;
            let Some(context) = context.upgrade() else {
                return;
            };
            tracing::info!(job_id = %uuid, "Job expired");
            if let Err(e) = context.cancel_job(&uuid) {
                tracing::debug!(job_id = %uuid, error = %e, "Expired job already gone");
            }
        });
        self.queue.schedule_expiration(uuid, timer)
    }

    /// Carve the next bundle for `channel`, sized by its bundler.
    pub fn next_bundle(&self, channel: ChannelId, bundler: &dyn Bundler) -> Result<Option<SubBundle>> {
        // sized outside the queue lock
        let size = bundler.next_size();
        let Some(bundle) = self.queue.next_bundle_for(channel, size)? else {
            return Ok(None);
        };
        self.manager.job_dispatched(&bundle, channel)?;
        self.stats.bundle_dispatched(bundle.task_count());
        Ok(Some(bundle))
    }

    /// Merge a bundle's results into its job, finishing the job if it was the last.
    pub fn bundle_returned(
        &self,
        bundle: &SubBundle,
        channel: ChannelId,
        outcome: BundleOutcome,
        elapsed: Duration,
    ) -> Result<()> {
        self.manager.job_returned(bundle, channel, Some(elapsed))?;
        if let Some(completed) = self.queue.bundle_returned(bundle, outcome)? {
            self.finish_job(completed)?;
        }
        Ok(())
    }

    /// Hand a bundle's tasks back to the queue. `suspend` parks the job.
    pub fn requeue(&self, bundle: &SubBundle, channel: ChannelId, suspend: bool) -> Result<()> {
        self.manager.job_returned(bundle, channel, None)?;
        self.stats.bundle_requeued();
        let completed = self.queue.requeue(bundle, suspend)?;
        if suspend {
            self.manager.job_updated(&bundle.job_uuid())?;
        }
        if let Some(completed) = completed {
            self.finish_job(completed)?;
        }
        Ok(())
    }

    pub fn cancel_job(&self, uuid: &Uuid) -> Result<()> {
        let completed = self.queue.cancel_job(uuid)?;
        self.manager.job_updated(uuid)?;
        if let Some(completed) = completed {
            self.finish_job(completed)?;
        }
        Ok(())
    }

    pub fn set_suspended(&self, uuid: &Uuid, suspended: bool) -> Result<()> {
        self.queue.set_suspended(uuid, suspended)?;
        self.manager.job_updated(uuid)?;
        tracing::info!(job_id = %uuid, suspended, "Job suspension changed");
        Ok(())
    }

    fn finish_job(&self, completed: CompletedJob) -> Result<()> {
        let uuid = completed.header.uuid;
        self.queue.clear_schedules(&uuid)?;
        let elapsed = (Utc::now() - completed.queued_at).to_std().ok();
        self.manager.job_ended(&completed.header, elapsed)?;
        self.stats.job_ended();
        let completed_tasks = completed.results.completed_count();
        let total_tasks = completed.results.outcomes.len();
        if completed.notify() {
            tracing::info!(
                job_id = %uuid,
                completed = completed_tasks,
                tasks = total_tasks,
                "Job ended"
            );
        } else {
            tracing::debug!(job_id = %uuid, "Job ended with nobody waiting for results");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::sync::oneshot;

    use super::*;
    use crate::bundler::{FixedBundler, FixedSettings};
    use crate::protocol::JobSla;
    use crate::scheduler::TaskOutcome;

    fn context() -> Arc<DispatchContext> {
        DispatchContext::new(&DriverConfig::default()).unwrap()
    }

    fn job(tasks: usize) -> Job {
        Job::new("ctx", (0..tasks).map(|i| Bytes::from(format!("t{i}"))).collect())
    }

    #[test]
    fn empty_job_completes_on_submit() {
        let context = context();
        let (tx, mut rx) = oneshot::channel();
        context.submit(job(0), Some(tx)).unwrap();
        let results = rx.try_recv().unwrap();
        assert!(results.outcomes.is_empty());
        assert_eq!(context.queue.depth().unwrap(), 0);
        assert!(context.manager.all_job_ids().unwrap().is_empty());
    }

    #[test]
    fn duplicate_submission_is_rejected_and_first_job_kept() {
        let context = context();
        let first = job(2);
        let duplicate = first.clone();
        context.submit(first, None).unwrap();
        assert!(context.submit(duplicate, None).is_err());
        assert_eq!(context.queue.depth().unwrap(), 1);
        assert_eq!(context.manager.all_job_ids().unwrap().len(), 1);
    }

    #[test]
    fn cancel_finishes_undispatched_job() {
        let context = context();
        let job = job(3);
        let uuid = job.uuid();
        let (tx, mut rx) = oneshot::channel();
        context.submit(job, Some(tx)).unwrap();
        context.cancel_job(&uuid).unwrap();
        let results = rx.try_recv().unwrap();
        assert!(results
            .outcomes
            .iter()
            .all(|o| matches!(o, TaskOutcome::Cancelled(_))));
        assert_eq!(results.outcomes[1].payload(), &Bytes::from("t1"));
    }

    #[test]
    fn requeue_with_suspend_parks_the_job() {
        let context = context();
        let job = job(4);
        let uuid = job.uuid();
        context.submit(job, None).unwrap();
        let channel = context.next_channel_id();
        let bundler = FixedBundler::new(FixedSettings { size: 3 });
        let bundle = context.next_bundle(channel, &bundler).unwrap().unwrap();
        assert_eq!(bundle.task_count(), 3);

        context.requeue(&bundle, channel, true).unwrap();
        assert!(context.next_bundle(channel, &bundler).unwrap().is_none());
        let info = context.queue.job_info(&uuid).unwrap().unwrap();
        assert!(info.suspended);
        assert_eq!(info.remaining_tasks, 4);

        context.set_suspended(&uuid, false).unwrap();
        assert!(context.next_bundle(channel, &bundler).unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_job_comes_back_cancelled() {
        let context = context();
        let job = job(2).with_sla(JobSla {
            expiration_ms: Some(20),
            ..JobSla::default()
        });
        let (tx, rx) = oneshot::channel();
        context.submit(job, Some(tx)).unwrap();
        let results = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(results.completed_count(), 0);
        assert_eq!(context.queue.depth().unwrap(), 0);
    }
}
