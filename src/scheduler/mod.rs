pub mod job;
pub mod queue;

pub use job::{
    BundleOutcome, Job, JobHeader, JobPayload, JobResults, SubBundle, TaskOutcome,
    TaskStatus,
};
pub use queue::{CompletedJob, CompletionListener, JobQueue, QueuedJobInfo};
