use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::id::ChannelId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    /// The job entered the queue
    Queued,
    /// A sub-bundle was sent to a node
    Dispatched,
    /// A sub-bundle came back from a node, with results or through a requeue
    Returned,
    /// The job was suspended, resumed or cancelled
    Updated,
    /// The job left the driver and its results were handed over
    Ended,
}

/// Lifecycle notification for one job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobEvent {
    pub kind: JobEventKind,
    pub job_uuid: Uuid,
    pub job_name: String,
    /// Node channel involved, for dispatch and return events
    pub channel: Option<ChannelId>,
    pub task_count: usize,
    /// Round trip of a returned bundle, or the whole lifetime of an ended job
    pub elapsed: Option<Duration>,
    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    pub(crate) fn new(kind: JobEventKind, job_uuid: Uuid, job_name: impl Into<String>) -> Self {
        Self {
            kind,
            job_uuid,
            job_name: job_name.into(),
            channel: None,
            task_count: 0,
            elapsed: None,
            timestamp: Utc::now(),
        }
    }

    pub(crate) fn with_channel(mut self, channel: ChannelId) -> Self {
        self.channel = Some(channel);
        self
    }

    pub(crate) fn with_task_count(mut self, task_count: usize) -> Self {
        self.task_count = task_count;
        self
    }

    pub(crate) fn with_elapsed(mut self, elapsed: Option<Duration>) -> Self {
        self.elapsed = elapsed;
        self
    }
}

/// Receives job lifecycle events on the manager's delivery thread.
///
/// Events of one job arrive in the order they happened. Implementations
/// should return quickly; a slow listener delays every later event.
pub trait JobListener: Send + Sync {
    fn on_event(&self, event: &JobEvent);
}

impl<F> JobListener for F
where
    F: Fn(&JobEvent) + Send + Sync,
{
    fn on_event(&self, event: &JobEvent) {
        self(event)
    }
}
