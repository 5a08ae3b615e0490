use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::protocol::{BundleHeader, JobSla, Message, Parameter};

/// Immutable description of a job, shared by the job and all its sub-bundles.
#[derive(Debug, Clone, PartialEq)]
pub struct JobHeader {
    pub uuid: Uuid,
    pub name: String,
    pub priority: i32,
    pub sla: JobSla,
    pub metadata: BTreeMap<String, String>,
    /// Provenance chain, one entry per hop the job went through
    pub uuid_path: Vec<String>,
    pub received_at: Option<DateTime<Utc>>,
}

impl JobHeader {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: name.into(),
            priority: 0,
            sla: JobSla::default(),
            metadata: BTreeMap::new(),
            uuid_path: Vec::new(),
            received_at: None,
        }
    }

    fn from_wire(header: &BundleHeader) -> Result<Self> {
        Ok(Self {
            uuid: header.uuid,
            name: header.name.clone(),
            priority: header.priority,
            sla: header.sla.clone(),
            metadata: header.metadata.clone(),
            uuid_path: header.uuid_path.clone(),
            received_at: header.parameter(Parameter::ReceivedAt)?,
        })
    }

    pub fn to_wire(&self, task_count: usize) -> Result<BundleHeader> {
        let mut header = BundleHeader::new(self.uuid, self.name.clone());
        header.priority = self.priority;
        header.task_count = task_count as i32;
        header.sla = self.sla.clone();
        header.metadata = self.metadata.clone();
        header.uuid_path = self.uuid_path.clone();
        if let Some(received_at) = self.received_at {
            header.set_parameter(Parameter::ReceivedAt, received_at)?;
        }
        Ok(header)
    }
}

/// Task arena of a job. Allocated once; sub-bundles refer into it by index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPayload {
    pub data_provider: Bytes,
    pub tasks: Vec<Bytes>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub header: JobHeader,
    pub payload: JobPayload,
}

impl Job {
    pub fn new(name: impl Into<String>, tasks: Vec<Bytes>) -> Self {
        Self {
            header: JobHeader::new(name),
            payload: JobPayload {
                data_provider: Bytes::new(),
                tasks,
            },
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.header.priority = priority;
        self
    }

    pub fn with_data_provider(mut self, data_provider: Bytes) -> Self {
        self.payload.data_provider = data_provider;
        self
    }

    pub fn with_sla(mut self, sla: JobSla) -> Self {
        self.header.sla = sla;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.metadata.insert(key.into(), value.into());
        self
    }

    pub fn uuid(&self) -> Uuid {
        self.header.uuid
    }

    pub fn task_count(&self) -> usize {
        self.payload.tasks.len()
    }

    pub fn from_message(message: Message) -> Result<Self> {
        let header = JobHeader::from_wire(&message.header)?;
        Ok(Self {
            header,
            payload: JobPayload {
                data_provider: message.data_provider,
                tasks: message.tasks,
            },
        })
    }

    pub fn to_message(&self) -> Result<Message> {
        Ok(Message::new(self.header.to_wire(self.task_count())?)
            .with_data_provider(self.payload.data_provider.clone())
            .with_tasks(self.payload.tasks.clone()))
    }
}

/// A dispatch-sized slice of a job: a fresh identity plus index ranges into
/// the parent's task arena.
#[derive(Debug, Clone)]
pub struct SubBundle {
    pub id: Uuid,
    pub header: Arc<JobHeader>,
    pub payload: Arc<JobPayload>,
    pub ranges: Vec<Range<usize>>,
}

impl SubBundle {
    pub fn job_uuid(&self) -> Uuid {
        self.header.uuid
    }

    pub fn task_count(&self) -> usize {
        self.ranges.iter().map(|r| r.len()).sum()
    }

    /// Positions of this bundle's tasks in the parent job, in wire order.
    pub fn positions(&self) -> impl Iterator<Item = usize> + '_ {
        self.ranges.iter().flat_map(|r| r.clone())
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Bytes> + '_ {
        self.positions().map(|i| &self.payload.tasks[i])
    }

    pub fn to_message(&self) -> Result<Message> {
        let mut header = self.header.to_wire(self.task_count())?;
        header.set_parameter(Parameter::BundleId, self.id)?;
        Ok(Message::new(header)
            .with_data_provider(self.payload.data_provider.clone())
            .with_tasks(self.tasks().cloned().collect()))
    }
}

/// What a node reported for one sub-bundle, decided when its result is read.
#[derive(Debug, Clone, PartialEq)]
pub enum BundleOutcome {
    /// One result per task, in the order the tasks were sent
    Executed(Vec<Bytes>),
    /// The node ran the bundle but some tasks failed, each carrying its reason
    PartiallyExecuted(Vec<std::result::Result<Bytes, String>>),
    /// The node could not run the bundle; tasks keep their original payload
    NodeExecutionFailed(String),
}

impl BundleOutcome {
    /// Pair the statuses a node reported with its returned payloads.
    pub fn from_statuses(statuses: Vec<TaskStatus>, results: Vec<Bytes>) -> Result<Self> {
        if statuses.len() != results.len() {
            return Err(DispatchError::Protocol(format!(
                "{} task statuses for {} results",
                statuses.len(),
                results.len()
            )));
        }
        let results = statuses
            .into_iter()
            .zip(results)
            .map(|(status, result)| match status {
                TaskStatus::Completed => Ok(result),
                TaskStatus::Failed { reason } => Err(reason),
                TaskStatus::Cancelled => Err("cancelled on node".to_string()),
            })
            .collect();
        Ok(BundleOutcome::PartiallyExecuted(results))
    }

    /// Number of results the outcome carries, if any.
    pub fn result_count(&self) -> Option<usize> {
        match self {
            BundleOutcome::Executed(results) => Some(results.len()),
            BundleOutcome::PartiallyExecuted(results) => Some(results.len()),
            BundleOutcome::NodeExecutionFailed(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed(Bytes),
    Failed { task: Bytes, reason: String },
    /// The job was cancelled before this task produced a result
    Cancelled(Bytes),
}

impl TaskOutcome {
    pub fn payload(&self) -> &Bytes {
        match self {
            TaskOutcome::Completed(bytes) => bytes,
            TaskOutcome::Failed { task, .. } => task,
            TaskOutcome::Cancelled(task) => task,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, TaskOutcome::Completed(_))
    }
}

/// Per-task status sent next to task payloads, by nodes and to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskStatus {
    Completed,
    Failed { reason: String },
    Cancelled,
}

/// Aggregated results of a finished job, one outcome per task in submission order.
#[derive(Debug, Clone, PartialEq)]
pub struct JobResults {
    pub job_uuid: Uuid,
    pub name: String,
    pub outcomes: Vec<TaskOutcome>,
}

impl JobResults {
    pub fn completed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_completed()).count()
    }

    pub fn to_message(&self, header: &JobHeader) -> Result<Message> {
        let mut wire = header.to_wire(self.outcomes.len())?;
        let statuses: Vec<TaskStatus> = self
            .outcomes
            .iter()
            .map(|outcome| match outcome {
                TaskOutcome::Completed(_) => TaskStatus::Completed,
                TaskOutcome::Failed { reason, .. } => TaskStatus::Failed {
                    reason: reason.clone(),
                },
                TaskOutcome::Cancelled(_) => TaskStatus::Cancelled,
            })
            .collect();
        wire.set_parameter(Parameter::TaskOutcomes, statuses)?;
        Ok(Message::new(wire).with_tasks(
            self.outcomes
                .iter()
                .map(|outcome| outcome.payload().clone())
                .collect(),
        ))
    }

    pub fn from_message(message: Message) -> Result<Self> {
        let statuses: Vec<TaskStatus> = message
            .header
            .parameter(Parameter::TaskOutcomes)?
            .unwrap_or_else(|| vec![TaskStatus::Completed; message.tasks.len()]);
        if statuses.len() != message.tasks.len() {
            return Err(DispatchError::Protocol(format!(
                "{} task statuses for {} results",
                statuses.len(),
                message.tasks.len()
            )));
        }
        let outcomes = statuses
            .into_iter()
            .zip(message.tasks)
            .map(|(status, payload)| match status {
                TaskStatus::Completed => TaskOutcome::Completed(payload),
                TaskStatus::Failed { reason } => TaskOutcome::Failed {
                    task: payload,
                    reason,
                },
                TaskStatus::Cancelled => TaskOutcome::Cancelled(payload),
            })
            .collect();
        Ok(Self {
            job_uuid: message.header.uuid,
            name: message.header.name,
            outcomes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tasks(n: usize) -> Vec<Bytes> {
        (0..n).map(|i| Bytes::from(format!("t{i}"))).collect()
    }

    #[test]
    fn job_message_roundtrip_keeps_received_at() {
        let mut job = Job::new("render", tasks(3))
            .with_priority(5)
            .with_data_provider(Bytes::from_static(b"dp"))
            .with_metadata("owner", "ops");
        job.header.received_at = Some(Utc::now());

        let back = Job::from_message(job.to_message().unwrap()).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn node_statuses_pair_with_results() {
        let statuses = vec![
            TaskStatus::Completed,
            TaskStatus::Failed {
                reason: "exit 3".to_string(),
            },
        ];
        let outcome =
            BundleOutcome::from_statuses(statuses.clone(), vec![Bytes::from("A"), Bytes::new()])
                .unwrap();
        assert_eq!(
            outcome,
            BundleOutcome::PartiallyExecuted(vec![
                Ok(Bytes::from("A")),
                Err("exit 3".to_string())
            ])
        );
        assert_eq!(outcome.result_count(), Some(2));

        let err = BundleOutcome::from_statuses(statuses, vec![Bytes::from("A")]).unwrap_err();
        assert!(matches!(err, DispatchError::Protocol(_)));
    }

    #[test]
    fn sub_bundle_message_carries_only_its_ranges() {
        let job = Job::new("j", tasks(10));
        let sub = SubBundle {
            id: Uuid::new_v4(),
            header: Arc::new(job.header.clone()),
            payload: Arc::new(job.payload.clone()),
            ranges: vec![7..9, 2..3],
        };
        assert_eq!(sub.task_count(), 3);
        assert_eq!(sub.positions().collect::<Vec<_>>(), vec![7, 8, 2]);

        let message = sub.to_message().unwrap();
        assert_eq!(message.header.task_count, 3);
        assert_eq!(
            message.header.parameter::<Uuid>(Parameter::BundleId).unwrap(),
            Some(sub.id)
        );
        assert_eq!(
            message.tasks,
            vec![Bytes::from("t7"), Bytes::from("t8"), Bytes::from("t2")]
        );
    }

    #[test]
    fn results_message_roundtrip() {
        let header = JobHeader::new("j");
        let results = JobResults {
            job_uuid: header.uuid,
            name: header.name.clone(),
            outcomes: vec![
                TaskOutcome::Completed(Bytes::from("ok")),
                TaskOutcome::Failed {
                    task: Bytes::from("t1"),
                    reason: "boom".to_string(),
                },
                TaskOutcome::Cancelled(Bytes::from("t2")),
            ],
        };
        let back = JobResults::from_message(results.to_message(&header).unwrap()).unwrap();
        assert_eq!(back, results);
        assert_eq!(back.completed_count(), 1);
    }

    #[test]
    fn results_without_statuses_are_completed() {
        let header = BundleHeader::new(Uuid::new_v4(), "j");
        let message = Message::new(header).with_tasks(tasks(2));
        let results = JobResults::from_message(message).unwrap();
        assert_eq!(results.completed_count(), 2);
    }
}
