use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DispatchError, Result};

/// Scheduling constraints attached to a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSla {
    /// Maximum number of nodes executing the job at once, `<= 0` means unlimited
    pub max_nodes: i32,
    pub suspended: bool,
    /// Run the job as one unsplit bundle. The first idle node takes every
    /// remaining task and the bundler size is ignored. The job is not copied
    /// to each connected node; a requeued broadcast bundle goes out whole
    /// again to the next idle node.
    pub broadcast: bool,
    /// Cancel the job if it is still running this long after being queued
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_ms: Option<u64>,
}

impl Default for JobSla {
    fn default() -> Self {
        Self {
            max_nodes: i32::MAX,
            suspended: false,
            broadcast: false,
            expiration_ms: None,
        }
    }
}

impl JobSla {
    pub fn allows_nodes(&self, nodes: usize) -> bool {
        self.max_nodes <= 0 || nodes < self.max_nodes as usize
    }
}

/// Well-known keys of the header parameter map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Parameter {
    /// Node asks the driver to put the bundle back in the queue
    Requeue,
    /// Node-side failure while executing the bundle
    NodeException,
    /// Time the driver first received the job
    ReceivedAt,
    /// Node capabilities snapshot
    SystemInfo,
    /// Time the node spent executing the bundle, in nanoseconds
    NodeExecutionNanos,
    BundleId,
    /// Per-task status of an aggregated result sent back to a client
    TaskOutcomes,
    DriverUuid,
    NodeUuid,
    Handshake,
}

impl Parameter {
    pub fn key(&self) -> &'static str {
        match self {
            Parameter::Requeue => "bundle.requeue",
            Parameter::NodeException => "node.exception",
            Parameter::ReceivedAt => "driver.received.at",
            Parameter::SystemInfo => "node.system.info",
            Parameter::NodeExecutionNanos => "node.execution.nanos",
            Parameter::BundleId => "bundle.id",
            Parameter::TaskOutcomes => "job.task.outcomes",
            Parameter::DriverUuid => "driver.uuid",
            Parameter::NodeUuid => "node.uuid",
            Parameter::Handshake => "handshake",
        }
    }
}

impl AsRef<str> for Parameter {
    fn as_ref(&self) -> &str {
        self.key()
    }
}

impl std::fmt::Display for Parameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// Capabilities a node reports during the handshake and optionally with each result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub node_uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub available_processors: u32,
    pub processing_threads: u32,
}

impl SystemInfo {
    pub fn local(node_uuid: impl Into<String>, processing_threads: usize) -> Self {
        let available_processors = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            node_uuid: node_uuid.into(),
            host: std::env::var("HOSTNAME").ok(),
            available_processors: available_processors as u32,
            processing_threads: processing_threads as u32,
        }
    }
}

/// First frame of every message.
///
/// On the wire the header is a JSON document; the fields below are the ones
/// every peer must understand, everything else travels in `parameters`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleHeader {
    pub uuid: Uuid,
    pub name: String,
    pub priority: i32,
    pub task_count: i32,
    #[serde(default)]
    pub sla: JobSla,
    #[serde(default)]
    pub uuid_path: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

impl BundleHeader {
    pub fn new(uuid: Uuid, name: impl Into<String>) -> Self {
        Self {
            uuid,
            name: name.into(),
            priority: 0,
            task_count: 0,
            sla: JobSla::default(),
            uuid_path: Vec::new(),
            metadata: BTreeMap::new(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header: BundleHeader = serde_json::from_slice(bytes)?;
        if header.task_count < 0 {
            return Err(DispatchError::Protocol(format!(
                "negative task count {} in header of {}",
                header.task_count, header.uuid
            )));
        }
        Ok(header)
    }

    /// Read a typed parameter. A present but malformed value is an error.
    pub fn parameter<T: DeserializeOwned>(&self, key: impl AsRef<str>) -> Result<Option<T>> {
        match self.parameters.get(key.as_ref()) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    pub fn set_parameter(&mut self, key: impl AsRef<str>, value: impl Serialize) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.parameters.insert(key.as_ref().to_string(), value);
        Ok(())
    }

    pub fn remove_parameter(&mut self, key: impl AsRef<str>) -> Option<serde_json::Value> {
        self.parameters.remove(key.as_ref())
    }

    /// Boolean parameters default to false when absent or not a boolean.
    pub fn flag(&self, key: impl AsRef<str>) -> bool {
        self.parameters
            .get(key.as_ref())
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }
}
