use std::sync::PoisonError;

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Connection broken before a complete message was exchanged")]
    ConnectionBroken,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Frame of {len} bytes exceeds the maximum of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Unknown load-balancing algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("Invalid value {value:?} for parameter {name:?} of algorithm {algorithm:?}")]
    InvalidParameter {
        algorithm: String,
        name: String,
        value: String,
    },

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Job already queued: {0}")]
    DuplicateJob(Uuid),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl<T> From<PoisonError<T>> for DispatchError {
    fn from(error: PoisonError<T>) -> Self {
        DispatchError::Internal(error.to_string())
    }
}

impl DispatchError {
    /// Faults after which the channel's framing cannot be trusted anymore.
    pub fn is_connection_fault(&self) -> bool {
        matches!(
            self,
            DispatchError::ConnectionBroken
                | DispatchError::Io(_)
                | DispatchError::Serialization(_)
                | DispatchError::Protocol(_)
                | DispatchError::FrameTooLarge { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
