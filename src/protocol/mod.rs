//! Wire protocol shared by the driver, worker nodes and clients.
//!
//! Every connection starts with a 4-byte big-endian [`ChannelKind`] preamble
//! sent by the connecting peer. After that both sides exchange [`Message`]s:
//!
//! ```text
//! [u32 BE len][header JSON]
//! [u32 BE len][data provider]   (may be empty)
//! [u32 BE len][task 1] ... [u32 BE len][task N]
//! ```
//!
//! N is the `task_count` of the decoded header.

pub mod frame;
pub mod header;

pub use frame::{
    receive_message, send_message, Message, MessageReader, MessageWriter, NonBlockingIo,
};
pub use header::{BundleHeader, JobSla, Parameter, SystemInfo};

use crate::error::{DispatchError, Result};

/// Role announced by the connecting peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Client,
    Node,
}

impl ChannelKind {
    pub fn to_u32(self) -> u32 {
        match self {
            ChannelKind::Client => 1,
            ChannelKind::Node => 2,
        }
    }

    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            1 => Ok(ChannelKind::Client),
            2 => Ok(ChannelKind::Node),
            other => Err(DispatchError::Protocol(format!(
                "unknown channel kind {other}"
            ))),
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelKind::Client => write!(f, "client"),
            ChannelKind::Node => write!(f, "node"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_kind_preamble() {
        for kind in [ChannelKind::Client, ChannelKind::Node] {
            assert_eq!(ChannelKind::from_u32(kind.to_u32()).unwrap(), kind);
        }
        assert!(ChannelKind::from_u32(7).is_err());
    }
}
