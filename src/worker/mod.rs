//! Worker node runtime.
//!
//! A node connects to the driver, answers its handshake with a
//! [`SystemInfo`](crate::protocol::SystemInfo) snapshot and then executes
//! every bundle it is sent:
//!
//! 1. [`NodeRunner`] reads a bundle from the driver connection
//! 2. Each task goes to a [`TaskExecutor`], bounded by the processing threads
//! 3. Results are written back in task order, with the node's execution time
//!
//! [`ShellExecutor`] runs tasks as `sh -c <task>`, optionally inside a Docker
//! sandbox.

pub mod executor;
pub mod runner;

pub use executor::{ShellExecutor, TaskContext, TaskError, TaskExecutor};
pub use runner::NodeRunner;
