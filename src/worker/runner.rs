use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::error::{DispatchError, Result};
use crate::protocol::{
    receive_message, send_message, ChannelKind, Message, MessageReader, Parameter, SystemInfo,
};
use crate::scheduler::TaskStatus;
use crate::worker::executor::{TaskContext, TaskExecutor};

/// Worker node: connects to a driver and executes the bundles it receives.
#[derive(Debug)]
pub struct NodeRunner<E> {
    config: NodeConfig,
    executor: Arc<E>,
    node_uuid: String,
}

impl<E: TaskExecutor> NodeRunner<E> {
    pub fn new(config: NodeConfig, executor: E) -> Self {
        Self {
            config,
            executor: Arc::new(executor),
            node_uuid: Uuid::new_v4().to_string(),
        }
    }

    pub fn node_uuid(&self) -> &str {
        &self.node_uuid
    }

    /// Connect to the configured driver and serve it until it hangs up or
    /// `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut stream = TcpStream::connect(&self.config.driver_addr).await?;
        stream.write_u32(ChannelKind::Node.to_u32()).await?;
        tracing::info!(
            driver = %self.config.driver_addr,
            node_uuid = %self.node_uuid,
            threads = self.config.processing_threads,
            "Connected to driver"
        );
        self.serve(stream, shutdown).await
    }

    /// Serve an established driver connection whose preamble, if any, was
    /// already exchanged.
    pub async fn serve(&self, stream: TcpStream, shutdown: CancellationToken) -> Result<()> {
        let mut reader = MessageReader::new(self.config.max_frame_len);
        loop {
            let message = tokio::select! {
                message = receive_message(&stream, &mut reader) => message,
                _ = shutdown.cancelled() => return Ok(()),
            };
            let message = match message {
                Ok(message) => message,
                Err(DispatchError::ConnectionBroken) => {
                    tracing::info!(node_uuid = %self.node_uuid, "Driver closed the connection");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            let reply = if message.header.flag(Parameter::Handshake) {
                self.handshake_reply(message)?
            } else {
                self.execute_bundle(message).await?
            };
            send_message(&stream, &reply).await?;
        }
    }

    fn handshake_reply(&self, message: Message) -> Result<Message> {
        let driver: Option<String> = message.header.parameter(Parameter::DriverUuid)?;
        tracing::debug!(driver_uuid = ?driver, "Handshake received");
        let mut header = message.header;
        header.parameters.clear();
        header.set_parameter(
            Parameter::SystemInfo,
            SystemInfo::local(self.node_uuid.as_str(), self.config.processing_threads),
        )?;
        header.set_parameter(Parameter::NodeUuid, &self.node_uuid)?;
        Ok(Message::new(header))
    }

    /// Run every task of the bundle, at most `processing_threads` at a time.
    ///
    /// Results keep the order of the tasks. A failing task gets an empty
    /// result and its own status; only a task that panicked turns the whole
    /// bundle into a node execution fault.
    async fn execute_bundle(&self, message: Message) -> Result<Message> {
        let started = Instant::now();
        let Message {
            header,
            data_provider,
            tasks,
        } = message;
        let task_count = tasks.len();
        let context = Arc::new(TaskContext {
            job_uuid: header.uuid,
            job_name: header.name.clone(),
            data_provider,
        });
        tracing::debug!(job_id = %header.uuid, tasks = task_count, "Executing bundle");

        let permits = Arc::new(Semaphore::new(self.config.processing_threads.max(1)));
        let mut running = JoinSet::new();
        for (position, task) in tasks.into_iter().enumerate() {
            let permit = Arc::clone(&permits)
                .acquire_owned()
                .await
                .map_err(|e| DispatchError::Internal(e.to_string()))?;
            let executor = Arc::clone(&self.executor);
            let context = Arc::clone(&context);
            running.spawn(async move {
                let _permit = permit;
                (position, executor.execute(&context, task).await)
            });
        }

        let mut results: Vec<Bytes> = vec![Bytes::new(); task_count];
        let mut statuses: Vec<TaskStatus> = vec![TaskStatus::Completed; task_count];
        let mut panicked: Option<String> = None;
        while let Some(joined) = running.join_next().await {
            match joined {
                Ok((position, Ok(result))) => results[position] = result,
                Ok((position, Err(e))) => {
                    statuses[position] = TaskStatus::Failed {
                        reason: e.to_string(),
                    };
                }
                Err(e) => {
                    panicked.get_or_insert_with(|| format!("task panicked: {e}"));
                }
            }
        }

        let mut reply = header;
        let bundle_id = reply.remove_parameter(Parameter::BundleId);
        reply.parameters.clear();
        if let Some(bundle_id) = bundle_id {
            reply.set_parameter(Parameter::BundleId, bundle_id)?;
        }
        reply.set_parameter(
            Parameter::NodeExecutionNanos,
            started.elapsed().as_nanos() as u64,
        )?;
        if let Some(reason) = panicked {
            tracing::warn!(job_id = %reply.uuid, error = %reason, "Bundle execution failed");
            reply.set_parameter(Parameter::NodeException, reason)?;
            return Ok(Message::new(reply));
        }
        let failed = statuses
            .iter()
            .filter(|status| matches!(status, TaskStatus::Failed { .. }))
            .count();
        if failed > 0 {
            tracing::warn!(job_id = %reply.uuid, failed, tasks = task_count, "Some tasks failed");
            reply.set_parameter(Parameter::TaskOutcomes, statuses)?;
        }
        Ok(Message::new(reply).with_tasks(results))
    }
}
