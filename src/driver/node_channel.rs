use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::bundler::Bundler;
use crate::driver::context::DispatchContext;
use crate::driver::Readiness;
use crate::error::{DispatchError, Result};
use crate::id::ChannelId;
use crate::protocol::{
    BundleHeader, Message, MessageReader, MessageWriter, NonBlockingIo, Parameter, SystemInfo,
};
use crate::scheduler::{BundleOutcome, SubBundle, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    SendingInitialHandshake,
    WaitingInitialHandshakeAck,
    /// Ready for the next bundle
    Idle,
    SendingBundle,
    WaitingResults,
    Closed,
}

#[derive(Debug)]
struct InFlightBundle {
    bundle: SubBundle,
    sent_at: Instant,
}

/// Driver side of a connection to one worker node.
pub struct NodeChannel {
    id: ChannelId,
    context: Arc<DispatchContext>,
    state: NodeState,
    reader: MessageReader,
    writer: Option<MessageWriter>,
    in_flight: Option<InFlightBundle>,
    bundler: Box<dyn Bundler>,
    bundler_generation: u64,
    system_info: Option<SystemInfo>,
}

impl std::fmt::Debug for NodeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeChannel")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("in_flight", &self.in_flight)
            .field("bundler", &self.bundler.algorithm())
            .finish_non_exhaustive()
    }
}

impl NodeChannel {
    pub fn new(id: ChannelId, context: Arc<DispatchContext>) -> Result<Self> {
        let (bundler_generation, bundler) = context.load_balancer.create_bundler(id)?;
        context.manager.node_connected(id)?;
        context.stats.node_connected();
        Ok(Self {
            id,
            reader: MessageReader::new(context.max_frame_len),
            context,
            state: NodeState::SendingInitialHandshake,
            writer: None,
            in_flight: None,
            bundler,
            bundler_generation,
            system_info: None,
        })
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn system_info(&self) -> Option<&SystemInfo> {
        self.system_info.as_ref()
    }

    /// Advance the state machine as far as `io` allows without blocking.
    pub fn perform_transition<T: NonBlockingIo + ?Sized>(&mut self, io: &T) -> Result<Readiness> {
        match self.state {
            NodeState::SendingInitialHandshake => {
                if self.writer.is_none() {
                    self.writer = Some(MessageWriter::new(&self.handshake()?)?);
                }
                if !self.flush(io)? {
                    return Ok(Readiness::Write);
                }
                self.state = NodeState::WaitingInitialHandshakeAck;
                Ok(Readiness::Continue)
            }
            NodeState::WaitingInitialHandshakeAck => {
                let Some(message) = self.reader.read_from(io)? else {
                    return Ok(Readiness::Read);
                };
                if let Some(info) = message.header.parameter(Parameter::SystemInfo)? {
                    self.update_system_info(info)?;
                }
                tracing::info!(
                    channel = %self.id,
                    node_uuid = self.system_info.as_ref().map(|i| i.node_uuid.as_str()).unwrap_or("unknown"),
                    "Node connected"
                );
                self.state = NodeState::Idle;
                Ok(Readiness::Continue)
            }
            NodeState::Idle => {
                self.refresh_bundler()?;
                let Some(bundle) = self.context.next_bundle(self.id, self.bundler.as_ref())? else {
                    return Ok(Readiness::Work);
                };
                let in_flight = self.in_flight.insert(InFlightBundle {
                    bundle,
                    sent_at: Instant::now(),
                });
                let writer = MessageWriter::new(&in_flight.bundle.to_message()?)?;
                tracing::debug!(
                    channel = %self.id,
                    job_id = %in_flight.bundle.job_uuid(),
                    bundle_id = %in_flight.bundle.id,
                    tasks = in_flight.bundle.task_count(),
                    bytes = writer.len(),
                    "Dispatching bundle"
                );
                self.writer = Some(writer);
                self.state = NodeState::SendingBundle;
                Ok(Readiness::Continue)
            }
            NodeState::SendingBundle => {
                if !self.flush(io)? {
                    return Ok(Readiness::Write);
                }
                self.state = NodeState::WaitingResults;
                Ok(Readiness::Continue)
            }
            NodeState::WaitingResults => {
                let Some(message) = self.reader.read_from(io)? else {
                    return Ok(Readiness::Read);
                };
                self.context.stats.bytes_in(self.reader.last_message_len());
                self.results_received(message)?;
                self.state = NodeState::Idle;
                Ok(Readiness::Continue)
            }
            NodeState::Closed => Ok(Readiness::Closed),
        }
    }

    fn handshake(&self) -> Result<Message> {
        let mut header = BundleHeader::new(Uuid::new_v4(), "handshake");
        header.set_parameter(Parameter::Handshake, true)?;
        header.set_parameter(Parameter::DriverUuid, &self.context.driver_uuid)?;
        Ok(Message::new(header))
    }

    /// Returns true once the pending message is fully written.
    fn flush<T: NonBlockingIo + ?Sized>(&mut self, io: &T) -> Result<bool> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(true);
        };
        if !writer.write_to(io)? {
            return Ok(false);
        }
        self.context.stats.bytes_out(writer.len());
        self.writer = None;
        Ok(true)
    }

    // Only called in Idle, so the bundle that was sized by the old bundler
    // has already reported back to it.
    fn refresh_bundler(&mut self) -> Result<()> {
        let generation = self.context.load_balancer.generation()?;
        if generation == self.bundler_generation {
            return Ok(());
        }
        let (generation, bundler) = self.context.load_balancer.create_bundler(self.id)?;
        tracing::debug!(
            channel = %self.id,
            algorithm = bundler.algorithm(),
            generation,
            "Switching bundler"
        );
        self.bundler = bundler;
        self.bundler_generation = generation;
        Ok(())
    }

    fn update_system_info(&mut self, info: SystemInfo) -> Result<()> {
        self.context.manager.node_info_updated(self.id, info.clone())?;
        self.system_info = Some(info);
        Ok(())
    }

    fn results_received(&mut self, message: Message) -> Result<()> {
        let Some(in_flight) = self.in_flight.as_ref() else {
            return Err(DispatchError::Protocol(format!(
                "node on channel {} sent results with no bundle outstanding",
                self.id
            )));
        };
        let header = &message.header;
        if let Some(bundle_id) = header.parameter::<Uuid>(Parameter::BundleId)? {
            if bundle_id != in_flight.bundle.id {
                return Err(DispatchError::Protocol(format!(
                    "results for bundle {bundle_id}, expected {}",
                    in_flight.bundle.id
                )));
            }
        }
        let exception: Option<String> = header.parameter(Parameter::NodeException)?;
        if exception.is_none() && message.tasks.len() != in_flight.bundle.task_count() {
            return Err(DispatchError::Protocol(format!(
                "bundle {} returned {} results for {} tasks",
                in_flight.bundle.id,
                message.tasks.len(),
                in_flight.bundle.task_count()
            )));
        }
        let node_nanos: Option<u64> = header.parameter(Parameter::NodeExecutionNanos)?;
        let requeue = header.flag(Parameter::Requeue);
        let statuses: Option<Vec<TaskStatus>> = header.parameter(Parameter::TaskOutcomes)?;
        if let Some(info) = header.parameter(Parameter::SystemInfo)? {
            self.update_system_info(info)?;
        }
        let outcome = match (exception, statuses) {
            (Some(reason), _) => BundleOutcome::NodeExecutionFailed(reason),
            (None, Some(statuses)) => BundleOutcome::from_statuses(statuses, message.tasks)?,
            (None, None) => BundleOutcome::Executed(message.tasks),
        };

        // validated: from here on the bundle is no longer this channel's
        let Some(InFlightBundle { bundle, sent_at }) = self.in_flight.take() else {
            return Ok(());
        };
        let elapsed = sent_at.elapsed();
        let task_count = bundle.task_count();
        if !matches!(outcome, BundleOutcome::NodeExecutionFailed(_)) {
            self.bundler.feedback(task_count, elapsed);
        }

        if requeue {
            tracing::info!(
                channel = %self.id,
                job_id = %bundle.job_uuid(),
                tasks = task_count,
                "Node asked for requeue, suspending job"
            );
            return self.context.requeue(&bundle, self.id, true);
        }
        match &outcome {
            BundleOutcome::NodeExecutionFailed(reason) => {
                tracing::warn!(
                    channel = %self.id,
                    job_id = %bundle.job_uuid(),
                    error = %reason,
                    "Node failed to execute bundle"
                );
                self.context.stats.bundle_failed();
            }
            BundleOutcome::Executed(_) | BundleOutcome::PartiallyExecuted(_) => {
                self.context.stats.bundle_executed(
                    task_count,
                    elapsed,
                    node_nanos.map(Duration::from_nanos),
                );
            }
        }
        tracing::debug!(
            channel = %self.id,
            job_id = %bundle.job_uuid(),
            tasks = task_count,
            elapsed_ms = elapsed.as_millis() as u64,
            "Bundle returned"
        );
        self.context
            .bundle_returned(&bundle, self.id, outcome, elapsed)
    }

    /// Tear the channel down. Work still on the node goes back to the queue.
    pub fn close(&mut self) -> Result<()> {
        if self.state == NodeState::Closed {
            return Ok(());
        }
        self.state = NodeState::Closed;
        self.writer = None;
        let requeued = match self.in_flight.take() {
            Some(InFlightBundle { bundle, .. }) => {
                tracing::warn!(
                    channel = %self.id,
                    job_id = %bundle.job_uuid(),
                    tasks = bundle.task_count(),
                    "Node lost with bundle in flight, requeueing"
                );
                self.context.requeue(&bundle, self.id, false)
            }
            None => Ok(()),
        };
        self.context.stats.node_disconnected();
        self.context.manager.node_disconnected(self.id)?;
        tracing::info!(channel = %self.id, "Node disconnected");
        requeued
    }
}

impl Drop for NodeChannel {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!(channel = %self.id, error = %e, "Failed to close node channel");
        }
    }
}
