use std::sync::Arc;

use chrono::Utc;
use tokio::sync::oneshot;

use crate::driver::context::DispatchContext;
use crate::driver::Readiness;
use crate::error::{DispatchError, Result};
use crate::id::ChannelId;
use crate::protocol::{MessageReader, MessageWriter, NonBlockingIo};
use crate::scheduler::{Job, JobHeader, JobResults};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    WaitingJobSubmission,
    WaitingJobCompletion,
    SendingResults,
    Closed,
}

#[derive(Debug)]
struct PendingJob {
    header: JobHeader,
    completion: oneshot::Receiver<JobResults>,
    results: Option<JobResults>,
    /// The completion listener was dropped without results
    abandoned: bool,
}

/// Driver side of a connection from a job submitter.
///
/// Jobs are handled one at a time: the next submission is read only after
/// the results of the previous one have been written back.
#[derive(Debug)]
pub struct ClientChannel {
    id: ChannelId,
    context: Arc<DispatchContext>,
    state: ClientState,
    reader: MessageReader,
    writer: Option<MessageWriter>,
    pending: Option<PendingJob>,
}

impl ClientChannel {
    pub fn new(id: ChannelId, context: Arc<DispatchContext>) -> Self {
        context.stats.client_connected();
        Self {
            id,
            reader: MessageReader::new(context.max_frame_len),
            context,
            state: ClientState::WaitingJobSubmission,
            writer: None,
            pending: None,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn perform_transition<T: NonBlockingIo + ?Sized>(&mut self, io: &T) -> Result<Readiness> {
        match self.state {
            ClientState::WaitingJobSubmission => {
                let Some(message) = self.reader.read_from(io)? else {
                    return Ok(Readiness::Read);
                };
                self.context.stats.bytes_in(self.reader.last_message_len());
                let mut job = Job::from_message(message)?;
                job.header.received_at.get_or_insert_with(Utc::now);
                job.header.uuid_path.push(self.context.driver_uuid.clone());
                let header = job.header.clone();
                let (listener, completion) = oneshot::channel();
                tracing::debug!(
                    channel = %self.id,
                    job_id = %header.uuid,
                    tasks = job.task_count(),
                    "Job received from client"
                );
                self.context.submit(job, Some(listener))?;
                self.reader.reset();
                self.pending = Some(PendingJob {
                    header,
                    completion,
                    results: None,
                    abandoned: false,
                });
                self.state = ClientState::WaitingJobCompletion;
                Ok(Readiness::Continue)
            }
            ClientState::WaitingJobCompletion => {
                let Some(pending) = self.pending.as_mut() else {
                    return Err(DispatchError::Internal(format!(
                        "client channel {} waits for completion without a job",
                        self.id
                    )));
                };
                if pending.abandoned {
                    return Err(DispatchError::ChannelClosed);
                }
                let results = match pending.results.take() {
                    Some(results) => results,
                    None => match pending.completion.try_recv() {
                        Ok(results) => results,
                        Err(oneshot::error::TryRecvError::Empty) => {
                            return Ok(Readiness::Completion)
                        }
                        Err(oneshot::error::TryRecvError::Closed) => {
                            return Err(DispatchError::ChannelClosed)
                        }
                    },
                };
                self.writer = Some(MessageWriter::new(&results.to_message(&pending.header)?)?);
                self.state = ClientState::SendingResults;
                Ok(Readiness::Continue)
            }
            ClientState::SendingResults => {
                if let Some(writer) = self.writer.as_mut() {
                    if !writer.write_to(io)? {
                        return Ok(Readiness::Write);
                    }
                    self.context.stats.bytes_out(writer.len());
                }
                if let Some(pending) = self.pending.take() {
                    tracing::debug!(channel = %self.id, job_id = %pending.header.uuid, "Results sent to client");
                }
                self.writer = None;
                self.state = ClientState::WaitingJobSubmission;
                Ok(Readiness::Continue)
            }
            ClientState::Closed => Ok(Readiness::Closed),
        }
    }

    /// Wait until the pending job completes. Returns immediately if there is
    /// none or its results are already in.
    pub async fn completion(&mut self) {
        let Some(pending) = self.pending.as_mut() else {
            return;
        };
        if pending.results.is_some() || pending.abandoned {
            return;
        }
        match (&mut pending.completion).await {
            Ok(results) => pending.results = Some(results),
            Err(_) => pending.abandoned = true,
        }
    }

    /// The job of a vanished client stays queued; its results are dropped.
    pub fn close(&mut self) {
        if self.state == ClientState::Closed {
            return;
        }
        self.state = ClientState::Closed;
        self.context.stats.client_disconnected();
        match self.pending.take() {
            Some(pending) => tracing::info!(
                channel = %self.id,
                job_id = %pending.header.uuid,
                "Client disconnected before its job completed"
            ),
            None => tracing::debug!(channel = %self.id, "Client disconnected"),
        }
    }
}

impl Drop for ClientChannel {
    fn drop(&mut self) {
        self.close();
    }
}
