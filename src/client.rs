use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::config::DEFAULT_MAX_FRAME_LEN;
use crate::error::Result;
use crate::protocol::{receive_message, send_message, ChannelKind, MessageReader};
use crate::scheduler::{Job, JobResults};

/// Submits jobs to a driver over a client channel and waits for their results.
///
/// The driver serves one job per connection at a time, so `submit` takes
/// `&mut self`.
#[derive(Debug)]
pub struct JobClient {
    stream: TcpStream,
    reader: MessageReader,
}

impl JobClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_u32(ChannelKind::Client.to_u32()).await?;
        Ok(Self {
            stream,
            reader: MessageReader::new(DEFAULT_MAX_FRAME_LEN),
        })
    }

    pub async fn submit(&mut self, job: Job) -> Result<JobResults> {
        let uuid = job.uuid();
        let tasks = job.task_count();
        send_message(&self.stream, &job.to_message()?).await?;
        tracing::debug!(job_id = %uuid, tasks, "Job submitted");
        let reply = receive_message(&self.stream, &mut self.reader).await?;
        JobResults::from_message(reply)
    }
}
