//! The driver: accepts client and node connections and runs one dispatch
//! state machine per connection.
//!
//! Each connection is served by its own task. The task calls the channel's
//! non-blocking `perform_transition` and then waits for whatever the channel
//! reported it needs: socket readiness, new work in the queue, or the
//! completion of a submitted job.

pub mod client_channel;
pub mod context;
pub mod node_channel;
pub mod stats;

pub use client_channel::{ClientChannel, ClientState};
pub use context::DispatchContext;
pub use node_channel::{NodeChannel, NodeState};
pub use stats::{DriverStatistics, StatisticsSnapshot};

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{DriverConfig, LoadBalancerConfig};
use crate::error::{DispatchError, Result};
use crate::id::{ChannelId, ListenerId};
use crate::manager::{JobListener, JobSnapshot, NodeSnapshot};
use crate::protocol::ChannelKind;
use crate::scheduler::{Job, JobResults, QueuedJobInfo};

/// How long a new connection may take to announce its [`ChannelKind`].
const PREAMBLE_TIMEOUT: Duration = Duration::from_secs(10);

/// What a channel needs before its next transition can make progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Call `perform_transition` again right away
    Continue,
    Read,
    Write,
    /// Idle node waiting for the queue to offer work
    Work,
    /// Client waiting for its job to complete
    Completion,
    Closed,
}

pub struct Driver {
    config: DriverConfig,
    context: Arc<DispatchContext>,
    listener: TcpListener,
}

impl Driver {
    pub async fn bind(config: DriverConfig) -> Result<Self> {
        let context = DispatchContext::new(&config)?;
        let listener = TcpListener::bind(config.listen_addr).await?;
        tracing::info!(
            addr = %listener.local_addr()?,
            driver_uuid = %context.driver_uuid,
            algorithm = %config.load_balancer.algorithm,
            "Driver listening"
        );
        Ok(Self {
            config,
            context,
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn handle(&self) -> DriverHandle {
        DriverHandle {
            context: Arc::clone(&self.context),
        }
    }

    /// Accept connections until `shutdown` is cancelled.
    ///
    /// Also serves the admin dashboard when one is configured.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        if let Some(addr) = self.config.dashboard_addr {
            let handle = self.handle();
            let dashboard_shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = crate::dashboard::serve(addr, handle, dashboard_shutdown).await {
                    tracing::error!(error = %e, "Dashboard server failed");
                }
            });
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(accept_connection(
                            Arc::clone(&self.context),
                            stream,
                            peer,
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to accept connection"),
                },
            }
        }
        tracing::info!("Driver stopped accepting connections");
        Ok(())
    }
}

/// Cheap handle for submitting jobs and administering a running driver.
#[derive(Debug, Clone)]
pub struct DriverHandle {
    context: Arc<DispatchContext>,
}

impl DriverHandle {
    pub fn driver_uuid(&self) -> &str {
        &self.context.driver_uuid
    }

    /// Submit a job and wait for its aggregated results.
    pub async fn submit(&self, job: Job) -> Result<JobResults> {
        let completion = self.submit_detached(job)?;
        completion.await.map_err(|_| DispatchError::ChannelClosed)
    }

    /// Submit a job and return the receiver its results will arrive on.
    pub fn submit_detached(&self, mut job: Job) -> Result<oneshot::Receiver<JobResults>> {
        job.header.received_at.get_or_insert_with(Utc::now);
        job.header.uuid_path.push(self.context.driver_uuid.clone());
        let (listener, completion) = oneshot::channel();
        self.context.submit(job, Some(listener))?;
        Ok(completion)
    }

    pub fn cancel_job(&self, uuid: &Uuid) -> Result<()> {
        self.context.cancel_job(uuid)
    }

    pub fn suspend_job(&self, uuid: &Uuid) -> Result<()> {
        self.context.set_suspended(uuid, true)
    }

    pub fn resume_job(&self, uuid: &Uuid) -> Result<()> {
        self.context.set_suspended(uuid, false)
    }

    pub fn load_balancer(&self) -> Result<LoadBalancerConfig> {
        self.context.load_balancer.config()
    }

    /// Switch the load-balancing algorithm. Node channels pick it up the next
    /// time they are idle. Returns the new generation.
    pub fn set_load_balancer(&self, config: LoadBalancerConfig) -> Result<u64> {
        self.context.load_balancer.set_algorithm(config)
    }

    pub fn queue_depth(&self) -> Result<usize> {
        self.context.queue.depth()
    }

    pub fn queue_snapshot(&self) -> Result<Vec<QueuedJobInfo>> {
        self.context.queue.snapshot()
    }

    pub fn node_jobs(&self, channel: ChannelId) -> Result<Vec<Uuid>> {
        self.context.manager.jobs_for_node(channel)
    }

    pub fn nodes(&self) -> Result<Vec<NodeSnapshot>> {
        self.context.manager.nodes()
    }

    pub fn jobs(&self) -> Result<Vec<JobSnapshot>> {
        self.context.manager.all_jobs()
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.context.stats.snapshot()
    }

    pub fn add_listener(&self, listener: Arc<dyn JobListener>) -> Result<ListenerId> {
        self.context.manager.add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> Result<bool> {
        self.context.manager.remove_listener(id)
    }

    /// Serve a node connection established by someone else, for instance a
    /// provisioning component that dialled the node. No preamble is expected.
    pub fn attach_node(&self, stream: TcpStream, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(serve_node(Arc::clone(&self.context), stream, shutdown))
    }
}

async fn accept_connection(
    context: Arc<DispatchContext>,
    mut stream: TcpStream,
    peer: SocketAddr,
    shutdown: CancellationToken,
) {
    let kind = match tokio::time::timeout(PREAMBLE_TIMEOUT, stream.read_u32()).await {
        Ok(Ok(value)) => ChannelKind::from_u32(value),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(DispatchError::Protocol("no channel preamble".to_string())),
    };
    match kind {
        Ok(ChannelKind::Node) => serve_node(context, stream, shutdown).await,
        Ok(ChannelKind::Client) => serve_client(context, stream, shutdown).await,
        Err(e) => tracing::warn!(peer = %peer, error = %e, "Rejected connection"),
    }
}

async fn serve_node(context: Arc<DispatchContext>, stream: TcpStream, shutdown: CancellationToken) {
    let peer = stream.peer_addr().ok();
    let mut channel = match NodeChannel::new(context.next_channel_id(), Arc::clone(&context)) {
        Ok(channel) => channel,
        Err(e) => {
            tracing::error!(error = %e, "Failed to set up node channel");
            return;
        }
    };
    let mut work = context.queue.subscribe();
    if let Err(e) = drive_node(&mut channel, &stream, &mut work, &shutdown).await {
        log_channel_error(channel.id(), peer, &e);
    }
    if let Err(e) = channel.close() {
        tracing::error!(channel = %channel.id(), error = %e, "Failed to close node channel");
    }
}

async fn drive_node(
    channel: &mut NodeChannel,
    stream: &TcpStream,
    work: &mut watch::Receiver<u64>,
    shutdown: &CancellationToken,
) -> Result<()> {
    loop {
        if channel.state() == NodeState::Idle {
            // mark the current signal seen before looking at the queue
            work.borrow_and_update();
        }
        match channel.perform_transition(stream)? {
            Readiness::Continue => {}
            Readiness::Read => tokio::select! {
                ready = stream.readable() => ready?,
                _ = shutdown.cancelled() => return Ok(()),
            },
            Readiness::Write => tokio::select! {
                ready = stream.writable() => ready?,
                _ = shutdown.cancelled() => return Ok(()),
            },
            Readiness::Work => tokio::select! {
                changed = work.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
                ready = stream.readable() => {
                    ready?;
                    probe_idle_node(stream)?;
                }
                _ = shutdown.cancelled() => return Ok(()),
            },
            Readiness::Completion | Readiness::Closed => return Ok(()),
        }
    }
}

/// An idle node has nothing to say; readable means it hung up or misbehaves.
fn probe_idle_node(stream: &TcpStream) -> Result<()> {
    let mut byte = [0u8; 1];
    match stream.try_read(&mut byte) {
        Ok(0) => Err(DispatchError::ConnectionBroken),
        Ok(_) => Err(DispatchError::Protocol(
            "idle node sent unsolicited data".to_string(),
        )),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn serve_client(
    context: Arc<DispatchContext>,
    stream: TcpStream,
    shutdown: CancellationToken,
) {
    let peer = stream.peer_addr().ok();
    let mut channel = ClientChannel::new(context.next_channel_id(), context);
    tracing::debug!(channel = %channel.id(), peer = ?peer, "Client connected");
    if let Err(e) = drive_client(&mut channel, &stream, &shutdown).await {
        log_channel_error(channel.id(), peer, &e);
    }
    channel.close();
}

async fn drive_client(
    channel: &mut ClientChannel,
    stream: &TcpStream,
    shutdown: &CancellationToken,
) -> Result<()> {
    let mut probe = [0u8; 1];
    loop {
        match channel.perform_transition(stream)? {
            Readiness::Continue => {}
            Readiness::Read => tokio::select! {
                ready = stream.readable() => ready?,
                _ = shutdown.cancelled() => return Ok(()),
            },
            Readiness::Write => tokio::select! {
                ready = stream.writable() => ready?,
                _ = shutdown.cancelled() => return Ok(()),
            },
            Readiness::Completion => {
                let completed = tokio::select! {
                    _ = channel.completion() => true,
                    peeked = stream.peek(&mut probe) => {
                        if peeked? == 0 {
                            return Err(DispatchError::ConnectionBroken);
                        }
                        false
                    }
                    _ = shutdown.cancelled() => return Ok(()),
                };
                if !completed {
                    // the client sent its next job early; it is read after the results go out
                    tokio::select! {
                        _ = channel.completion() => {}
                        _ = shutdown.cancelled() => return Ok(()),
                    }
                }
            }
            Readiness::Work | Readiness::Closed => return Ok(()),
        }
    }
}

fn log_channel_error(channel: ChannelId, peer: Option<SocketAddr>, error: &DispatchError) {
    if matches!(error, DispatchError::ConnectionBroken) {
        tracing::debug!(channel = %channel, peer = ?peer, "Peer closed the connection");
    } else if error.is_connection_fault() {
        tracing::warn!(channel = %channel, peer = ?peer, error = %error, "Closing channel after connection fault");
    } else {
        tracing::error!(channel = %channel, peer = ?peer, error = %error, "Closing channel after dispatch failure");
    }
}
