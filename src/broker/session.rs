//! Shared transport session
//!
//! One authenticated connection to the remote relay peer carries every task.
//! A single writer loop drains the outbound frame queue and a single reader
//! loop routes inbound frames through the [`TaskRegistry`]. When either loop
//! stops, the session is over: every live task observes closure and every
//! pending acknowledgment fails.

use super::registry::TaskRegistry;
use super::task::{await_ack, Task, TaskHandle};
use crate::config::RemoteConfig;
use crate::error::TaskError;
use crate::protocol::{read_frame, write_frame, Command, Frame};
use crate::transport::{SocketOpts, TcpTransport};
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Allocates tasks on one shared, authenticated transport session
pub struct TaskBroker {
    registry: Arc<TaskRegistry>,
    outbound: mpsc::Sender<Frame>,
    closed: CancellationToken,
    ack_timeout: Duration,
    channel_capacity: usize,
}

impl TaskBroker {
    /// Dial the remote relay peer and authenticate
    pub async fn connect(config: &RemoteConfig) -> Result<Arc<Self>> {
        let transport = TcpTransport::with_defaults()
            .with_socket_opts(SocketOpts::from_tcp_config(&config.tcp))
            .with_connect_timeout(config.ack_timeout());

        info!("Connecting to remote relay: {}", config.addr);

        let stream = transport
            .connect_addr(&config.addr)
            .await
            .context("Failed to connect to remote relay")?;

        Self::open(stream, config).await
    }

    /// Authenticate over an established stream and start the session loops
    pub async fn open<S>(mut stream: S, config: &RemoteConfig) -> Result<Arc<Self>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        authenticate(&mut stream, config)
            .await
            .context("Authentication failed")?;

        info!("Shared transport session established");

        Ok(Self::attach(stream, config))
    }

    /// Start the session loops over an already authenticated stream
    pub fn attach<S>(stream: S, config: &RemoteConfig) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (outbound, outbound_rx) = mpsc::channel(config.channel_capacity);
        let registry = Arc::new(TaskRegistry::new());
        let closed = CancellationToken::new();

        tokio::spawn(write_loop(
            writer,
            outbound_rx,
            registry.clone(),
            closed.clone(),
        ));
        tokio::spawn(read_loop(
            reader,
            registry.clone(),
            outbound.clone(),
            closed.clone(),
        ));

        Arc::new(TaskBroker {
            registry,
            outbound,
            closed,
            ack_timeout: config.ack_timeout(),
            channel_capacity: config.channel_capacity,
        })
    }

    /// Allocate a task and register it with the remote
    ///
    /// Suspends until the remote acknowledges the `NEW_TASK` frame or the
    /// acknowledgment timeout elapses.
    pub async fn initiate_task(&self) -> Result<Task, TaskError> {
        if self.closed.is_cancelled() {
            return Err(TaskError::SessionClosed);
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(self.channel_capacity);
        let (ack_tx, ack_rx) = oneshot::channel();
        let id = self.registry.allocate(inbound_tx, ack_tx)?;

        // From here on, dropping `task` releases the id.
        let task = Task::new(
            TaskHandle::new(
                id,
                self.registry.clone(),
                self.outbound.clone(),
                self.ack_timeout,
            ),
            inbound_rx,
        );

        self.outbound
            .send(Frame::new_task(id))
            .await
            .map_err(|_| TaskError::SessionClosed)?;

        await_ack(ack_rx, self.ack_timeout, Command::NewTask).await?;

        debug!("Task {} registered with remote", id);
        Ok(task)
    }

    /// Whether the session has ended
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Wait for the session to end
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// End the session
    pub fn shutdown(&self) {
        self.closed.cancel();
    }

    /// Number of live tasks
    pub fn live_tasks(&self) -> usize {
        self.registry.len()
    }
}

impl Drop for TaskBroker {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// Send `AUTH` and wait for a successful reply
async fn authenticate<S>(stream: &mut S, config: &RemoteConfig) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_frame(stream, &Frame::auth(&config.username, &config.password))
        .await
        .context("Failed to send authentication")?;

    debug!("Sent authentication for user {}", config.username);

    let reply = tokio::time::timeout(config.ack_timeout(), read_frame(stream))
        .await
        .context("Timed out waiting for authentication reply")?
        .context("Failed to read authentication reply")?;

    let frame = match reply {
        Some(frame) => frame,
        None => bail!("Remote closed the connection during authentication"),
    };

    if frame.command != Command::Auth {
        bail!("Unexpected {:?} frame during authentication", frame.command);
    }

    match frame.status() {
        Some(status) if status.is_ok() => {
            debug!("Authentication successful");
            Ok(())
        }
        Some(status) => bail!("Remote rejected credentials: {}", status),
        None => bail!("Empty authentication reply"),
    }
}

/// Drain the outbound queue onto the transport
async fn write_loop<S>(
    mut writer: WriteHalf<S>,
    mut outbound: mpsc::Receiver<Frame>,
    registry: Arc<TaskRegistry>,
    closed: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    loop {
        tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            frame = outbound.recv() => {
                let frame = match frame {
                    Some(frame) => frame,
                    None => break,
                };
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    warn!("Shared transport write failed: {:#}", e);
                    break;
                }
            }
        }
    }

    closed.cancel();
    registry.shutdown();
    let _ = writer.shutdown().await;
    debug!("Session writer stopped");
}

/// Route inbound frames until the transport ends
///
/// Routing never waits on a task, so one slow client cannot hold up the others.
async fn read_loop<S>(
    mut reader: ReadHalf<S>,
    registry: Arc<TaskRegistry>,
    outbound: mpsc::Sender<Frame>,
    closed: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            frame = read_frame(&mut reader) => frame,
        };

        match frame {
            Ok(Some(frame)) => {
                if let Some(reply) = registry.dispatch(frame) {
                    tokio::select! {
                        biased;
                        _ = closed.cancelled() => break,
                        sent = outbound.send(reply) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            Ok(None) => {
                info!("Remote relay closed the shared transport");
                break;
            }
            Err(e) => {
                warn!("Shared transport read failed: {:#}", e);
                break;
            }
        }
    }

    closed.cancel();
    registry.shutdown();
    debug!("Session reader stopped");
}
