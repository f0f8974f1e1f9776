//! Task channels
//!
//! A [`Task`] is one client connection's view of the shared transport: a
//! task id, an outbound path that wraps bytes into `DATA` frames and an
//! inbound channel fed by the session reader. Dropping the last half of a
//! task releases its id and tells the remote, exactly once.

use super::registry::{TaskEvent, TaskRegistry};
use crate::error::TaskError;
use crate::protocol::{Command, Frame, TaskId, MAX_FRAME_PAYLOAD};
use crate::socks::ParsedAddress;
use bytes::Bytes;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// Shared state of a task, owned jointly by its two halves
pub(crate) struct TaskHandle {
    id: TaskId,
    registry: Arc<TaskRegistry>,
    outbound: mpsc::Sender<Frame>,
    // Shared with the registry, which sets it when it evicts the task
    close_sent: Arc<AtomicBool>,
    ack_timeout: Duration,
}

impl TaskHandle {
    pub(crate) fn new(
        id: TaskId,
        registry: Arc<TaskRegistry>,
        outbound: mpsc::Sender<Frame>,
        ack_timeout: Duration,
    ) -> Self {
        let close_sent = registry
            .close_flag(id)
            .unwrap_or_else(|| Arc::new(AtomicBool::new(true)));
        TaskHandle {
            id,
            registry,
            outbound,
            close_sent,
            ack_timeout,
        }
    }

    fn is_closed(&self) -> bool {
        self.close_sent.load(Ordering::Acquire)
    }

    /// Send `CLOSE` unless it was already sent
    async fn close(&self) -> bool {
        if self.close_sent.swap(true, Ordering::AcqRel) {
            return false;
        }
        if self.outbound.send(Frame::close(self.id)).await.is_err() {
            trace!("Session gone before task {} could be closed", self.id);
        }
        true
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.registry.release(self.id);
        if !self.close_sent.swap(true, Ordering::AcqRel) {
            match self.outbound.try_send(Frame::close(self.id)) {
                Ok(()) => {}
                // A closed queue means the session is gone and the remote drops
                // the task with it.
                Err(TrySendError::Closed(_)) => {}
                Err(TrySendError::Full(frame)) => match Handle::try_current() {
                    Ok(runtime) => {
                        let outbound = self.outbound.clone();
                        runtime.spawn(async move {
                            let _ = outbound.send(frame).await;
                        });
                    }
                    Err(_) => warn!("No runtime to send CLOSE for task {}", self.id),
                },
            }
        }
        debug!("Task {} released", self.id);
    }
}

/// Wait for an acknowledgment and check its status byte
pub(crate) async fn await_ack(
    ack: oneshot::Receiver<Frame>,
    timeout: Duration,
    expected: Command,
) -> Result<Frame, TaskError> {
    let frame = match tokio::time::timeout(timeout, ack).await {
        Ok(Ok(frame)) => frame,
        Ok(Err(_)) => return Err(TaskError::SessionClosed),
        Err(_) => return Err(TaskError::Timeout),
    };

    if frame.command != expected {
        return Err(TaskError::Protocol(format!(
            "expected {:?} ack, got {:?}",
            expected, frame.command
        )));
    }

    match frame.status() {
        Some(status) if status.is_ok() => Ok(frame),
        Some(status) => Err(TaskError::Rejected(status)),
        None => Err(TaskError::Protocol(format!(
            "empty {:?} ack",
            expected
        ))),
    }
}

/// A multiplexed task allocated by the [`super::TaskBroker`]
pub struct Task {
    handle: Arc<TaskHandle>,
    inbound: mpsc::Receiver<TaskEvent>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").field("id", &self.handle.id).finish()
    }
}

impl Task {
    pub(crate) fn new(handle: TaskHandle, inbound: mpsc::Receiver<TaskEvent>) -> Self {
        Task {
            handle: Arc::new(handle),
            inbound,
        }
    }

    /// Task id on the shared transport
    pub fn id(&self) -> TaskId {
        self.handle.id
    }

    /// Ask the remote to dial `target` for this task
    ///
    /// Returns the remote's bound address when the ack carries one.
    pub async fn connect(&self, target: &ParsedAddress) -> Result<Option<SocketAddr>, TaskError> {
        let handle = &self.handle;
        if handle.is_closed() {
            return Err(TaskError::Closed);
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        handle.registry.expect_ack(handle.id, ack_tx)?;
        handle
            .outbound
            .send(Frame::connect(handle.id, target))
            .await
            .map_err(|_| TaskError::SessionClosed)?;

        let ack = await_ack(ack_rx, handle.ack_timeout, Command::Connect).await?;
        debug!("Task {} connected to {}", handle.id, target);
        Ok(parse_bound(&ack.payload[1..]))
    }

    /// Close the task, sending `CLOSE` at most once
    pub async fn close(&self) -> bool {
        self.handle.close().await
    }

    /// Split into independently owned outbound and inbound halves
    pub fn into_split(self) -> (TaskSender, TaskReceiver) {
        (
            TaskSender {
                handle: self.handle,
            },
            TaskReceiver {
                inbound: self.inbound,
                finished: false,
            },
        )
    }
}

/// `ADDR(4) | PORT(2)` following the status byte of a `CONNECT` ack
fn parse_bound(extra: &[u8]) -> Option<SocketAddr> {
    if extra.len() < 6 {
        return None;
    }
    let ip = Ipv4Addr::new(extra[0], extra[1], extra[2], extra[3]);
    let port = u16::from_be_bytes([extra[4], extra[5]]);
    Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
}

/// Outbound half of a task
pub struct TaskSender {
    handle: Arc<TaskHandle>,
}

impl TaskSender {
    /// Task id
    pub fn id(&self) -> TaskId {
        self.handle.id
    }

    /// Send bytes to the remote, split into frames no larger than the payload limit
    ///
    /// Waits while the outbound queue is full.
    pub async fn send(&self, mut data: Bytes) -> Result<(), TaskError> {
        if self.handle.is_closed() {
            return Err(TaskError::Closed);
        }
        while !data.is_empty() {
            let chunk = data.split_to(data.len().min(MAX_FRAME_PAYLOAD));
            self.handle
                .outbound
                .send(Frame::data(self.handle.id, chunk))
                .await
                .map_err(|_| TaskError::SessionClosed)?;
        }
        Ok(())
    }

    /// Tell the remote this side is done
    ///
    /// Returns `false` when the task was already closed.
    pub async fn close(&self) -> bool {
        self.handle.close().await
    }
}

/// Inbound half of a task
pub struct TaskReceiver {
    inbound: mpsc::Receiver<TaskEvent>,
    finished: bool,
}

impl TaskReceiver {
    /// Next chunk from the remote, `None` once the task or the session closed
    pub async fn recv(&mut self) -> Option<Bytes> {
        if self.finished {
            return None;
        }
        match self.inbound.recv().await {
            Some(TaskEvent::Data(data)) => Some(data),
            Some(TaskEvent::Closed) | None => {
                self.finished = true;
                None
            }
        }
    }
}
