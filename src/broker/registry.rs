//! Task id allocation and inbound frame routing
//!
//! The registry is the only state shared between client connections. Ids are
//! handed out from a wrapping counter that skips the control id and any id
//! still registered, so a live id is never reused.
//!
//! Routing never waits on a task. A task whose inbound channel is full is
//! evicted: its channel is dropped, it is marked closed and the reader sends
//! `CLOSE` for it. The id stays reserved until the task itself is dropped.

use crate::error::TaskError;
use crate::protocol::{Command, Frame, TaskId, CONTROL_TASK_ID};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// Event delivered to a task's inbound channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    /// Bytes destined for the client socket
    Data(Bytes),
    /// The remote closed the task
    Closed,
}

/// Routing state of one live task
struct TaskSlot {
    // None once the task was evicted
    inbound: Option<mpsc::Sender<TaskEvent>>,
    pending_ack: Option<oneshot::Sender<Frame>>,
    close_sent: Arc<AtomicBool>,
}

struct Slots {
    tasks: HashMap<TaskId, TaskSlot>,
    closed: bool,
}

/// Registry of live tasks on one shared transport session
pub struct TaskRegistry {
    next_id: AtomicU32,
    slots: Mutex<Slots>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        TaskRegistry {
            next_id: AtomicU32::new(1),
            slots: Mutex::new(Slots {
                tasks: HashMap::new(),
                closed: false,
            }),
        }
    }

    // Critical sections never await and never panic, a poisoned lock still
    // holds consistent data.
    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new task
    ///
    /// `ack` receives the remote's reply to the `NEW_TASK` frame the caller is
    /// about to send. Fails with [`TaskError::SessionClosed`] once the
    /// registry has been shut down.
    pub fn allocate(
        &self,
        inbound: mpsc::Sender<TaskEvent>,
        ack: oneshot::Sender<Frame>,
    ) -> Result<TaskId, TaskError> {
        let mut slots = self.lock();
        if slots.closed {
            return Err(TaskError::SessionClosed);
        }
        if slots.tasks.len() >= (u32::MAX - 1) as usize {
            return Err(TaskError::Protocol("Task id space exhausted".to_string()));
        }

        let id = loop {
            let candidate = self.next_id.fetch_add(1, Ordering::Relaxed);
            if candidate != CONTROL_TASK_ID && !slots.tasks.contains_key(&candidate) {
                break candidate;
            }
        };

        slots.tasks.insert(
            id,
            TaskSlot {
                inbound: Some(inbound),
                pending_ack: Some(ack),
                close_sent: Arc::new(AtomicBool::new(false)),
            },
        );
        trace!("Allocated task {} ({} live)", id, slots.tasks.len());
        Ok(id)
    }

    /// Wait for the next acknowledgment frame on `tid`
    pub fn expect_ack(&self, tid: TaskId, ack: oneshot::Sender<Frame>) -> Result<(), TaskError> {
        let mut slots = self.lock();
        if slots.closed {
            return Err(TaskError::SessionClosed);
        }
        match slots.tasks.get_mut(&tid) {
            Some(slot) => {
                slot.pending_ack = Some(ack);
                Ok(())
            }
            None => Err(TaskError::Closed),
        }
    }

    /// Flag recording whether `CLOSE` was sent for `tid`
    ///
    /// Shared by the task and the registry so that exactly one of them sends it.
    pub fn close_flag(&self, tid: TaskId) -> Option<Arc<AtomicBool>> {
        self.lock()
            .tasks
            .get(&tid)
            .map(|slot| slot.close_sent.clone())
    }

    /// Forget a task
    ///
    /// Returns `false` when the id was not registered.
    pub fn release(&self, tid: TaskId) -> bool {
        let removed = self.lock().tasks.remove(&tid).is_some();
        if removed {
            trace!("Released task {}", tid);
        }
        removed
    }

    /// Route a frame read from the shared transport to its task
    ///
    /// Never waits. Returns a `CLOSE` frame to send when the target task was
    /// evicted because its inbound channel is full.
    pub fn dispatch(&self, frame: Frame) -> Option<Frame> {
        let event = match frame.command {
            Command::Data => TaskEvent::Data(frame.payload),
            Command::Close => TaskEvent::Closed,
            Command::NewTask | Command::Connect => {
                let ack = self
                    .lock()
                    .tasks
                    .get_mut(&frame.tid)
                    .and_then(|slot| slot.pending_ack.take());
                match ack {
                    Some(ack) => {
                        let _ = ack.send(frame);
                    }
                    None => debug!(
                        "Dropping unexpected {:?} ack for task {}",
                        frame.command, frame.tid
                    ),
                }
                return None;
            }
            Command::Auth => {
                warn!("Ignoring AUTH frame on an authenticated session");
                return None;
            }
        };

        let mut slots = self.lock();
        let slot = match slots.tasks.get_mut(&frame.tid) {
            Some(slot) => slot,
            None => {
                debug!(
                    "Dropping {:?} frame for unknown task {}",
                    frame.command, frame.tid
                );
                return None;
            }
        };
        let inbound = match &slot.inbound {
            Some(inbound) => inbound,
            None => {
                trace!("Dropping {:?} frame for evicted task {}", frame.command, frame.tid);
                return None;
            }
        };

        match inbound.try_send(event) {
            Ok(()) => None,
            Err(TrySendError::Closed(_)) => {
                debug!("Task {} receiver is gone", frame.tid);
                None
            }
            Err(TrySendError::Full(_)) => {
                warn!(
                    "Task {} is not draining its inbound data, closing it",
                    frame.tid
                );
                slot.inbound = None;
                slot.pending_ack = None;
                if slot.close_sent.swap(true, Ordering::AcqRel) {
                    None
                } else {
                    Some(Frame::close(frame.tid))
                }
            }
        }
    }

    /// Close the registry
    ///
    /// Every inbound channel and pending acknowledgment is dropped, so live
    /// tasks observe the end of their stream and waiters fail.
    pub fn shutdown(&self) {
        let mut slots = self.lock();
        slots.closed = true;
        let count = slots.tasks.len();
        slots.tasks.clear();
        if count > 0 {
            debug!("Shut down task registry with {} live tasks", count);
        }
    }

    /// Whether [`TaskRegistry::shutdown`] was called
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of live tasks
    pub fn len(&self) -> usize {
        self.lock().tasks.len()
    }

    /// Whether no task is live
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `tid` is live
    pub fn contains(&self, tid: TaskId) -> bool {
        self.lock().tasks.contains_key(&tid)
    }

    #[cfg(test)]
    fn set_next_id(&self, id: TaskId) {
        self.next_id.store(id, Ordering::Relaxed);
    }
}
