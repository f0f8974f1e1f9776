//! Protocol type definitions
//!
//! Frames exchanged with the remote relay peer over the shared transport.
//! Every frame carries the task it belongs to, so many client connections
//! share one authenticated connection.

use crate::socks::ParsedAddress;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Multiplexed task identifier
pub type TaskId = u32;

/// Task id used by session-level frames (authentication)
pub const CONTROL_TASK_ID: TaskId = 0;

/// Largest payload accepted in a single frame
pub const MAX_FRAME_PAYLOAD: usize = 64 * 1024;

/// Frame commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Ask the remote to dial the task's target
    Connect = 1,
    /// Relay bytes for a task
    Data = 2,
    /// End a task
    Close = 3,
    /// Authenticate the session
    Auth = 128,
    /// Register a new task id with the remote
    NewTask = 129,
}

impl Command {
    /// Parse a command byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Command::Connect),
            2 => Some(Command::Data),
            3 => Some(Command::Close),
            128 => Some(Command::Auth),
            129 => Some(Command::NewTask),
            _ => None,
        }
    }

    /// Command byte
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// Status byte returned by the remote for `Auth`, `NewTask` and `Connect`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStatus {
    /// Request accepted
    Ok,
    /// Session credentials rejected
    BadCredentials,
    /// Task id already registered on the remote
    TidExists,
    /// Remote could not open a connection for the task
    NoConnectionOnTask,
    /// Remote does not know the task id
    TidNotFound,
    /// Status byte this client does not know
    Other(u8),
}

impl RemoteStatus {
    /// Parse a status byte
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0 => RemoteStatus::Ok,
            1 => RemoteStatus::BadCredentials,
            2 => RemoteStatus::TidExists,
            3 => RemoteStatus::NoConnectionOnTask,
            4 => RemoteStatus::TidNotFound,
            other => RemoteStatus::Other(other),
        }
    }

    /// Status byte
    pub fn to_byte(self) -> u8 {
        match self {
            RemoteStatus::Ok => 0,
            RemoteStatus::BadCredentials => 1,
            RemoteStatus::TidExists => 2,
            RemoteStatus::NoConnectionOnTask => 3,
            RemoteStatus::TidNotFound => 4,
            RemoteStatus::Other(byte) => byte,
        }
    }

    /// Check if the status indicates success
    pub fn is_ok(&self) -> bool {
        matches!(self, RemoteStatus::Ok)
    }
}

impl fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteStatus::Ok => write!(f, "Ok"),
            RemoteStatus::BadCredentials => write!(f, "Bad username or password"),
            RemoteStatus::TidExists => write!(f, "Task id already exists"),
            RemoteStatus::NoConnectionOnTask => write!(f, "No connection on task"),
            RemoteStatus::TidNotFound => write!(f, "Task id not found"),
            RemoteStatus::Other(byte) => write!(f, "Unknown status {}", byte),
        }
    }
}

/// Fixed-size frame header, bincode encoded
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Command byte
    pub cmd: u8,
    /// Task the frame belongs to
    pub tid: TaskId,
    /// Payload length
    pub len: u32,
}

/// A frame on the shared transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame command
    pub command: Command,
    /// Task the frame belongs to
    pub tid: TaskId,
    /// Command specific payload
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame
    pub fn new(command: Command, tid: TaskId, payload: Bytes) -> Self {
        Frame {
            command,
            tid,
            payload,
        }
    }

    /// Session authentication: `ULEN | USERNAME | PLEN | PASSWORD`
    pub fn auth(username: &str, password: &str) -> Self {
        let mut payload = BytesMut::with_capacity(2 + username.len() + password.len());
        payload.put_u8(username.len() as u8);
        payload.put_slice(username.as_bytes());
        payload.put_u8(password.len() as u8);
        payload.put_slice(password.as_bytes());
        Frame::new(Command::Auth, CONTROL_TASK_ID, payload.freeze())
    }

    /// Register a task id
    pub fn new_task(tid: TaskId) -> Self {
        Frame::new(Command::NewTask, tid, Bytes::new())
    }

    /// Ask the remote to dial `target` for the task
    pub fn connect(tid: TaskId, target: &ParsedAddress) -> Self {
        Frame::new(Command::Connect, tid, Bytes::from(target.to_bytes()))
    }

    /// Relay bytes
    pub fn data(tid: TaskId, data: Bytes) -> Self {
        Frame::new(Command::Data, tid, data)
    }

    /// End a task
    pub fn close(tid: TaskId) -> Self {
        Frame::new(Command::Close, tid, Bytes::new())
    }

    /// Reply to a request frame with a status byte and optional extra bytes
    pub fn ack(command: Command, tid: TaskId, status: RemoteStatus, extra: &[u8]) -> Self {
        let mut payload = BytesMut::with_capacity(1 + extra.len());
        payload.put_u8(status.to_byte());
        payload.put_slice(extra);
        Frame::new(command, tid, payload.freeze())
    }

    /// Status byte of an ack frame
    pub fn status(&self) -> Option<RemoteStatus> {
        self.payload.first().map(|b| RemoteStatus::from_byte(*b))
    }

    /// Header describing this frame
    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            cmd: self.command.to_byte(),
            tid: self.tid,
            len: self.payload.len() as u32,
        }
    }
}
