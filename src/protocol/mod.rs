//! Protocol module for Sockmux
//!
//! This module implements the framing used on the shared transport to the
//! remote relay peer. One authenticated connection carries many tasks, each
//! frame naming the task it belongs to.

mod codec;
mod types;

pub use codec::{read_frame, write_frame, HEADER_LEN};
pub use types::{
    Command, Frame, FrameHeader, RemoteStatus, TaskId, CONTROL_TASK_ID, MAX_FRAME_PAYLOAD,
};
