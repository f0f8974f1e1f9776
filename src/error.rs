//! Error types for Sockmux
//!
//! Bootstrap and session failures are reported through `anyhow`. The types
//! here cover one client connection and one task. Every [`Socks5Error`] is scoped to a single client connection: the
//! connection is closed and discarded, siblings and the listener keep running.

use crate::protocol::RemoteStatus;
use crate::socks::ConnectionState;
use std::io;
use thiserror::Error;

/// SOCKS5 connection errors
#[derive(Error, Debug)]
pub enum Socks5Error {
    /// Version byte was not 0x05
    #[error("Unsupported SOCKS version: {0}")]
    ProtocolVersionMismatch(u8),

    /// Method negotiation offered zero methods
    #[error("No authentication methods offered")]
    NoMethodsOffered,

    /// Command other than CONNECT
    #[error("Command not supported: {code} ({label})")]
    UnsupportedCommand {
        /// Raw command byte
        code: u8,
        /// Human label of the command, "unknown" when unrecognized
        label: &'static str,
    },

    /// Address could not be decoded
    #[error("Malformed address: {0}")]
    MalformedAddress(String),

    /// Target could not be reached directly or through a task
    #[error("Upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// Socket level failure on either side
    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),

    /// State machine asked to move along an edge that does not exist
    #[error("Invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        /// State the connection was in
        from: ConnectionState,
        /// State that was requested
        to: ConnectionState,
    },
}

impl Socks5Error {
    /// Whether the error came from the client's bytes rather than I/O or the upstream
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Socks5Error::ProtocolVersionMismatch(_)
                | Socks5Error::NoMethodsOffered
                | Socks5Error::UnsupportedCommand { .. }
                | Socks5Error::MalformedAddress(_)
                | Socks5Error::InvalidTransition { .. }
        )
    }
}

/// Errors surfaced by the task broker
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The shared transport session is gone
    #[error("Shared transport session closed")]
    SessionClosed,

    /// Remote peer answered with a failure status
    #[error("Remote rejected request: {0}")]
    Rejected(RemoteStatus),

    /// Remote peer did not answer in time
    #[error("Timed out waiting for remote acknowledgment")]
    Timeout,

    /// Remote peer sent something that does not fit the exchange
    #[error("Unexpected reply from remote: {0}")]
    Protocol(String),

    /// Data was sent on a task after its close
    #[error("Task already closed")]
    Closed,
}

impl From<TaskError> for Socks5Error {
    fn from(err: TaskError) -> Self {
        Socks5Error::UpstreamUnreachable(err.to_string())
    }
}
