//! SOCKS5 handshake state machine
//!
//! The engine is sans-IO: the supervisor feeds it whatever the client socket
//! delivered and polls it for events. Partial messages stay buffered until a
//! complete method list or a complete request (header, address and port) is
//! available, so chunk boundaries never matter.

use super::addr::{self, ParsedAddress};
use super::consts::*;
use crate::error::Socks5Error;
use bytes::{Buf, Bytes, BytesMut};
use std::net::SocketAddr;

/// Per-connection protocol state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for `VER | NMETHODS | METHODS`
    AwaitingMethods,
    /// Waiting for `VER | CMD | RSV | ATYP | ADDR | PORT`
    AwaitingRequest,
    /// Peer established, bytes are copied verbatim
    Relaying,
    /// Terminal
    Closed,
}

/// Apply a state change
///
/// Only the forward edges of the handshake exist, plus an edge from every
/// state into [`ConnectionState::Closed`]. Anything else is rejected.
pub fn transition(
    from: ConnectionState,
    to: ConnectionState,
) -> Result<ConnectionState, Socks5Error> {
    use ConnectionState::*;

    match (from, to) {
        (AwaitingMethods, AwaitingRequest) | (AwaitingRequest, Relaying) => Ok(to),
        (_, Closed) => Ok(Closed),
        (AwaitingMethods, _) | (AwaitingRequest, _) | (Relaying, _) | (Closed, _) => {
            Err(Socks5Error::InvalidTransition { from, to })
        }
    }
}

/// Output of [`HandshakeEngine::poll`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeEvent {
    /// Method negotiation done, write these bytes back to the client
    MethodSelected([u8; 2]),
    /// A CONNECT request was decoded; the engine now waits for
    /// [`HandshakeEngine::establish`] or [`HandshakeEngine::close`]
    ConnectRequested(ParsedAddress),
}

/// Drives one client connection from method negotiation to relaying
#[derive(Debug)]
pub struct HandshakeEngine {
    state: ConnectionState,
    buf: BytesMut,
    connect_pending: bool,
}

impl Default for HandshakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl HandshakeEngine {
    /// Create an engine in [`ConnectionState::AwaitingMethods`]
    pub fn new() -> Self {
        HandshakeEngine {
            state: ConnectionState::AwaitingMethods,
            buf: BytesMut::with_capacity(64),
            connect_pending: false,
        }
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[cfg(test)]
    pub(crate) fn is_connect_pending(&self) -> bool {
        self.connect_pending
    }

    /// Append bytes received from the client
    pub fn feed(&mut self, data: &[u8]) -> Result<(), Socks5Error> {
        match self.state {
            ConnectionState::AwaitingMethods | ConnectionState::AwaitingRequest => {
                self.buf.extend_from_slice(data);
                Ok(())
            }
            state => Err(Socks5Error::InvalidTransition {
                from: state,
                to: ConnectionState::AwaitingRequest,
            }),
        }
    }

    /// Advance over buffered input
    ///
    /// Returns `Ok(None)` when more bytes are needed. Any error closes the
    /// engine.
    pub fn poll(&mut self) -> Result<Option<HandshakeEvent>, Socks5Error> {
        let result = match self.state {
            ConnectionState::AwaitingMethods => self.poll_methods(),
            ConnectionState::AwaitingRequest => self.poll_request(),
            ConnectionState::Relaying | ConnectionState::Closed => Ok(None),
        };

        if result.is_err() {
            self.close();
        }
        result
    }

    /// Finish the handshake once the peer is established
    ///
    /// Returns the success reply to send and any bytes the client already
    /// pipelined after its request, which belong to the relay.
    pub fn establish(&mut self, bound: SocketAddr) -> Result<(Vec<u8>, Bytes), Socks5Error> {
        if !self.connect_pending {
            return Err(Socks5Error::InvalidTransition {
                from: self.state,
                to: ConnectionState::Relaying,
            });
        }

        self.state = transition(self.state, ConnectionState::Relaying)?;
        self.connect_pending = false;

        let mut reply = vec![
            SOCKS5_VERSION,
            SOCKS5_REPLY_SUCCEEDED,
            SOCKS5_RESERVED,
            SOCKS5_ADDR_TYPE_IPV4,
        ];
        reply.extend_from_slice(&addr::encode_bound(bound));

        Ok((reply, self.buf.split().freeze()))
    }

    /// Move to [`ConnectionState::Closed`]
    ///
    /// Returns `true` only for the call that actually closed the engine.
    pub fn close(&mut self) -> bool {
        if self.state == ConnectionState::Closed {
            return false;
        }
        self.state = ConnectionState::Closed;
        self.connect_pending = false;
        self.buf.clear();
        true
    }

    fn poll_methods(&mut self) -> Result<Option<HandshakeEvent>, Socks5Error> {
        let Some(&version) = self.buf.first() else {
            return Ok(None);
        };
        if version != SOCKS5_VERSION {
            return Err(Socks5Error::ProtocolVersionMismatch(version));
        }

        let Some(&nmethods) = self.buf.get(1) else {
            return Ok(None);
        };
        if nmethods < 1 {
            return Err(Socks5Error::NoMethodsOffered);
        }

        let needed = 2 + nmethods as usize;
        if self.buf.len() < needed {
            return Ok(None);
        }

        self.buf.advance(needed);
        self.state = transition(self.state, ConnectionState::AwaitingRequest)?;

        Ok(Some(HandshakeEvent::MethodSelected([
            SOCKS5_VERSION,
            SOCKS5_AUTH_METHOD_NONE,
        ])))
    }

    fn poll_request(&mut self) -> Result<Option<HandshakeEvent>, Socks5Error> {
        if self.connect_pending {
            return Ok(None);
        }

        let Some(&version) = self.buf.first() else {
            return Ok(None);
        };
        if version != SOCKS5_VERSION {
            return Err(Socks5Error::ProtocolVersionMismatch(version));
        }

        let Some(&cmd) = self.buf.get(1) else {
            return Ok(None);
        };
        if cmd != SOCKS5_CMD_TCP_CONNECT {
            return Err(Socks5Error::UnsupportedCommand {
                code: cmd,
                label: command_label(cmd),
            });
        }

        // The address kind comes from the codec's own tag byte only.
        let Some(addr_len) = addr::address_len(&self.buf, SOCKS5_REQUEST_ADDR_OFFSET) else {
            return Ok(None);
        };
        let total = SOCKS5_REQUEST_ADDR_OFFSET + addr_len;
        if self.buf.len() < total {
            return Ok(None);
        }

        let (target, used) = addr::decode(&self.buf[..total], SOCKS5_REQUEST_ADDR_OFFSET)?;
        self.buf.advance(SOCKS5_REQUEST_ADDR_OFFSET + used);
        self.connect_pending = true;

        Ok(Some(HandshakeEvent::ConnectRequested(target)))
    }
}
