//! SOCKS5 module for Sockmux
//!
//! This module implements the client-facing SOCKS5 subset: method
//! negotiation without authentication and the CONNECT command. Each accepted
//! socket gets a [`ConnectionSupervisor`] that runs the [`HandshakeEngine`],
//! resolves the target through a [`TargetResolver`] and relays bytes.

pub mod addr;
mod consts;
mod handshake;
mod listener;
mod relay;
mod resolver;
mod supervisor;

pub use addr::{AddressKind, ParsedAddress};
pub use consts::*;
pub use handshake::{transition, ConnectionState, HandshakeEngine, HandshakeEvent};
pub use listener::ListenerFront;
pub use relay::{relay, ChunkSink, ChunkSource, RelayStats, StreamSink, StreamSource};
pub use resolver::{
    create_resolver, DelegatedTask, DirectDial, Established, Peer, TargetResolver,
};
pub use supervisor::ConnectionSupervisor;
