//! # Sockmux - Local SOCKS5 Proxy with Multiplexed Relay
//!
//! Sockmux is a local SOCKS5 proxy supporting the CONNECT command. Each
//! accepted client is either dialed directly from this host or handed to a
//! remote relay peer as a task multiplexed over one shared, authenticated
//! transport.
//!
//! ## Features
//!
//! - **SOCKS5 CONNECT**: no-auth method negotiation, IPv4, domain and IPv6 targets
//! - **Fragmentation tolerant**: handshake messages may arrive in any chunking
//! - **Pluggable resolution**: `direct` or `delegated` target resolver
//! - **Multiplexed relay**: many client connections over one remote session
//! - **Automatic reconnect**: the listener follows the session lifecycle
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sockmux::config::load_config;
//! use sockmux::client::run_client;
//! use tokio::sync::broadcast;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config("config.toml")?;
//!     let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
//!
//!     run_client(config, shutdown_rx).await
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! SOCKS5 Client -> ListenerFront -> ConnectionSupervisor -> Target
//!                                          |
//!                                          +-> TaskBroker -> Remote relay -> Target
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod broker;
pub mod client;
pub mod config;
pub mod error;
pub mod helper;
pub mod protocol;
pub mod socks;
pub mod transport;

// Re-export commonly used items
pub use broker::TaskBroker;
pub use client::run_client;
pub use config::{load_config, Config};
pub use error::{Socks5Error, TaskError};
pub use socks::ListenerFront;

/// Version of the Sockmux library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");
