//! Client module for Sockmux
//!
//! This module contains the process-level lifecycle: starting the SOCKS5
//! listener, and in delegated mode keeping the shared transport session to
//! the remote relay peer alive.

#[allow(clippy::module_inception)]
mod client;
mod session;

pub use client::Client;
pub use session::{RemoteSession, SessionEnd};

use crate::config::Config;
use anyhow::Result;
use tokio::sync::broadcast;

/// Run the client with the given configuration until shutdown
pub async fn run_client(config: Config, shutdown_rx: broadcast::Receiver<bool>) -> Result<()> {
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    Client::new(config).run(shutdown_rx).await
}
