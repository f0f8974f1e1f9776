//! Main client structure
//!
//! Manages the client lifecycle for both resolver modes.

use super::session::RemoteSession;
use crate::config::{Config, ResolverType};
use crate::socks::{create_resolver, ListenerFront};
use anyhow::Result;
use tokio::sync::broadcast;
use tracing::info;

/// Main Sockmux client
pub struct Client {
    /// Client configuration
    config: Config,
}

impl Client {
    /// Create a new client with the given configuration
    pub fn new(config: Config) -> Self {
        Client { config }
    }

    /// Run the client until shutdown
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<bool>) -> Result<()> {
        info!("Starting Sockmux client");
        info!("Listen address: {}", self.config.listener.bind_target());
        info!("Resolver: {:?}", self.config.resolver.resolver_type);

        match self.config.resolver.resolver_type {
            ResolverType::Direct => self.run_direct(&mut shutdown_rx).await?,
            ResolverType::Delegated => {
                info!("Remote relay: {}", self.config.remote.addr);
                RemoteSession::new(self.config.clone())
                    .run(&mut shutdown_rx)
                    .await?
            }
        }

        info!("Client stopped");
        Ok(())
    }

    /// Serve with the direct resolver until shutdown
    async fn run_direct(&self, shutdown_rx: &mut broadcast::Receiver<bool>) -> Result<()> {
        let resolver = create_resolver(&self.config, None)?;
        let front =
            ListenerFront::start(&self.config.listener, &self.config.socks, resolver).await?;

        let _ = shutdown_rx.recv().await;
        info!("Shutdown signal received, stopping listener");

        front.stop().await;
        Ok(())
    }

    /// Get a reference to the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }
}
