//! Remote relay session management
//!
//! In delegated mode the SOCKS5 listener only runs while a shared transport
//! session is up: connect, authenticate, serve, and when the session drops,
//! stop the listener and reconnect with exponential backoff.

use crate::broker::TaskBroker;
use crate::config::Config;
use crate::helper::RetryConfig;
use crate::socks::{create_resolver, ListenerFront};
use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The shared transport went away
    Lost,
    /// A shutdown signal was received
    Shutdown,
}

/// Keeps the shared transport session and its listener alive
pub struct RemoteSession {
    /// Client configuration
    config: Config,
    /// Reconnect policy
    retry: RetryConfig,
}

impl RemoteSession {
    /// Create a session manager with backoff taken from the remote config
    pub fn new(config: Config) -> Self {
        let retry = RetryConfig::new(config.remote.max_retries);
        RemoteSession { config, retry }
    }

    /// Override the reconnect policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Run sessions with automatic reconnection until shutdown
    pub async fn run(&self, shutdown_rx: &mut broadcast::Receiver<bool>) -> Result<()> {
        let mut attempt = 0u32;

        loop {
            match self.run_once(shutdown_rx).await {
                Ok(SessionEnd::Shutdown) => {
                    info!("Shutdown signal received, closing session");
                    return Ok(());
                }
                Ok(SessionEnd::Lost) => {
                    // The session was up, so the backoff starts over.
                    attempt = 0;
                    warn!("Shared transport session lost, reconnecting");
                }
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    if self.retry.is_exhausted(attempt) {
                        error!("Max retries exceeded, giving up");
                        return Err(e);
                    }

                    let delay = self.retry.delay_for_attempt(attempt - 1);
                    warn!(
                        "Session error: {:#}. Reconnecting in {:?}... (attempt {})",
                        e, delay, attempt
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_rx.recv() => {
                            info!("Shutdown signal received while waiting to reconnect");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Run a single session
    ///
    /// Errors before the listener is up count against the retry budget.
    async fn run_once(&self, shutdown_rx: &mut broadcast::Receiver<bool>) -> Result<SessionEnd> {
        let broker = tokio::select! {
            broker = TaskBroker::connect(&self.config.remote) => {
                broker.context("Failed to establish shared transport session")?
            }
            _ = shutdown_rx.recv() => return Ok(SessionEnd::Shutdown),
        };

        let resolver = create_resolver(&self.config, Some(broker.clone()))?;
        let front = ListenerFront::start(&self.config.listener, &self.config.socks, resolver)
            .await
            .inspect_err(|_| broker.shutdown())?;

        let end = tokio::select! {
            _ = broker.closed() => SessionEnd::Lost,
            _ = shutdown_rx.recv() => SessionEnd::Shutdown,
        };

        front.stop().await;
        broker.shutdown();
        info!(
            "Session ended ({:?}), {} tasks were live",
            end,
            broker.live_tasks()
        );
        Ok(end)
    }
}
