//! SOCKS5 listener
//!
//! [`ListenerFront`] owns the listening socket and spawns one
//! [`ConnectionSupervisor`] per accepted client. Stopping it releases the
//! port; connections already accepted keep running to completion.

use super::resolver::TargetResolver;
use super::supervisor::ConnectionSupervisor;
use crate::config::{ListenerConfig, SocksConfig};
use crate::helper::RetryConfig;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Backoff between consecutive accept errors, such as running out of file descriptors
fn accept_backoff() -> RetryConfig {
    RetryConfig {
        max_retries: 0,
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_secs(1),
        multiplier: 2.0,
    }
}

/// Accepts client connections on a local port
pub struct ListenerFront {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    accept_loop: JoinHandle<()>,
    active: Arc<AtomicUsize>,
}

impl ListenerFront {
    /// Bind the configured address and start accepting
    pub async fn start(
        config: &ListenerConfig,
        socks: &SocksConfig,
        resolver: Arc<dyn TargetResolver>,
    ) -> Result<Self> {
        let bind_target = config.bind_target();
        let listener = TcpListener::bind(&bind_target)
            .await
            .with_context(|| format!("Failed to bind SOCKS5 listener on {}", bind_target))?;
        let local_addr = listener
            .local_addr()
            .context("Failed to read listener address")?;

        info!(
            "SOCKS5 listener on {} ({} resolver)",
            local_addr,
            resolver.name()
        );

        let shutdown = CancellationToken::new();
        let active = Arc::new(AtomicUsize::new(0));
        let accept_loop = tokio::spawn(accept_loop(
            listener,
            resolver,
            socks.handshake_timeout(),
            shutdown.clone(),
            active.clone(),
        ));

        Ok(ListenerFront {
            local_addr,
            shutdown,
            accept_loop,
            active,
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of client connections still running
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Stop accepting and release the port
    ///
    /// Established connections are left to finish on their own.
    pub async fn stop(mut self) {
        self.shutdown.cancel();
        if let Err(e) = (&mut self.accept_loop).await {
            warn!("Accept loop ended abnormally: {}", e);
        }
        info!(
            "SOCKS5 listener on {} stopped ({} connections still active)",
            self.local_addr,
            self.active.load(Ordering::Acquire)
        );
    }
}

impl Drop for ListenerFront {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Decrements the active connection count when a supervisor ends
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn new(active: Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::AcqRel);
        ActiveGuard(active)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

async fn accept_loop(
    listener: TcpListener,
    resolver: Arc<dyn TargetResolver>,
    handshake_timeout: Duration,
    shutdown: CancellationToken,
    active: Arc<AtomicUsize>,
) {
    let mut next_id: u64 = 0;
    let backoff = accept_backoff();
    let mut failures: u32 = 0;

    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                failures = 0;
                next_id += 1;
                let id = next_id;
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("[{}] Failed to set TCP_NODELAY: {}", id, e);
                }
                debug!("[{}] Accepted connection from {}", id, peer);

                let guard = ActiveGuard::new(active.clone());
                let supervisor =
                    ConnectionSupervisor::new(id, stream, resolver.clone(), handshake_timeout);
                tokio::spawn(async move {
                    let _guard = guard;
                    if let Err(e) = supervisor.run().await {
                        debug!("[{}] Connection closed: {}", id, e);
                    }
                });
            }
            Err(e) => {
                let delay = backoff.delay_for_attempt(failures);
                failures = failures.saturating_add(1);
                warn!("Failed to accept connection: {}, retrying in {:?}", e, delay);
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    // Dropping the listener here releases the port.
    drop(listener);
}
