//! Target resolution
//!
//! A [`TargetResolver`] turns the decoded CONNECT target into a live peer.
//! [`DirectDial`] opens a TCP connection from this host; [`DelegatedTask`]
//! asks the remote relay peer to dial on a task of the shared transport.
//! The resolver is picked from configuration, the handshake is the same.

use super::addr::ParsedAddress;
use crate::broker::{Task, TaskBroker};
use crate::config::{Config, ResolverType};
use crate::error::Socks5Error;
use crate::transport::{SocketOpts, TcpTransport};
use anyhow::{bail, Result};
use std::fmt::{self, Debug};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::debug;

/// The other end of a client connection
#[derive(Debug)]
pub enum Peer {
    /// Socket dialed from this host
    Direct(TcpStream),
    /// Task on the shared transport
    Task(Task),
}

/// Result of a successful resolution
#[derive(Debug)]
pub struct Established {
    /// Peer to relay with
    pub peer: Peer,
    /// Address reported to the client in the success reply
    pub bound: SocketAddr,
}

/// Capability that establishes a peer for a CONNECT target
#[async_trait::async_trait]
pub trait TargetResolver: Send + Sync + Debug {
    /// Human-readable name of this resolver (e.g., "direct")
    fn name(&self) -> &str;

    /// Establish a peer for `target`
    ///
    /// Every failure is reported as [`Socks5Error::UpstreamUnreachable`].
    async fn establish(&self, target: &ParsedAddress) -> Result<Established, Socks5Error>;
}

/// Dial targets from this host
#[derive(Debug, Clone)]
pub struct DirectDial {
    transport: TcpTransport,
}

impl DirectDial {
    /// Create a resolver dialing through `transport`
    pub fn new(transport: TcpTransport) -> Self {
        DirectDial { transport }
    }
}

#[async_trait::async_trait]
impl TargetResolver for DirectDial {
    fn name(&self) -> &str {
        "direct"
    }

    async fn establish(&self, target: &ParsedAddress) -> Result<Established, Socks5Error> {
        let stream = self
            .transport
            .connect(target.host(), target.port())
            .await
            .map_err(|e| Socks5Error::UpstreamUnreachable(format!("{}: {:#}", target, e)))?;

        let bound = stream
            .local_addr()
            .map_err(|e| Socks5Error::UpstreamUnreachable(format!("{}: {}", target, e)))?;

        debug!("Dialed {} directly, bound {}", target, bound);

        Ok(Established {
            peer: Peer::Direct(stream),
            bound,
        })
    }
}

/// Let the remote relay peer dial targets over the shared transport
pub struct DelegatedTask {
    broker: Arc<TaskBroker>,
}

impl Debug for DelegatedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegatedTask")
            .field("live_tasks", &self.broker.live_tasks())
            .finish()
    }
}

impl DelegatedTask {
    /// Create a resolver allocating tasks from `broker`
    pub fn new(broker: Arc<TaskBroker>) -> Self {
        DelegatedTask { broker }
    }
}

#[async_trait::async_trait]
impl TargetResolver for DelegatedTask {
    fn name(&self) -> &str {
        "delegated"
    }

    async fn establish(&self, target: &ParsedAddress) -> Result<Established, Socks5Error> {
        let task = self.broker.initiate_task().await?;

        // Dropping `task` on failure releases the id and closes it remotely.
        let bound = task.connect(target).await?;

        debug!("Task {} connected to {}", task.id(), target);

        Ok(Established {
            bound: bound.unwrap_or(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))),
            peer: Peer::Task(task),
        })
    }
}

/// Create the [`TargetResolver`] selected by configuration
///
/// The delegated resolver needs the broker of the current session.
pub fn create_resolver(
    config: &Config,
    broker: Option<Arc<TaskBroker>>,
) -> Result<Arc<dyn TargetResolver>> {
    match config.resolver.resolver_type {
        ResolverType::Direct => {
            let transport = TcpTransport::with_defaults()
                .with_socket_opts(SocketOpts::for_direct_dial())
                .with_connect_timeout(config.socks.connect_timeout());
            Ok(Arc::new(DirectDial::new(transport)))
        }
        ResolverType::Delegated => match broker {
            Some(broker) => Ok(Arc::new(DelegatedTask::new(broker))),
            None => bail!("Delegated resolver requires a shared transport session"),
        },
    }
}
