//! TCP transport implementation
//!
//! Dials `host:port` targets with a timeout and applies socket options.

use super::SocketOpts;
use anyhow::{Context, Result};
use std::time::Duration;
use tokio::net::TcpStream;

/// TCP transport for plain connections
#[derive(Debug, Clone)]
pub struct TcpTransport {
    /// Socket options to apply to connections
    socket_opts: SocketOpts,
    /// Connection timeout
    connect_timeout: Duration,
}

impl TcpTransport {
    /// Create a new TCP transport with default options
    pub fn with_defaults() -> Self {
        TcpTransport {
            socket_opts: SocketOpts::default(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Set socket options
    pub fn with_socket_opts(mut self, opts: SocketOpts) -> Self {
        self.socket_opts = opts;
        self
    }

    /// Set connection timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Connection timeout
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Connect to `host:port`
    ///
    /// `host` may be an IPv4 or IPv6 literal or a name to resolve.
    pub async fn connect(&self, host: &str, port: u16) -> Result<TcpStream> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .with_context(|| format!("Connection timeout to {}:{}", host, port))?
            .with_context(|| format!("Failed to connect to {}:{}", host, port))?;

        if let Err(e) = self.socket_opts.apply(&stream) {
            tracing::warn!("Failed to apply socket options: {}", e);
        }

        tracing::debug!("TCP connection established to {}:{}", host, port);

        Ok(stream)
    }

    /// Connect to a `host:port` string
    pub async fn connect_addr(&self, addr: &str) -> Result<TcpStream> {
        let (host, port) = split_host_port(addr)?;
        self.connect(host, port).await
    }
}

/// Split `host:port`, accepting bracketed IPv6 literals
fn split_host_port(addr: &str) -> Result<(&str, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .with_context(|| format!("Missing port in address: {}", addr))?;
    let port = port
        .parse()
        .with_context(|| format!("Invalid port in address: {}", addr))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok((host, port))
}
