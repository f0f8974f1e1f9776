//! Proxy configuration types
//!
//! Defines the main configuration structures for the Sockmux endpoint.

use super::RemoteConfig;
use crate::helper::duration_from_secs;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    /// Local SOCKS5 listener
    #[serde(default)]
    pub listener: ListenerConfig,

    /// SOCKS5 handshake settings
    #[serde(default)]
    pub socks: SocksConfig,

    /// How CONNECT targets are reached
    #[serde(default)]
    pub resolver: ResolverConfig,

    /// Remote relay peer, used by the delegated resolver
    #[serde(default)]
    pub remote: RemoteConfig,
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        self.socks.validate()?;
        if self.resolver.resolver_type == ResolverType::Delegated {
            self.remote.validate()?;
        }
        Ok(())
    }
}

/// Default bind address
fn default_bind_addr() -> String {
    "127.0.0.1".to_string()
}

/// Default listening port
fn default_port() -> u16 {
    9091
}

/// Local listener configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ListenerConfig {
    /// Address to bind
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Port to bind, 0 picks an ephemeral port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        ListenerConfig {
            bind_addr: default_bind_addr(),
            port: default_port(),
        }
    }
}

impl ListenerConfig {
    /// `host:port` string to bind
    pub fn bind_target(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

/// Default handshake timeout in seconds
fn default_handshake_timeout() -> u64 {
    10
}

/// Default connect timeout in seconds
fn default_connect_timeout() -> u64 {
    10
}

/// SOCKS5 handshake configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SocksConfig {
    /// Time allowed from accept to a decoded CONNECT request, in seconds
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: u64,

    /// Time allowed for a direct dial, in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
}

impl Default for SocksConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: default_handshake_timeout(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl SocksConfig {
    /// Handshake timeout as a duration
    pub fn handshake_timeout(&self) -> Duration {
        duration_from_secs(self.handshake_timeout)
    }

    /// Connect timeout as a duration
    pub fn connect_timeout(&self) -> Duration {
        duration_from_secs(self.connect_timeout)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.handshake_timeout == 0 {
            return Err("handshake_timeout must be greater than zero".to_string());
        }
        if self.connect_timeout == 0 {
            return Err("connect_timeout must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Target resolver selection
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResolverType {
    /// Dial targets from this host
    #[default]
    #[serde(rename = "direct")]
    Direct,
    /// Hand targets to the remote relay peer as tasks
    #[serde(rename = "delegated")]
    Delegated,
}

/// Resolver configuration
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ResolverConfig {
    /// Resolver type
    #[serde(rename = "type", default)]
    pub resolver_type: ResolverType,
}
