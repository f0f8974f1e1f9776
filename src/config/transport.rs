//! Remote relay configuration types
//!
//! Defines how the shared transport to the remote relay peer is reached.

use crate::helper::duration_from_secs;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default remote address
fn default_remote_addr() -> String {
    "127.0.0.1:9092".to_string()
}

/// Default username
fn default_username() -> String {
    "admin".to_string()
}

/// Default password
fn default_password() -> String {
    "adminpw".to_string()
}

/// Default acknowledgment timeout in seconds
fn default_ack_timeout() -> u64 {
    10
}

/// Default reconnect attempts
fn default_max_retries() -> u32 {
    10
}

/// Default per-task channel capacity
fn default_channel_capacity() -> usize {
    64
}

/// Remote relay peer configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RemoteConfig {
    /// Remote relay address (e.g., "relay.example.com:9092")
    #[serde(default = "default_remote_addr")]
    pub addr: String,

    /// Session username
    #[serde(default = "default_username")]
    pub username: String,

    /// Session password
    #[serde(default = "default_password")]
    pub password: String,

    /// Seconds to wait for the remote to acknowledge a request
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout: u64,

    /// Reconnect attempts before giving up, 0 retries forever
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Frames buffered per task and on the outbound queue
    ///
    /// A task whose client falls this many frames behind is closed.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// TCP options for the shared connection
    #[serde(default)]
    pub tcp: TcpConfig,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        RemoteConfig {
            addr: default_remote_addr(),
            username: default_username(),
            password: default_password(),
            ack_timeout: default_ack_timeout(),
            max_retries: default_max_retries(),
            channel_capacity: default_channel_capacity(),
            tcp: TcpConfig::default(),
        }
    }
}

impl RemoteConfig {
    /// Acknowledgment timeout as a duration
    pub fn ack_timeout(&self) -> Duration {
        duration_from_secs(self.ack_timeout)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.addr.is_empty() {
            return Err("remote addr must not be empty".to_string());
        }
        if self.username.is_empty() {
            return Err("remote username must not be empty".to_string());
        }
        if self.username.len() > u8::MAX as usize || self.password.len() > u8::MAX as usize {
            return Err("remote credentials must be at most 255 bytes".to_string());
        }
        if self.channel_capacity == 0 {
            return Err("channel_capacity must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Default keepalive seconds
fn default_keepalive_secs() -> u64 {
    20
}

/// Default keepalive interval
fn default_keepalive_interval() -> u64 {
    8
}

/// Default nodelay
fn default_nodelay() -> bool {
    true
}

/// TCP socket configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TcpConfig {
    /// Enable TCP_NODELAY
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,

    /// TCP keepalive timeout in seconds
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    /// TCP keepalive interval in seconds
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            nodelay: default_nodelay(),
            keepalive_secs: default_keepalive_secs(),
            keepalive_interval: default_keepalive_interval(),
        }
    }
}
