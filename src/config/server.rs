//! Root and listener configuration
//!
//! Defines the top-level configuration structure for the Switchyard daemon.

use super::{PoolConfig, RouterConfig, TunnelConfig};
use crate::helper::DEFAULT_CONNECT_TIMEOUT_SECS;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

fn default_listen() -> String {
    "127.0.0.1".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_socks_port() -> u16 {
    1080
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

/// Root configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    /// Inbound listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Routing table
    #[serde(default)]
    pub router: RouterConfig,

    /// Pool settings shared by every multiplexing outlet
    #[serde(default)]
    pub pool: PoolConfig,

    /// Tunnel relay settings
    #[serde(default)]
    pub tunnel: TunnelConfig,

    /// Country code to CIDR list, used by `geoip` rules
    #[serde(default)]
    pub geoip: HashMap<String, Vec<String>>,
}

impl Config {
    /// Validate every section
    pub fn validate(&self) -> Result<(), String> {
        self.server.validate()?;
        self.pool.validate()?;
        self.tunnel.validate()?;
        Ok(())
    }
}

/// Inbound listener configuration
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address both listeners bind to
    #[serde(default = "default_listen")]
    pub listen: String,

    /// HTTP proxy port, 0 disables the listener
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// SOCKS5 proxy port, 0 disables the listener
    #[serde(default = "default_socks_port")]
    pub socks_port: u16,

    /// Deadline for an outlet connect, in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen: default_listen(),
            http_port: default_http_port(),
            socks_port: default_socks_port(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl ServerConfig {
    /// Validate the listener configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.listen.is_empty() {
            return Err("listen address must not be empty".to_string());
        }
        if self.http_port == 0 && self.socks_port == 0 {
            return Err("at least one of http_port or socks_port must be set".to_string());
        }
        if self.http_port != 0 && self.http_port == self.socks_port {
            return Err("http_port and socks_port must differ".to_string());
        }
        if self.connect_timeout == 0 {
            return Err("connect_timeout must be greater than 0".to_string());
        }
        Ok(())
    }

    /// `listen:http_port`, or `None` when disabled
    pub fn http_addr(&self) -> Option<String> {
        (self.http_port != 0).then(|| format!("{}:{}", self.listen, self.http_port))
    }

    /// `listen:socks_port`, or `None` when disabled
    pub fn socks_addr(&self) -> Option<String> {
        (self.socks_port != 0).then(|| format!("{}:{}", self.listen, self.socks_port))
    }

    /// Outlet connect deadline
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}
