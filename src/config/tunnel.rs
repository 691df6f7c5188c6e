//! Tunnel configuration
//!
//! Relay buffer and traffic monitor settings shared by every tunnel.

use crate::helper::{DEFAULT_BUFFER_SIZE, DEFAULT_WINDOW_SIZE};
use serde::{Deserialize, Serialize};

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_window_size() -> usize {
    DEFAULT_WINDOW_SIZE
}

/// Tunnel relay configuration
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct TunnelConfig {
    /// Size of the copy buffer used by each direction
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Number of throughput samples kept per direction
    #[serde(default = "default_window_size")]
    pub window_size: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        TunnelConfig {
            buffer_size: default_buffer_size(),
            window_size: default_window_size(),
        }
    }
}

impl TunnelConfig {
    /// Validate the tunnel configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.buffer_size == 0 {
            return Err("buffer_size must be greater than 0".to_string());
        }
        if self.window_size < 2 {
            return Err("window_size must be at least 2".to_string());
        }
        Ok(())
    }
}
