//! Connection pool configuration
//!
//! Defines configuration for the multiplexed session pool attached to
//! outlets that speak a stream multiplexer.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default maximum underlying sessions per outlet
fn default_max_sessions() -> usize {
    5
}

/// Default session dial timeout in seconds
fn default_dial_timeout() -> u64 {
    10
}

/// Default health check interval in seconds
fn default_health_check_interval() -> u64 {
    30
}

/// Default idle timeout in seconds
fn default_idle_timeout() -> u64 {
    300
}

/// Default time a busy session rests before it is tried again
fn default_busy_cooldown() -> u64 {
    5
}

/// Multiplexed session pool configuration
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum number of underlying sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Maximum time to establish a new underlying session
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout: u64,

    /// Health check interval in seconds
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: u64,

    /// Sessions without streams are closed after this many idle seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,

    /// Seconds a busy session is skipped before being tried again
    #[serde(default = "default_busy_cooldown")]
    pub busy_cooldown: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_sessions: default_max_sessions(),
            dial_timeout: default_dial_timeout(),
            health_check_interval: default_health_check_interval(),
            idle_timeout: default_idle_timeout(),
            busy_cooldown: default_busy_cooldown(),
        }
    }
}

impl PoolConfig {
    /// Validate the pool configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_sessions == 0 {
            return Err("max_sessions must be greater than 0".to_string());
        }
        if self.dial_timeout == 0 {
            return Err("dial_timeout must be greater than 0".to_string());
        }
        if self.health_check_interval == 0 {
            return Err("health_check_interval must be greater than 0".to_string());
        }
        Ok(())
    }

    /// Dial timeout as a duration
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout)
    }

    /// Health check interval as a duration
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval)
    }

    /// Idle timeout as a duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }

    /// Busy cooldown as a duration
    pub fn busy_cooldown(&self) -> Duration {
        Duration::from_secs(self.busy_cooldown)
    }
}
