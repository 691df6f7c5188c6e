//! Pool statistics and maintenance control
//!
//! Counters are plain atomics so the data path never takes a lock to
//! record them.

use crate::config::PoolConfig;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Statistics for a session pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total `get_stream` calls
    pub total_requests: AtomicUsize,
    /// Calls that returned a stream
    pub successful_requests: AtomicUsize,
    /// Calls that returned an error
    pub failed_requests: AtomicUsize,
    /// Underlying sessions created
    pub sessions_created: AtomicUsize,
    /// Sessions reaped
    pub sessions_cleaned: AtomicUsize,
}

impl PoolStats {
    /// Create new pool stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a `get_stream` call
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful `get_stream`
    pub fn record_success(&self) {
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed `get_stream`
    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a session creation
    pub fn record_session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record reaped sessions
    pub fn record_sessions_cleaned(&self, count: usize) {
        self.sessions_cleaned.fetch_add(count, Ordering::Relaxed);
    }

    /// Get current stats snapshot
    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_cleaned: self.sessions_cleaned.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStatsSnapshot {
    pub total_requests: usize,
    pub successful_requests: usize,
    pub failed_requests: usize,
    pub sessions_created: usize,
    pub sessions_cleaned: usize,
}

/// Owns the stats and the shutdown signal of the maintenance task
pub struct PoolManager {
    /// Configuration
    config: PoolConfig,
    /// Statistics
    stats: Arc<PoolStats>,
    /// Shutdown signal
    shutdown: Arc<Notify>,
    /// Whether shutdown has been requested
    is_shutdown: Arc<AtomicBool>,
}

impl PoolManager {
    /// Create a new pool manager
    pub fn new(config: PoolConfig) -> Self {
        PoolManager {
            config,
            stats: Arc::new(PoolStats::new()),
            shutdown: Arc::new(Notify::new()),
            is_shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get pool statistics
    pub fn stats(&self) -> &Arc<PoolStats> {
        &self.stats
    }

    /// Signal shutdown
    pub fn shutdown(&self) {
        self.is_shutdown.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    /// Check if shutdown has been requested
    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::SeqCst)
    }

    /// Get the health check interval
    pub fn health_check_interval(&self) -> Duration {
        self.config.health_check_interval()
    }

    /// Wait for shutdown signal
    pub async fn wait_shutdown(&self) {
        let notified = self.shutdown.notified();
        if self.is_shutdown() {
            return;
        }
        notified.await;
    }
}
