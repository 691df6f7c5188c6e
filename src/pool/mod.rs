//! Connection pool module for Switchyard
//!
//! This module turns a few expensive upstream connections into many cheap
//! logical streams by pooling multiplexed sessions per outlet.

mod mux_pool;
mod session;
mod stats;

pub use mux_pool::MuxPool;
pub use session::{PoolSession, SessionState};
pub use stats::{PoolManager, PoolStats, PoolStatsSnapshot};

use crate::config::PoolConfig;
use crate::mux::get_multiplexer;
use crate::transport::Dialer;
use std::sync::Arc;

/// Create a pool for `name` using the multiplexer called `mux`
///
/// Returns `None` when the multiplexer is unknown.
pub fn create_pool(
    name: &str,
    mux: &str,
    config: PoolConfig,
    dialer: Arc<dyn Dialer>,
) -> Option<Arc<MuxPool>> {
    let multiplexer = get_multiplexer(mux)?;
    Some(Arc::new(MuxPool::new(name, config, dialer, multiplexer)))
}
