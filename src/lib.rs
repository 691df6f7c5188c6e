//! # Switchyard - Rule-Routed Local Proxy Daemon
//!
//! Switchyard accepts HTTP and SOCKS5 connections locally, decides per
//! destination which upstream outlet should carry the traffic, and relays
//! bytes through it while accounting for volume and speed.
//!
//! ## Features
//!
//! - **Domain-Suffix Routing**: rules keyed by domain labels, exact overrides,
//!   aliases and a default outlet, swapped atomically on reload
//! - **Multiplexed Outlets**: HTTP CONNECT and SOCKS5 upstreams, optionally
//!   pooled over yamux sessions
//! - **Traffic Accounting**: every relayed connection reports bytes, speeds
//!   and duration when it finishes
//! - **Live Reload**: SIGHUP rebuilds outlets and the routing table without
//!   dropping the listeners
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use switchyard::config::load_config;
//! use switchyard::daemon::Daemon;
//! use tokio::sync::broadcast;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config("config.toml")?;
//!     let daemon = Arc::new(Daemon::new(config)?);
//!     let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
//!
//!     daemon.run(shutdown_rx).await
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Client -> Inbound (HTTP/SOCKS5) -> Router -> Outlet [-> Pool] -> Tunnel -> Target
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod daemon;
pub mod error;
pub mod helper;
pub mod inbound;
pub mod mux;
pub mod outlet;
pub mod pool;
pub mod router;
pub mod transport;
pub mod tunnel;

// Re-export commonly used items
pub use config::{load_config, Config};
pub use daemon::Daemon;
pub use error::{PoolError, RouterError, SwitchyardError, TunnelError};
pub use router::{RouteDecision, RouteKind, RouteRule, Router};
pub use tunnel::{Tunnel, TunnelStatus};

/// Version of the Switchyard library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");
