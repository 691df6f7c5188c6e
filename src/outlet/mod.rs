//! Outlets
//!
//! An outlet is a named way of reaching a destination: dialing it directly
//! or going through an upstream HTTP or SOCKS5 proxy. Outlets configured
//! with a multiplexer get a [`MuxPool`] and open their upstream connection
//! as a logical stream on a pooled session.

mod direct;
mod http;
mod socks;

pub use direct::DirectOutlet;
pub use http::HttpOutlet;
pub use socks::Socks5Outlet;

use crate::config::{PoolConfig, ProxyScheme, ProxySpec};
use crate::error::OutletError;
use crate::pool::{create_pool, MuxPool};
use crate::transport::{BoxedStream, Dialer, SocketOpts, TcpDialer};
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Transport-level network of a connect request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    /// Stream connection
    Tcp,
    /// Datagram association
    Udp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
        }
    }
}

/// A named upstream that can carry a connection to `host:port`
#[async_trait]
pub trait ProxyClient: Send + Sync {
    /// Unique outlet name
    fn name(&self) -> &str;

    /// Protocol kind, e.g. `http`
    fn kind(&self) -> &str;

    /// Open a byte stream to `host:port` through this outlet
    async fn connect(&self, network: Network, host: &str, port: u16)
        -> Result<BoxedStream, OutletError>;

    /// Session pool, for outlets that multiplex their upstream
    fn pool(&self) -> Option<&Arc<MuxPool>> {
        None
    }
}

impl fmt::Debug for dyn ProxyClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind(), self.name())
    }
}

/// Open a raw connection to an outlet server
///
/// Goes through the pool when there is one; a pool failure falls back to a
/// fresh non-pooled dial.
pub(crate) async fn open_upstream(
    name: &str,
    pool: Option<&Arc<MuxPool>>,
    dialer: &TcpDialer,
) -> Result<BoxedStream, OutletError> {
    if let Some(pool) = pool {
        match pool.get_stream().await {
            Ok(stream) => return Ok(stream),
            Err(e) => warn!("[{}] pool unavailable, dialing directly: {}", name, e),
        }
    }
    Ok(dialer.dial().await?)
}

fn require_tcp(name: &str, network: Network) -> Result<(), OutletError> {
    match network {
        Network::Tcp => Ok(()),
        Network::Udp => Err(OutletError::Unsupported(format!(
            "{} does not relay udp",
            name
        ))),
    }
}

/// Build outlets from parsed proxy definitions
///
/// Outlets with a `mux` setting get a session pool built from `pool_config`.
pub fn build_outlets(
    specs: &[ProxySpec],
    pool_config: &PoolConfig,
) -> Result<Vec<Arc<dyn ProxyClient>>> {
    let mut seen = HashSet::new();
    let mut outlets: Vec<Arc<dyn ProxyClient>> = Vec::with_capacity(specs.len());

    for spec in specs {
        if !seen.insert(spec.name.clone()) {
            bail!("Duplicate outlet name: {}", spec.name);
        }

        let dialer = TcpDialer::new(spec.server.clone(), spec.port);
        let pool = match &spec.mux {
            Some(mux) if spec.scheme != ProxyScheme::Direct => {
                let session_dialer: Arc<dyn Dialer> = Arc::new(
                    dialer
                        .clone()
                        .with_socket_opts(SocketOpts::for_session())
                        .with_connect_timeout(pool_config.dial_timeout()),
                );
                match create_pool(&spec.name, mux, pool_config.clone(), session_dialer) {
                    Some(pool) => Some(pool),
                    None => bail!("Unknown multiplexer {} for outlet {}", mux, spec.name),
                }
            }
            _ => None,
        };

        let credentials = spec.username.clone().zip(spec.password.clone());
        let outlet: Arc<dyn ProxyClient> = match spec.scheme {
            ProxyScheme::Direct => Arc::new(DirectOutlet::new(spec.name.clone())),
            ProxyScheme::Http => {
                let mut outlet = HttpOutlet::new(spec.name.clone(), dialer);
                if let Some((username, password)) = credentials {
                    outlet = outlet.with_credentials(username, password);
                }
                if let Some(pool) = pool {
                    outlet = outlet.with_pool(pool);
                }
                Arc::new(outlet)
            }
            ProxyScheme::Socks5 => {
                let mut outlet = Socks5Outlet::new(spec.name.clone(), dialer);
                if let Some((username, password)) = credentials {
                    outlet = outlet.with_credentials(username, password);
                }
                if let Some(pool) = pool {
                    outlet = outlet.with_pool(pool);
                }
                Arc::new(outlet)
            }
        };

        info!(
            "Outlet {} ({}) via {}:{}{}",
            outlet.name(),
            outlet.kind(),
            spec.server,
            spec.port,
            if outlet.pool().is_some() { " [pooled]" } else { "" }
        );
        outlets.push(outlet);
    }

    Ok(outlets)
}
