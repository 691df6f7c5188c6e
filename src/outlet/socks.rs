//! SOCKS5 outlet

use super::{open_upstream, require_tcp, Network, ProxyClient};
use crate::error::OutletError;
use crate::pool::MuxPool;
use crate::transport::{BoxedStream, TcpDialer};
use async_socks5::{AddrKind, Auth};
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::debug;

/// Tunnels through an upstream SOCKS5 proxy
pub struct Socks5Outlet {
    name: String,
    dialer: TcpDialer,
    credentials: Option<(String, String)>,
    pool: Option<Arc<MuxPool>>,
}

impl Socks5Outlet {
    /// Create an outlet that reaches the proxy through `dialer`
    pub fn new(name: impl Into<String>, dialer: TcpDialer) -> Self {
        Socks5Outlet {
            name: name.into(),
            dialer,
            credentials: None,
            pool: None,
        }
    }

    /// Use username/password authentication
    pub fn with_credentials(mut self, username: String, password: String) -> Self {
        self.credentials = Some((username, password));
        self
    }

    /// Open upstream connections as pooled streams
    pub fn with_pool(mut self, pool: Arc<MuxPool>) -> Self {
        self.pool = Some(pool);
        self
    }
}

fn target_addr(host: &str, port: u16) -> AddrKind {
    match host.parse::<IpAddr>() {
        Ok(ip) => AddrKind::Ip(SocketAddr::new(ip, port)),
        Err(_) => AddrKind::Domain(host.to_string(), port),
    }
}

#[async_trait]
impl ProxyClient for Socks5Outlet {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "socks5"
    }

    async fn connect(
        &self,
        network: Network,
        host: &str,
        port: u16,
    ) -> Result<BoxedStream, OutletError> {
        require_tcp(&self.name, network)?;
        let mut stream = open_upstream(&self.name, self.pool.as_ref(), &self.dialer).await?;

        let auth = self
            .credentials
            .as_ref()
            .map(|(username, password)| Auth::new(username.as_str(), password.as_str()));
        async_socks5::connect(&mut stream, target_addr(host, port), auth)
            .await
            .map_err(|e| OutletError::Handshake(format!("{}: {}", self.name, e)))?;

        debug!("[{}] SOCKS5 CONNECT {}:{} established", self.name, host, port);
        Ok(stream)
    }

    fn pool(&self) -> Option<&Arc<MuxPool>> {
        self.pool.as_ref()
    }
}
