//! HTTP CONNECT outlet

use super::{open_upstream, require_tcp, Network, ProxyClient};
use crate::error::OutletError;
use crate::pool::MuxPool;
use crate::transport::{BoxedStream, TcpDialer};
use async_http_proxy::{http_connect_tokio, http_connect_tokio_with_basic_auth};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Tunnels through an upstream HTTP proxy using `CONNECT`
pub struct HttpOutlet {
    name: String,
    dialer: TcpDialer,
    credentials: Option<(String, String)>,
    pool: Option<Arc<MuxPool>>,
}

impl HttpOutlet {
    /// Create an outlet that reaches the proxy through `dialer`
    pub fn new(name: impl Into<String>, dialer: TcpDialer) -> Self {
        HttpOutlet {
            name: name.into(),
            dialer,
            credentials: None,
            pool: None,
        }
    }

    /// Use basic authentication
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

#[async_trait]
impl ProxyClient for HttpOutlet {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "http"
    }

    async fn connect(
        &self,
        network: Network,
        host: &str,
        port: u16,
    ) -> Result<BoxedStream, OutletError> {
        require_tcp(&self.name, network)?;
        let mut stream = open_upstream(&self.name, self.pool.as_ref(), &self.dialer).await?;

        let result = match &self.credentials {
            Some((username, password)) => {
                http_connect_tokio_with_basic_auth(&mut stream, host, port, username, password)
                    .await
            }
            None => http_connect_tokio(&mut stream, host, port).await,
        };
        result.map_err(|e| OutletError::Handshake(format!("{}: {}", self.name, e)))?;

        debug!("[{}] CONNECT {}:{} established", self.name, host, port);
        Ok(stream)
    }

    fn pool(&self) -> Option<&Arc<MuxPool>> {
        self.pool.as_ref()
    }
}
