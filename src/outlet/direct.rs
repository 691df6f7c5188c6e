//! Direct outlet: dial the destination without a proxy

use super::{require_tcp, Network, ProxyClient};
use crate::error::OutletError;
use crate::helper::DIRECT;
use crate::transport::{connect_tcp, BoxedStream, SocketOpts};
use async_trait::async_trait;
use std::time::Duration;

/// Dials destinations itself
#[derive(Debug, Clone)]
pub struct DirectOutlet {
    name: String,
    socket_opts: SocketOpts,
    connect_timeout: Duration,
}

impl DirectOutlet {
    /// Create a direct outlet called `name`
    pub fn new(name: impl Into<String>) -> Self {
        DirectOutlet {
            name: name.into(),
            socket_opts: SocketOpts::default(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Set connection timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Default for DirectOutlet {
    fn default() -> Self {
        DirectOutlet::new(DIRECT)
    }
}

#[async_trait]
impl ProxyClient for DirectOutlet {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        DIRECT
    }

    async fn connect(
        &self,
        network: Network,
        host: &str,
        port: u16,
    ) -> Result<BoxedStream, OutletError> {
        require_tcp(&self.name, network)?;
        let stream = connect_tcp(host, port, &self.socket_opts, self.connect_timeout).await?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_direct_outlet_default() {
        let outlet = DirectOutlet::default();
        assert_eq!(outlet.name(), "direct");
        assert_eq!(outlet.kind(), "direct");
        assert!(outlet.pool().is_none());
    }

    #[tokio::test]
    async fn test_direct_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
        });

        let outlet = DirectOutlet::new("lan");
        let mut stream = outlet.connect(Network::Tcp, "127.0.0.1", port).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_direct_rejects_udp() {
        let outlet = DirectOutlet::default();
        let result = outlet.connect(Network::Udp, "127.0.0.1", 53).await;
        assert!(matches!(result, Err(OutletError::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_direct_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let outlet = DirectOutlet::default().with_connect_timeout(Duration::from_millis(500));
        let result = outlet.connect(Network::Tcp, "127.0.0.1", port).await;
        assert!(matches!(result, Err(OutletError::Dial(_))));
    }
}
