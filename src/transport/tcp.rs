//! TCP dialing
//!
//! Provides plain TCP connections for direct outlets and for the raw
//! connections underneath multiplexed sessions.

use super::{BoxedStream, Dialer, SocketOpts};
use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;

/// Connect to `host:port` within `timeout` and apply socket options
pub async fn connect_tcp(
    host: &str,
    port: u16,
    opts: &SocketOpts,
    timeout: Duration,
) -> io::Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("Connection timeout to {}:{}", host, port),
            )
        })??;

    if let Err(e) = opts.apply(&stream) {
        tracing::warn!("Failed to apply socket options: {}", e);
    }

    tracing::debug!("TCP connection established to {}:{}", host, port);

    Ok(stream)
}

/// Dialer that opens TCP connections to a fixed server
#[derive(Debug, Clone)]
pub struct TcpDialer {
    host: String,
    port: u16,
    /// Socket options to apply to connections
    socket_opts: SocketOpts,
    /// Connection timeout
    connect_timeout: Duration,
}

impl TcpDialer {
    /// Create a dialer for `host:port` with default options
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        TcpDialer {
            host: host.into(),
            port,
            socket_opts: SocketOpts::default(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Set socket options
    pub fn with_socket_opts(mut self, opts: SocketOpts) -> Self {
        self.socket_opts = opts;
        self
    }

    /// Set connection timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// `host:port` this dialer connects to
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Open a TCP connection to the server
    pub async fn connect(&self) -> io::Result<TcpStream> {
        connect_tcp(&self.host, self.port, &self.socket_opts, self.connect_timeout).await
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self) -> io::Result<BoxedStream> {
        let stream = self.connect().await?;
        Ok(Box::new(stream))
    }
}
