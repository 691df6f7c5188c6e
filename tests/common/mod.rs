//! Test utilities and mocks for Switchyard
//!
//! This module provides common test utilities used across integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use switchyard::mux::{Multiplexer, MuxSession, OpenStreamError};
use switchyard::transport::{BoxedStream, Dialer};
use tokio::io::{duplex, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::net::{TcpListener, TcpStream};

/// Create a pair of connected duplex streams for testing
pub fn create_mock_stream_pair() -> (DuplexStream, DuplexStream) {
    duplex(8192)
}

/// Create a test TCP listener on an available port
pub async fn create_test_listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Create a connected TCP stream pair for testing
pub async fn create_tcp_stream_pair() -> (TcpStream, TcpStream) {
    let (listener, addr) = create_test_listener().await;

    let connect_fut = TcpStream::connect(addr);
    let accept_fut = listener.accept();

    let (client_stream, accepted) = tokio::join!(connect_fut, accept_fut);
    let (server_stream, _) = accepted.unwrap();

    (client_stream.unwrap(), server_stream)
}

/// Echo everything written until EOF, then close
async fn echo(mut conn: impl tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin) {
    let mut buf = [0u8; 1024];
    loop {
        match conn.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if conn.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = conn.shutdown().await;
}

/// Start a TCP echo server; returns its address
pub async fn spawn_echo_server() -> SocketAddr {
    let (listener, addr) = create_test_listener().await;
    tokio::spawn(async move {
        while let Ok((conn, _)) = listener.accept().await {
            tokio::spawn(echo(conn));
        }
    });
    addr
}

/// Start a CONNECT proxy that echoes the tunnelled bytes
///
/// Every request head it receives is pushed to the returned log.
pub async fn spawn_connect_proxy() -> (SocketAddr, Arc<Mutex<Vec<String>>>) {
    let (listener, addr) = create_test_listener().await;
    let heads = Arc::new(Mutex::new(Vec::new()));
    let log = heads.clone();

    tokio::spawn(async move {
        while let Ok((conn, _)) = listener.accept().await {
            let log = log.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(conn);
                let mut head = String::new();
                loop {
                    let mut line = String::new();
                    match reader.read_line(&mut line).await {
                        Ok(0) | Err(_) => return,
                        Ok(_) if line == "\r\n" => break,
                        Ok(_) => head.push_str(&line),
                    }
                }
                log.lock().push(head);

                let mut conn = reader.into_inner();
                if conn
                    .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                    .await
                    .is_err()
                {
                    return;
                }
                echo(conn).await;
            });
        }
    });

    (addr, heads)
}

/// Dialer handing out in-memory connections
#[derive(Default)]
pub struct MockDialer {
    /// Number of dials performed
    pub dials: AtomicUsize,
    /// Fail every dial when set
    pub refuse: AtomicBool,
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(&self) -> io::Result<BoxedStream> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        }
        self.dials.fetch_add(1, Ordering::SeqCst);
        // give concurrent callers a chance to race the slow path
        tokio::task::yield_now().await;
        let (a, _b) = duplex(64);
        Ok(Box::new(a))
    }
}

/// Multiplexed session whose failures are switched on by the test
#[derive(Default)]
pub struct MockSession {
    /// Closed flag
    pub closed: AtomicBool,
    /// Fail opens fatally
    pub broken: AtomicBool,
    /// Streams opened successfully
    pub opened: AtomicUsize,
}

#[async_trait]
impl MuxSession for MockSession {
    async fn open_stream(&self) -> Result<BoxedStream, OpenStreamError> {
        if self.broken.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst) {
            return Err(OpenStreamError::Fatal(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "session broken",
            )));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        let (a, _b) = duplex(64);
        Ok(Box::new(a))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn num_streams(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Multiplexer that records every session it creates
#[derive(Default)]
pub struct MockMultiplexer {
    /// Sessions in creation order
    pub sessions: Mutex<Vec<Arc<MockSession>>>,
}

impl Multiplexer for MockMultiplexer {
    fn name(&self) -> &str {
        "mock"
    }

    fn client(&self, _conn: BoxedStream) -> Arc<dyn MuxSession> {
        let session = Arc::new(MockSession::default());
        self.sessions.lock().push(session.clone());
        session
    }
}

/// Test configuration builder
pub struct TestConfigBuilder {
    http_port: u16,
    socks_port: u16,
    proxies: Vec<String>,
    rules: Vec<String>,
    mappings: Vec<String>,
    default: Option<String>,
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        TestConfigBuilder {
            http_port: 0,
            socks_port: 1080,
            proxies: Vec::new(),
            rules: Vec::new(),
            mappings: Vec::new(),
            default: None,
        }
    }
}

fn toml_list(items: &[String]) -> String {
    let quoted: Vec<String> = items.iter().map(|i| format!("{:?}", i)).collect();
    format!("[{}]", quoted.join(", "))
}

impl TestConfigBuilder {
    /// Create a new test config builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set listener ports
    pub fn ports(mut self, http: u16, socks: u16) -> Self {
        self.http_port = http;
        self.socks_port = socks;
        self
    }

    /// Add a proxy URL
    pub fn proxy(mut self, url: &str) -> Self {
        self.proxies.push(url.to_string());
        self
    }

    /// Add a `kind,key,target` rule
    pub fn rule(mut self, rule: &str) -> Self {
        self.rules.push(rule.to_string());
        self
    }

    /// Add a `canonical:[alias,...]` mapping
    pub fn mapping(mut self, mapping: &str) -> Self {
        self.mappings.push(mapping.to_string());
        self
    }

    /// Set the default outlet
    pub fn default_outlet(mut self, name: &str) -> Self {
        self.default = Some(name.to_string());
        self
    }

    /// Render as TOML
    pub fn to_toml(&self) -> String {
        let mut out = format!(
            "[server]\nhttp_port = {}\nsocks_port = {}\nconnect_timeout = 5\n\n[router]\nproxies = {}\nrules = {}\nmappings = {}\n",
            self.http_port,
            self.socks_port,
            toml_list(&self.proxies),
            toml_list(&self.rules),
            toml_list(&self.mappings),
        );
        if let Some(default) = &self.default {
            out.push_str(&format!("default = {:?}\n", default));
        }
        out
    }

    /// Build the configuration
    pub fn build(self) -> switchyard::config::Config {
        switchyard::config::parse_config(&self.to_toml()).unwrap()
    }
}

/// Mock SOCKS5 handshake data
pub mod socks5_mock {
    use switchyard::inbound::socks::*;

    /// Create a no-auth method selection request
    pub fn create_auth_request_no_auth() -> Vec<u8> {
        vec![SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_NONE]
    }

    /// Create a connect command to IPv4 address
    pub fn create_connect_ipv4(ip: [u8; 4], port: u16) -> Vec<u8> {
        let mut cmd = vec![SOCKS5_VERSION, SOCKS5_CMD_TCP_CONNECT, 0x00, SOCKS5_ADDR_TYPE_IPV4];
        cmd.extend_from_slice(&ip);
        cmd.extend_from_slice(&port.to_be_bytes());
        cmd
    }

    /// Create a connect command to domain
    pub fn create_connect_domain(domain: &str, port: u16) -> Vec<u8> {
        let mut cmd = vec![
            SOCKS5_VERSION,
            SOCKS5_CMD_TCP_CONNECT,
            0x00,
            SOCKS5_ADDR_TYPE_DOMAIN,
            domain.len() as u8,
        ];
        cmd.extend_from_slice(domain.as_bytes());
        cmd.extend_from_slice(&port.to_be_bytes());
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_mock_stream_pair() {
        let (mut a, mut b) = create_mock_stream_pair();

        a.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_echo_server() {
        let addr = spawn_echo_server().await;
        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn test_config_builder() {
        let config = TestConfigBuilder::new()
            .proxy("http://127.0.0.1:3128?name=hk")
            .rule("domain,example.com,hk")
            .mapping("hk:[fast]")
            .default_outlet("hk")
            .build();

        assert_eq!(config.server.socks_port, 1080);
        assert_eq!(config.router.proxies.len(), 1);
        assert_eq!(config.router.default.as_deref(), Some("hk"));
    }

    #[test]
    fn test_socks5_mock_connect_ipv4() {
        let cmd = socks5_mock::create_connect_ipv4([192, 168, 1, 1], 8080);
        assert_eq!(cmd[0], 5); // SOCKS5 version
        assert_eq!(cmd[1], 1); // CONNECT
        assert_eq!(cmd[3], 1); // IPv4
        assert_eq!(&cmd[4..8], &[192, 168, 1, 1]);
    }
}
