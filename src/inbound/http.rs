//! HTTP proxy inbound
//!
//! Serves `CONNECT host:port` tunnels and plain absolute-form requests.
//! A plain request is rewritten to origin form and replayed to whatever
//! carries the connection, followed by any body bytes already read.

use anyhow::{anyhow, bail, Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::IpAddr;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::debug;
use url::Url;

/// Largest request head accepted
const MAX_HEADER_SIZE: usize = 16 * 1024;
const MAX_HEADERS: usize = 64;

const RESPONSE_200_CONNECT: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const RESPONSE_400: &[u8] = b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n";

/// Destination and replay bytes of one proxied request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpTarget {
    /// Request method
    pub method: String,
    /// Destination host
    pub host: String,
    /// Destination port
    pub port: u16,
    /// Bytes to send to the destination before relaying the client stream
    pub replay: Bytes,
}

impl HttpTarget {
    /// Whether this is a `CONNECT` tunnel
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Whether the destination is a loopback or private literal IP
    pub fn is_private(&self) -> bool {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => ip.is_loopback() || ip.is_private(),
            Ok(IpAddr::V6(ip)) => ip.is_loopback(),
            Err(_) => false,
        }
    }
}

/// Read one request head and answer `CONNECT` requests
///
/// Malformed requests are answered with `400 Bad Request`.
pub async fn handshake<S>(stream: &mut S) -> Result<HttpTarget>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let target = match read_request(stream).await {
        Ok(target) => target,
        Err(e) => {
            let _ = stream.write_all(RESPONSE_400).await;
            return Err(e);
        }
    };

    if target.is_connect() {
        stream.write_all(RESPONSE_200_CONNECT).await?;
        stream.flush().await?;
    }
    debug!("HTTP {} {}:{}", target.method, target.host, target.port);
    Ok(target)
}

/// Read and parse a request head from `stream`
pub async fn read_request<S>(stream: &mut S) -> Result<HttpTarget>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        if let Some(target) = parse_request(&mut buf)? {
            return Ok(target);
        }
        if buf.len() >= MAX_HEADER_SIZE {
            bail!("Request head exceeds {} bytes", MAX_HEADER_SIZE);
        }
        if stream.read_buf(&mut buf).await? == 0 {
            bail!("Connection closed before the request head was complete");
        }
    }
}

/// Parse a complete head from the front of `buf`
///
/// Returns `Ok(None)` while the head is incomplete. On success the head is
/// consumed from `buf` and any bytes after it end up in the replay.
fn parse_request(buf: &mut BytesMut) -> Result<Option<HttpTarget>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let head_len = match req.parse(&buf[..]) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => bail!("Invalid HTTP request: {}", e),
    };

    let method = req.method.unwrap_or_default().to_string();
    let path = req.path.unwrap_or_default();
    let version = req.version.unwrap_or(1);

    let target = if method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) =
            split_host_port(path, 443).ok_or_else(|| anyhow!("Invalid CONNECT authority: {}", path))?;
        let _ = buf.split_to(head_len);
        HttpTarget {
            method,
            host,
            port,
            replay: buf.split().freeze(),
        }
    } else {
        let host_header = req
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case("host"))
            .map(|h| String::from_utf8_lossy(h.value).into_owned());

        let (host, port, origin) = if path.starts_with('/') {
            let authority = host_header
                .as_deref()
                .ok_or_else(|| anyhow!("Request without Host header"))?;
            let (host, port) = split_host_port(authority, 80)
                .ok_or_else(|| anyhow!("Invalid Host header: {}", authority))?;
            (host, port, path.to_string())
        } else {
            let url = Url::parse(path).with_context(|| format!("Invalid request target: {}", path))?;
            let host = url
                .host_str()
                .ok_or_else(|| anyhow!("Request target without host: {}", path))?
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string();
            let port = url.port_or_known_default().unwrap_or(80);
            let mut origin = url.path().to_string();
            if let Some(query) = url.query() {
                origin.push('?');
                origin.push_str(query);
            }
            (host, port, origin)
        };

        let mut replay = BytesMut::with_capacity(head_len + buf.len());
        replay.put_slice(format!("{} {} HTTP/1.{}\r\n", method, origin, version).as_bytes());
        for header in req.headers.iter() {
            if header.name.to_ascii_lowercase().starts_with("proxy-") {
                continue;
            }
            replay.put_slice(header.name.as_bytes());
            replay.put_slice(b": ");
            replay.put_slice(header.value);
            replay.put_slice(b"\r\n");
        }
        if host_header.is_none() {
            replay.put_slice(format!("Host: {}\r\n", host).as_bytes());
        }
        replay.put_slice(b"\r\n");

        let _ = buf.split_to(head_len);
        replay.put(buf.split());

        HttpTarget {
            method,
            host,
            port,
            replay: replay.freeze(),
        }
    };

    Ok(Some(target))
}

/// Split `host[:port]`, accepting bracketed IPv6 literals
fn split_host_port(authority: &str, default_port: u16) -> Option<(String, u16)> {
    let authority = authority.trim();
    if authority.is_empty() {
        return None;
    }

    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(port) => port.parse().ok()?,
            None if tail.is_empty() => default_port,
            None => return None,
        };
        return Some((host.to_string(), port));
    }

    match authority.rsplit_once(':') {
        // a bare IPv6 literal has several colons and no port
        Some((host, _)) if host.contains(':') => Some((authority.to_string(), default_port)),
        Some((host, port)) => Some((host.to_string(), port.parse().ok()?)),
        None => Some((authority.to_string(), default_port)),
    }
}

/// Stream that yields `prefix` before reading from `inner`
pub struct PrefixedStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PrefixedStream<S> {
    /// Wrap `inner`
    pub fn new(prefix: Bytes, inner: S) -> Self {
        PrefixedStream { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
