//! Stream multiplexing
//!
//! A [`Multiplexer`] turns one raw connection into a [`MuxSession`] that can
//! host many logical streams. Open failures are split into fatal ones (the
//! session is unusable) and transient ones (the session may recover).

mod yamux;

pub use self::yamux::YamuxMultiplexer;

use crate::transport::BoxedStream;
use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Failure to open a logical stream
#[derive(Error, Debug)]
pub enum OpenStreamError {
    /// The session is unusable and should be discarded
    #[error("session failed: {0}")]
    Fatal(io::Error),

    /// The session refused this stream but may accept later ones
    #[error("session busy: {0}")]
    Transient(io::Error),
}

impl OpenStreamError {
    /// Whether the session should be discarded
    pub fn is_fatal(&self) -> bool {
        matches!(self, OpenStreamError::Fatal(_))
    }

    /// Consume into the underlying IO error
    pub fn into_io(self) -> io::Error {
        match self {
            OpenStreamError::Fatal(e) | OpenStreamError::Transient(e) => e,
        }
    }
}

/// One underlying connection hosting many logical streams
#[async_trait]
pub trait MuxSession: Send + Sync {
    /// Open a new logical stream
    async fn open_stream(&self) -> Result<BoxedStream, OpenStreamError>;

    /// Whether the underlying connection has gone away
    fn is_closed(&self) -> bool;

    /// Number of currently open logical streams
    fn num_streams(&self) -> usize;

    /// Close the session and every stream on it
    fn close(&self);
}

/// Wraps raw connections into client-side multiplexed sessions
pub trait Multiplexer: Send + Sync {
    /// Protocol name, e.g. `yamux`
    fn name(&self) -> &str;

    /// Start a client session over `conn`
    fn client(&self, conn: BoxedStream) -> Arc<dyn MuxSession>;
}

/// Look up a multiplexer by protocol name
pub fn get_multiplexer(name: &str) -> Option<Arc<dyn Multiplexer>> {
    match name.to_lowercase().as_str() {
        "yamux" => Some(Arc::new(YamuxMultiplexer::default())),
        _ => None,
    }
}

/// Stream wrapper that keeps a session's open-stream count accurate
pub struct CountedStream<S> {
    inner: S,
    counter: Arc<AtomicUsize>,
}

impl<S> CountedStream<S> {
    /// Wrap `inner`, incrementing `counter` until the wrapper is dropped
    pub fn new(inner: S, counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        CountedStream { inner, counter }
    }
}

impl<S> Drop for CountedStream<S> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CountedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CountedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_stream_error_kind() {
        let err = OpenStreamError::Fatal(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(err.is_fatal());
        assert_eq!(err.into_io().kind(), io::ErrorKind::BrokenPipe);

        let err = OpenStreamError::Transient(io::Error::new(io::ErrorKind::WouldBlock, "full"));
        assert!(!err.is_fatal());
        assert!(format!("{}", err).contains("busy"));
    }

    #[test]
    fn test_get_multiplexer() {
        assert_eq!(get_multiplexer("yamux").unwrap().name(), "yamux");
        assert_eq!(get_multiplexer("YAMUX").unwrap().name(), "yamux");
        assert!(get_multiplexer("smux").is_none());
    }

    #[test]
    fn test_counted_stream_tracks_lifetime() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (a, b) = tokio::io::duplex(16);

        let first = CountedStream::new(a, counter.clone());
        let second = CountedStream::new(b, counter.clone());
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        drop(first);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        drop(second);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
