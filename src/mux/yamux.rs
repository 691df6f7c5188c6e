//! yamux client sessions
//!
//! The yamux connection is owned by a driver task. Stream-open requests are
//! sent to the driver over a channel and answered through oneshots, so the
//! session handle itself is cheap to share.

use super::{CountedStream, MuxSession, Multiplexer, OpenStreamError};
use crate::transport::BoxedStream;
use ::yamux::{Config, Connection, ConnectionError, Mode};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::future::poll_fn;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::Poll;
use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::{FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tracing::{debug, trace};

type OpenReply = oneshot::Sender<Result<::yamux::Stream, OpenStreamError>>;

enum Command {
    Open(OpenReply),
    Close,
}

/// yamux multiplexer
#[derive(Debug, Clone)]
pub struct YamuxMultiplexer {
    max_streams: usize,
}

impl Default for YamuxMultiplexer {
    fn default() -> Self {
        YamuxMultiplexer { max_streams: 256 }
    }
}

impl YamuxMultiplexer {
    /// Limit the number of concurrent streams per session
    pub fn with_max_streams(mut self, max_streams: usize) -> Self {
        self.max_streams = max_streams;
        self
    }
}

impl Multiplexer for YamuxMultiplexer {
    fn name(&self) -> &str {
        "yamux"
    }

    fn client(&self, conn: BoxedStream) -> Arc<dyn MuxSession> {
        let mut config = Config::default();
        config.set_max_num_streams(self.max_streams);

        let connection = Connection::new(conn.compat(), config, Mode::Client);
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(drive(connection, rx, closed.clone()));

        Arc::new(YamuxSession {
            commands: tx,
            closed,
            streams: Arc::new(AtomicUsize::new(0)),
        })
    }
}

/// Handle to a yamux session running on a driver task
pub struct YamuxSession {
    commands: mpsc::UnboundedSender<Command>,
    closed: Arc<AtomicBool>,
    streams: Arc<AtomicUsize>,
}

fn session_closed() -> OpenStreamError {
    OpenStreamError::Fatal(io::Error::new(
        io::ErrorKind::NotConnected,
        "yamux session closed",
    ))
}

#[async_trait]
impl MuxSession for YamuxSession {
    async fn open_stream(&self) -> Result<BoxedStream, OpenStreamError> {
        if self.is_closed() {
            return Err(session_closed());
        }

        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Open(tx))
            .map_err(|_| session_closed())?;
        let stream = rx.await.map_err(|_| session_closed())??;

        Ok(Box::new(CountedStream::new(
            stream.compat(),
            self.streams.clone(),
        )))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn num_streams(&self) -> usize {
        self.streams.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.commands.send(Command::Close);
    }
}

fn classify(err: ConnectionError) -> OpenStreamError {
    match err {
        ConnectionError::TooManyStreams => OpenStreamError::Transient(io::Error::new(
            io::ErrorKind::WouldBlock,
            "too many yamux streams",
        )),
        ConnectionError::Io(e) => OpenStreamError::Fatal(e),
        other => OpenStreamError::Fatal(io::Error::new(io::ErrorKind::Other, other.to_string())),
    }
}

async fn drive<T>(
    mut connection: Connection<T>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    closed: Arc<AtomicBool>,
) where
    T: futures::AsyncRead + futures::AsyncWrite + Unpin + Send + 'static,
{
    let mut pending: VecDeque<OpenReply> = VecDeque::new();
    let mut closing = false;

    let result: Result<(), ConnectionError> = poll_fn(|cx| {
        while !closing {
            match commands.poll_recv(cx) {
                Poll::Ready(Some(Command::Open(reply))) => pending.push_back(reply),
                Poll::Ready(Some(Command::Close)) | Poll::Ready(None) => closing = true,
                Poll::Pending => break,
            }
        }

        if closing {
            return connection.poll_close(cx);
        }

        while !pending.is_empty() {
            match connection.poll_new_outbound(cx) {
                Poll::Ready(Ok(stream)) => {
                    if let Some(reply) = pending.pop_front() {
                        let _ = reply.send(Ok(stream));
                    }
                }
                Poll::Ready(Err(ConnectionError::TooManyStreams)) => {
                    if let Some(reply) = pending.pop_front() {
                        let _ = reply.send(Err(classify(ConnectionError::TooManyStreams)));
                    }
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => break,
            }
        }

        // the remote side has no business opening streams on a client session
        loop {
            match connection.poll_next_inbound(cx) {
                Poll::Ready(Some(Ok(stream))) => drop(stream),
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e)),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    })
    .await;

    closed.store(true, Ordering::SeqCst);
    match result {
        Ok(()) => debug!("yamux session closed"),
        Err(e) => {
            debug!("yamux session terminated: {}", e);
            for reply in pending.drain(..) {
                let _ = reply.send(Err(OpenStreamError::Fatal(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    e.to_string(),
                ))));
            }
        }
    }

    // anything queued after shutdown gets a closed error when the reply drops
    commands.close();
    while let Ok(command) = commands.try_recv() {
        if let Command::Open(reply) = command {
            trace!("rejecting stream request on closed session");
            drop(reply);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Accept yamux streams on `conn` and echo everything back
    fn spawn_echo_server(conn: tokio::io::DuplexStream) {
        tokio::spawn(async move {
            let mut connection = Connection::new(conn.compat(), Config::default(), Mode::Server);
            while let Some(Ok(stream)) = poll_fn(|cx| connection.poll_next_inbound(cx)).await {
                tokio::spawn(async move {
                    let mut stream = stream.compat();
                    let mut buf = [0u8; 1024];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
    }

    #[tokio::test]
    async fn test_open_stream_and_echo() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        spawn_echo_server(server);

        let session = YamuxMultiplexer::default().client(Box::new(client));
        assert!(!session.is_closed());
        assert_eq!(session.num_streams(), 0);

        let mut stream = session.open_stream().await.unwrap();
        assert_eq!(session.num_streams(), 1);

        stream.write_all(b"hello yamux").await.unwrap();
        let mut buf = [0u8; 11];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello yamux");

        drop(stream);
        assert_eq!(session.num_streams(), 0);
    }

    #[tokio::test]
    async fn test_many_streams_one_session() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        spawn_echo_server(server);

        let session = YamuxMultiplexer::default().client(Box::new(client));
        let mut streams = Vec::new();
        for _ in 0..4 {
            streams.push(session.open_stream().await.unwrap());
        }
        assert_eq!(session.num_streams(), 4);

        for (i, stream) in streams.iter_mut().enumerate() {
            let msg = format!("stream-{}", i);
            stream.write_all(msg.as_bytes()).await.unwrap();
            let mut buf = vec![0u8; msg.len()];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, msg.as_bytes());
        }
    }

    #[tokio::test]
    async fn test_close_session() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        spawn_echo_server(server);

        let session = YamuxMultiplexer::default().client(Box::new(client));
        session.close();
        assert!(session.is_closed());

        let err = session.open_stream().await.err().unwrap();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_remote_gone_marks_closed() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        drop(server);

        let session = YamuxMultiplexer::default().client(Box::new(client));
        // opening a stream on a dead transport must fail fatally
        let result = session.open_stream().await;
        if let Err(err) = result {
            assert!(err.is_fatal());
        }

        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while !session.is_closed() {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}
