//! Session pool behaviour under contention and failure

mod common;

use common::{MockDialer, MockMultiplexer, TestConfigBuilder};
use futures::future::join_all;
use std::future::poll_fn;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use switchyard::config::PoolConfig;
use switchyard::error::PoolError;
use switchyard::outlet::Network;
use switchyard::pool::MuxPool;
use switchyard::Daemon;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_util::compat::{FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};

fn pool(max_sessions: usize, dialer: Arc<MockDialer>, mux: Arc<MockMultiplexer>) -> Arc<MuxPool> {
    let config = PoolConfig {
        max_sessions,
        busy_cooldown: 0,
        ..Default::default()
    };
    Arc::new(MuxPool::new("test", config, dialer, mux))
}

#[tokio::test]
async fn test_concurrent_first_calls_never_exceed_max_sessions() {
    for max in 1..=4 {
        let dialer = Arc::new(MockDialer::default());
        let mux = Arc::new(MockMultiplexer::default());
        let pool = pool(max, dialer.clone(), mux.clone());

        let calls = (0..max).map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get_stream().await })
        });
        for result in join_all(calls).await {
            match result.unwrap() {
                Ok(_) | Err(PoolError::Exhausted { .. }) | Err(PoolError::StreamOpen(_)) => {}
                Err(e) => panic!("unexpected pool error: {}", e),
            }
        }

        assert!(dialer.dials.load(Ordering::SeqCst) <= max);
        assert!(mux.sessions.lock().len() <= max);
        assert!(pool.session_count() <= max);
    }
}

#[tokio::test]
async fn test_heavy_contention_stays_bounded() {
    let dialer = Arc::new(MockDialer::default());
    let mux = Arc::new(MockMultiplexer::default());
    let pool = pool(3, dialer.clone(), mux.clone());

    let calls = (0..64).map(|_| {
        let pool = pool.clone();
        tokio::spawn(async move { pool.get_stream().await.is_ok() })
    });
    let succeeded = join_all(calls)
        .await
        .into_iter()
        .filter(|r| *r.as_ref().unwrap())
        .count();

    assert!(succeeded > 0);
    assert!(mux.sessions.lock().len() <= 3);
    let stats = pool.stats();
    assert_eq!(stats.total_requests, 64);
    assert_eq!(stats.successful_requests + stats.failed_requests, 64);
}

#[tokio::test]
async fn test_all_dead_sessions_are_replaced() {
    let dialer = Arc::new(MockDialer::default());
    let mux = Arc::new(MockMultiplexer::default());
    let pool = pool(1, dialer.clone(), mux.clone());

    pool.get_stream().await.unwrap();
    let first = mux.sessions.lock()[0].clone();
    first.broken.store(true, Ordering::SeqCst);

    pool.get_stream().await.unwrap();

    // the dead session handed out nothing more and was closed
    assert_eq!(first.opened.load(Ordering::SeqCst), 1);
    assert!(first.closed.load(Ordering::SeqCst));
    let sessions = mux.sessions.lock();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[1].opened.load(Ordering::SeqCst), 1);
    assert_eq!(pool.health_check(), (1, 1));
}

#[tokio::test]
async fn test_all_dead_and_dial_failing_returns_error() {
    let dialer = Arc::new(MockDialer::default());
    let mux = Arc::new(MockMultiplexer::default());
    let pool = pool(1, dialer.clone(), mux.clone());

    pool.get_stream().await.unwrap();
    mux.sessions.lock()[0].broken.store(true, Ordering::SeqCst);
    dialer.refuse.store(true, Ordering::SeqCst);

    let err = pool.get_stream().await.err().unwrap();
    assert!(matches!(err, PoolError::DialFailed(_)));
    assert_eq!(mux.sessions.lock()[0].opened.load(Ordering::SeqCst), 1);
    assert_eq!(pool.session_count(), 0);
}

/// yamux server whose streams behave like a CONNECT proxy that echoes
async fn spawn_yamux_connect_proxy() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        while let Ok((conn, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut connection = yamux::Connection::new(
                    TokioAsyncReadCompatExt::compat(conn),
                    yamux::Config::default(),
                    yamux::Mode::Server,
                );
                while let Some(Ok(stream)) = poll_fn(|cx| connection.poll_next_inbound(cx)).await {
                    tokio::spawn(async move {
                        let mut reader = BufReader::new(FuturesAsyncReadCompatExt::compat(stream));
                        loop {
                            let mut line = String::new();
                            match reader.read_line(&mut line).await {
                                Ok(0) | Err(_) => return,
                                Ok(_) if line == "\r\n" => break,
                                Ok(_) => {}
                            }
                        }
                        let mut stream = reader.into_inner();
                        if stream
                            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                            .await
                            .is_err()
                        {
                            return;
                        }
                        let mut buf = [0u8; 256];
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
    });

    port
}

#[tokio::test]
async fn test_pooled_outlet_shares_one_session() {
    let port = spawn_yamux_connect_proxy().await;
    let daemon = Daemon::new(
        TestConfigBuilder::new()
            .proxy(&format!("http://127.0.0.1:{}?name=hk&mux=yamux", port))
            .build(),
    )
    .unwrap();
    let outlet = daemon.outlets()[0].clone();
    let pool = outlet.pool().unwrap().clone();

    let mut streams = Vec::new();
    for i in 0..3 {
        let mut stream = outlet
            .connect(Network::Tcp, "example.com", 443)
            .await
            .unwrap();
        let msg = format!("stream-{}", i);
        stream.write_all(msg.as_bytes()).await.unwrap();
        let mut buf = vec![0u8; msg.len()];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, msg.as_bytes());
        streams.push(stream);
    }

    assert_eq!(pool.session_count(), 1);
    let stats = pool.stats();
    assert_eq!(stats.sessions_created, 1);
    assert_eq!(stats.successful_requests, 3);

    pool.close();
    assert!(pool.is_closed());
}
