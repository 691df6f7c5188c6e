//! Tunnel module for Switchyard
//!
//! A [`Tunnel`] relays bytes between the client-facing connection and the
//! outlet-facing connection until both directions finish, measuring
//! throughput in each direction.
//!
//! End-of-stream on one side shuts down only the write half of the other
//! side, so the opposite direction can keep draining. Both connections are
//! fully closed once both directions are done.

mod monitor;

pub use monitor::{Monitored, TrafficMonitor};

use crate::config::TunnelConfig;
use crate::error::TunnelError;
use crate::helper::generate_unique_id;
use crate::transport::BoxedStream;
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, trace};

/// Tunnel lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TunnelState {
    /// Built but not started
    Created = 0,
    /// Relaying
    Active = 1,
    /// Finished or closed
    Closed = 2,
}

impl TunnelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TunnelState::Created,
            1 => TunnelState::Active,
            _ => TunnelState::Closed,
        }
    }
}

/// Traffic summary of a tunnel
///
/// Counters are only final once `start` has returned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TunnelStatus {
    /// Tunnel id
    pub id: String,
    /// Outlet carrying the traffic
    pub outlet: String,
    /// Bytes read from the client side
    pub up_bytes: u64,
    /// Bytes read from the outlet side
    pub down_bytes: u64,
    /// Average upload speed in bytes per second
    pub up_speed: f64,
    /// Average download speed in bytes per second
    pub down_speed: f64,
    /// Time between start and end
    pub total_duration: Duration,
    /// When `start` began relaying
    pub start_time: Option<SystemTime>,
    /// When relaying finished
    pub end_time: Option<SystemTime>,
}

/// Bidirectional relay between a client and an outlet connection
pub struct Tunnel {
    id: String,
    config: TunnelConfig,
    state: AtomicU8,
    streams: Mutex<Option<(BoxedStream, BoxedStream)>>,
    status: Mutex<TunnelStatus>,
    up: Arc<TrafficMonitor>,
    down: Arc<TrafficMonitor>,
    close_tx: Arc<watch::Sender<bool>>,
}

impl Tunnel {
    /// Create a tunnel between `local` (client side) and `remote` (outlet side)
    pub fn new(local: BoxedStream, remote: BoxedStream, config: TunnelConfig) -> Self {
        Self::with_id(generate_unique_id(), local, remote, config)
    }

    /// Create a tunnel with a caller-chosen id
    pub fn with_id(
        id: impl Into<String>,
        local: BoxedStream,
        remote: BoxedStream,
        config: TunnelConfig,
    ) -> Self {
        let id = id.into();
        let (close_tx, _) = watch::channel(false);
        Tunnel {
            status: Mutex::new(TunnelStatus {
                id: id.clone(),
                ..Default::default()
            }),
            id,
            config,
            state: AtomicU8::new(TunnelState::Created as u8),
            streams: Mutex::new(Some((local, remote))),
            up: Arc::new(TrafficMonitor::new(config.window_size)),
            down: Arc::new(TrafficMonitor::new(config.window_size)),
            close_tx: Arc::new(close_tx),
        }
    }

    /// Record the outlet name in the status
    pub fn with_outlet(self, outlet: impl Into<String>) -> Self {
        self.status.lock().outlet = outlet.into();
        self
    }

    /// Tunnel id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current lifecycle state
    pub fn state(&self) -> TunnelState {
        TunnelState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Relay until both directions finish
    ///
    /// End-of-stream is a clean finish; the first other IO error is
    /// returned. Can only be called once.
    pub async fn start(&self) -> Result<(), TunnelError> {
        if let Err(current) = self.state.compare_exchange(
            TunnelState::Created as u8,
            TunnelState::Active as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            return match TunnelState::from_u8(current) {
                TunnelState::Closed => Err(TunnelError::NotActive),
                _ => Err(TunnelError::AlreadyStarted),
            };
        }

        let (local, remote) = self.streams.lock().take().ok_or(TunnelError::NotActive)?;

        let started = Instant::now();
        self.status.lock().start_time = Some(SystemTime::now());
        debug!("Tunnel {} started", self.id);

        let (local_r, local_w) = tokio::io::split(local);
        let (remote_r, remote_w) = tokio::io::split(remote);
        let first_error: Arc<Mutex<Option<io::Error>>> = Arc::new(Mutex::new(None));

        let upstream = tokio::spawn(relay(
            Monitored::new(local_r, self.up.clone()),
            remote_w,
            self.config.buffer_size,
            self.close_tx.clone(),
            first_error.clone(),
        ));
        let downstream = tokio::spawn(relay(
            Monitored::new(remote_r, self.down.clone()),
            local_w,
            self.config.buffer_size,
            self.close_tx.clone(),
            first_error.clone(),
        ));

        let (up_done, down_done) = tokio::join!(upstream, downstream);
        for done in [up_done, down_done] {
            if let Err(e) = done {
                let mut slot = first_error.lock();
                if slot.is_none() {
                    *slot = Some(io::Error::new(io::ErrorKind::Other, e.to_string()));
                }
            }
        }

        {
            let mut status = self.status.lock();
            status.end_time = Some(SystemTime::now());
            status.total_duration = started.elapsed();
            status.up_bytes = self.up.total_bytes();
            status.down_bytes = self.down.total_bytes();
            status.up_speed = self.up.speeds().1;
            status.down_speed = self.down.speeds().1;
        }

        self.close();

        let result = first_error.lock().take();
        match result {
            Some(e) => Err(TunnelError::Io(e)),
            None => Ok(()),
        }
    }

    /// Close the tunnel; safe to call any number of times
    ///
    /// A running `start` stops relaying and drops both connections.
    pub fn close(&self) {
        let previous = self.state.swap(TunnelState::Closed as u8, Ordering::SeqCst);
        self.close_tx.send_replace(true);
        // never started: drop the connections here
        let unstarted = self.streams.lock().take();
        if previous != TunnelState::Closed as u8 {
            trace!(
                "Tunnel {} closed (was {:?}, streams dropped: {})",
                self.id,
                TunnelState::from_u8(previous),
                unstarted.is_some()
            );
        }
    }

    /// Snapshot of the traffic status
    pub fn get_status(&self) -> TunnelStatus {
        let mut status = self.status.lock().clone();
        if status.end_time.is_none() {
            status.up_bytes = self.up.total_bytes();
            status.down_bytes = self.down.total_bytes();
        }
        status
    }

    /// `(instant, average)` upload speed while relaying
    pub fn current_up_speed(&self) -> (f64, f64) {
        self.up.speeds()
    }

    /// `(instant, average)` download speed while relaying
    pub fn current_down_speed(&self) -> (f64, f64) {
        self.down.speeds()
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.close_tx.send_replace(true);
    }
}

/// Copy `reader` into `writer`, then half-close `writer`
///
/// Stops early when the tunnel is closed. Errors other than end-of-stream
/// are stored in `first_error` (if it is still empty) and close the tunnel
/// so the opposite direction stops too.
async fn relay<R, W>(
    mut reader: R,
    mut writer: W,
    buffer_size: usize,
    close_tx: Arc<watch::Sender<bool>>,
    first_error: Arc<Mutex<Option<io::Error>>>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut closed = close_tx.subscribe();
    let mut buf = vec![0u8; buffer_size];

    let copy = async {
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            };
            writer.write_all(&buf[..n]).await?;
        }
        // peer may already be gone; the shutdown result does not matter
        let _ = writer.shutdown().await;
        Ok::<(), io::Error>(())
    };

    let result = tokio::select! {
        result = copy => result,
        _ = closed.wait_for(|closed| *closed) => Ok(()),
    };

    if let Err(e) = result {
        {
            let mut slot = first_error.lock();
            if slot.is_none() {
                *slot = Some(e);
            }
        }
        close_tx.send_replace(true);
    }
}
