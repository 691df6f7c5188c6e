//! Traffic monitoring for tunnel relays
//!
//! A [`TrafficMonitor`] keeps a bounded window of `(timestamp, bytes)`
//! samples; [`Monitored`] wraps a reader and feeds every non-empty read into
//! a monitor.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::io::{AsyncRead, ReadBuf};

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    bytes: u64,
}

/// Rolling throughput window for one relay direction
#[derive(Debug)]
pub struct TrafficMonitor {
    window: Mutex<VecDeque<Sample>>,
    max_window: usize,
    total: AtomicU64,
}

impl TrafficMonitor {
    /// Create a monitor keeping at most `max_window` samples
    pub fn new(max_window: usize) -> Self {
        let max_window = max_window.max(2);
        TrafficMonitor {
            window: Mutex::new(VecDeque::with_capacity(max_window)),
            max_window,
            total: AtomicU64::new(0),
        }
    }

    /// Record `bytes` transferred now
    pub fn record(&self, bytes: usize) {
        self.record_at(Instant::now(), bytes as u64);
    }

    fn record_at(&self, at: Instant, bytes: u64) {
        self.total.fetch_add(bytes, Ordering::Relaxed);
        let mut window = self.window.lock();
        if window.len() >= self.max_window {
            window.pop_front();
        }
        window.push_back(Sample { at, bytes });
    }

    /// Bytes recorded since creation
    pub fn total_bytes(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Samples currently in the window
    pub fn sample_count(&self) -> usize {
        self.window.lock().len()
    }

    /// `(instant, average)` speed in bytes per second
    ///
    /// Instant speed is the newest sample over the gap to the one before it;
    /// average speed is all windowed bytes over the window's time span. Both
    /// are zero with fewer than two samples.
    pub fn speeds(&self) -> (f64, f64) {
        let window = self.window.lock();
        if window.len() < 2 {
            return (0.0, 0.0);
        }

        let last = window[window.len() - 1];
        let prev = window[window.len() - 2];
        let gap = last.at.duration_since(prev.at).as_secs_f64();
        let current = if gap > 0.0 {
            last.bytes as f64 / gap
        } else {
            0.0
        };

        let first = window[0];
        let span = last.at.duration_since(first.at).as_secs_f64();
        let total: u64 = window.iter().map(|s| s.bytes).sum();
        let average = if span > 0.0 { total as f64 / span } else { 0.0 };

        (current, average)
    }
}

/// Reader wrapper that reports every read to a [`TrafficMonitor`]
pub struct Monitored<R> {
    inner: R,
    monitor: Arc<TrafficMonitor>,
}

impl<R> Monitored<R> {
    /// Wrap `inner`
    pub fn new(inner: R, monitor: Arc<TrafficMonitor>) -> Self {
        Monitored { inner, monitor }
    }

    /// Unwrap the reader
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for Monitored<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            let read = buf.filled().len() - before;
            if read > 0 {
                self.monitor.record(read);
            }
        }
        poll
    }
}
