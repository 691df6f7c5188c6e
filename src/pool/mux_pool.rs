//! Multiplexed session pool
//!
//! Hands out logical streams over a bounded set of multiplexed sessions.
//! Existing healthy sessions are tried first, least loaded first; a new
//! session is dialed only when none of them can take the stream.

use super::session::{PoolSession, SessionState};
use super::stats::{PoolManager, PoolStats, PoolStatsSnapshot};
use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::mux::Multiplexer;
use crate::transport::{BoxedStream, Dialer};
use parking_lot::RwLock;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Default)]
struct PoolInner {
    sessions: Vec<Arc<PoolSession>>,
    /// Dials in flight; they count against `max_sessions`
    pending: usize,
    closed: bool,
}

enum Slot {
    /// A healthy session appeared while we were waiting for the lock
    HealthyExists,
    /// Room was reserved for one new session
    Reserved,
}

/// Multiplexed session pool for one outlet
pub struct MuxPool {
    name: String,
    dialer: Arc<dyn Dialer>,
    multiplexer: Arc<dyn Multiplexer>,
    inner: RwLock<PoolInner>,
    next_id: AtomicU64,
    manager: PoolManager,
}

/// Releases a pending-dial slot unless the dial was committed
struct Reservation<'a> {
    pool: &'a MuxPool,
    active: bool,
}

impl Reservation<'_> {
    fn commit(mut self, session: Arc<PoolSession>) -> Result<(), PoolError> {
        self.active = false;
        let mut inner = self.pool.inner.write();
        inner.pending -= 1;
        if inner.closed {
            drop(inner);
            session.close();
            return Err(PoolError::Closed);
        }
        inner.sessions.push(session);
        Ok(())
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.active {
            self.pool.inner.write().pending -= 1;
        }
    }
}

impl MuxPool {
    /// Create an empty pool; sessions are dialed lazily
    pub fn new(
        name: impl Into<String>,
        config: PoolConfig,
        dialer: Arc<dyn Dialer>,
        multiplexer: Arc<dyn Multiplexer>,
    ) -> Self {
        MuxPool {
            name: name.into(),
            dialer,
            multiplexer,
            inner: RwLock::new(PoolInner::default()),
            next_id: AtomicU64::new(1),
            manager: PoolManager::new(config),
        }
    }

    /// Name of the owning outlet
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get a logical stream over a pooled session
    pub async fn get_stream(&self) -> Result<BoxedStream, PoolError> {
        let stats = self.manager.stats();
        stats.record_request();

        match self.acquire().await {
            Ok(stream) => {
                stats.record_success();
                Ok(stream)
            }
            Err(e) => {
                stats.record_failure();
                debug!("[{}] get_stream failed: {}", self.name, e);
                Err(e)
            }
        }
    }

    async fn acquire(&self) -> Result<BoxedStream, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }

        if let Some(stream) = self.try_healthy_sessions().await {
            return Ok(stream);
        }
        self.cleanup_unhealthy();

        match self.reserve_slot()? {
            Slot::Reserved => self.create_session_stream().await,
            Slot::HealthyExists => {
                // one more pass over the sessions another caller just added
                if let Some(stream) = self.try_healthy_sessions().await {
                    return Ok(stream);
                }
                Err(PoolError::StreamOpen(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "healthy sessions exist but none accepted a stream",
                )))
            }
        }
    }

    /// Fast path: open a stream on the least loaded healthy session
    async fn try_healthy_sessions(&self) -> Option<BoxedStream> {
        let sessions: Vec<Arc<PoolSession>> = self.inner.read().sessions.clone();
        if sessions.is_empty() {
            return None;
        }

        let cooldown = self.manager.config().busy_cooldown();
        let mut healthy: Vec<Arc<PoolSession>> = sessions
            .into_iter()
            .filter(|s| {
                if s.is_closed() {
                    s.set_state(SessionState::Dead);
                } else if s.state() == SessionState::Busy && s.state_age() >= cooldown {
                    s.set_state(SessionState::Active);
                }
                s.is_healthy()
            })
            .collect();

        if healthy.is_empty() {
            return None;
        }

        healthy.sort_by_key(|s| s.num_streams());

        for session in healthy {
            match session.open_stream().await {
                Ok(stream) => return Some(stream),
                Err(e) if e.is_fatal() => {
                    warn!("[{}] session {} failed: {}", self.name, session.id(), e);
                    session.set_state(SessionState::Dead);
                }
                Err(e) => {
                    debug!("[{}] session {} busy: {}", self.name, session.id(), e);
                    session.set_state(SessionState::Busy);
                }
            }
        }

        None
    }

    fn reserve_slot(&self) -> Result<Slot, PoolError> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(PoolError::Closed);
        }
        if inner.sessions.iter().any(|s| s.is_healthy()) {
            return Ok(Slot::HealthyExists);
        }

        let max = self.manager.config().max_sessions;
        if inner.sessions.len() + inner.pending >= max {
            return Err(PoolError::Exhausted { max });
        }
        inner.pending += 1;
        Ok(Slot::Reserved)
    }

    /// Slow path: dial a new session and open its first stream
    async fn create_session_stream(&self) -> Result<BoxedStream, PoolError> {
        let reservation = Reservation {
            pool: self,
            active: true,
        };

        let timeout = self.manager.config().dial_timeout();
        let conn = match tokio::time::timeout(timeout, self.dialer.dial()).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Err(PoolError::DialFailed(e)),
            Err(_) => {
                return Err(PoolError::DialFailed(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("dial timed out after {:?}", timeout),
                )))
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(PoolSession::new(id, self.multiplexer.client(conn)));
        reservation.commit(session.clone())?;
        self.manager.stats().record_session_created();
        info!(
            "[{}] created {} session {}",
            self.name,
            self.multiplexer.name(),
            id
        );

        match session.open_stream().await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                session.set_state(SessionState::Dead);
                self.inner
                    .write()
                    .sessions
                    .retain(|s| !Arc::ptr_eq(s, &session));
                session.close();
                Err(PoolError::StreamOpen(e.into_io()))
            }
        }
    }

    /// Remove and close every dead session
    pub fn cleanup_unhealthy(&self) -> usize {
        let removed: Vec<Arc<PoolSession>> = {
            let mut inner = self.inner.write();
            let (dead, living): (Vec<_>, Vec<_>) =
                inner.sessions.drain(..).partition(|s| s.is_dead());
            inner.sessions = living;
            dead
        };

        for session in &removed {
            session.close();
        }

        if !removed.is_empty() {
            self.manager.stats().record_sessions_cleaned(removed.len());
            debug!("[{}] reaped {} dead sessions", self.name, removed.len());
        }
        removed.len()
    }

    /// Report `(healthy, total)` session counts
    pub fn health_check(&self) -> (usize, usize) {
        let inner = self.inner.read();
        let healthy = inner.sessions.iter().filter(|s| s.is_healthy()).count();
        (healthy, inner.sessions.len())
    }

    /// Number of sessions currently held
    pub fn session_count(&self) -> usize {
        self.inner.read().sessions.len()
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.inner.read().closed
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStatsSnapshot {
        self.manager.stats().snapshot()
    }

    /// Shared stats counters
    pub fn stats_handle(&self) -> &Arc<PoolStats> {
        self.manager.stats()
    }

    /// Close every session; later `get_stream` calls fail with `Closed`
    pub fn close(&self) {
        let sessions = {
            let mut inner = self.inner.write();
            inner.closed = true;
            std::mem::take(&mut inner.sessions)
        };
        for session in &sessions {
            session.close();
        }
        self.manager.shutdown();
        info!("[{}] pool closed, {} sessions dropped", self.name, sessions.len());
    }

    /// One maintenance pass
    ///
    /// Closed sessions become dead, busy sessions past the cooldown become
    /// active again, sessions idle with no streams past the idle timeout are
    /// retired, then dead sessions are reaped.
    pub fn maintain(&self) {
        let config = self.manager.config();
        let sessions: Vec<Arc<PoolSession>> = self.inner.read().sessions.clone();

        for session in &sessions {
            if session.is_closed() {
                session.set_state(SessionState::Dead);
                continue;
            }
            match session.state() {
                SessionState::Busy if session.state_age() >= config.busy_cooldown() => {
                    session.set_state(SessionState::Active);
                }
                SessionState::Active
                    if session.num_streams() == 0
                        && session.idle_time() >= config.idle_timeout() =>
                {
                    debug!("[{}] retiring idle session {}", self.name, session.id());
                    session.set_state(SessionState::Dead);
                }
                _ => {}
            }
        }

        self.cleanup_unhealthy();

        let (healthy, total) = self.health_check();
        let stats = self.stats();
        debug!(
            "[{}] pool health: healthy={}, total={}, requests={}, ok={}, failed={}, created={}, cleaned={}",
            self.name,
            healthy,
            total,
            stats.total_requests,
            stats.successful_requests,
            stats.failed_requests,
            stats.sessions_created,
            stats.sessions_cleaned
        );
    }

    /// Run maintenance every `health_check_interval` until the pool closes
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let interval = pool.manager.health_check_interval();
            loop {
                tokio::select! {
                    _ = pool.manager.wait_shutdown() => {
                        debug!("[{}] pool maintenance shutting down", pool.name);
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        pool.maintain();
                    }
                }
            }
        })
    }
}
