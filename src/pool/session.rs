//! Pooled session structure
//!
//! Represents a single multiplexed session in the pool with health metadata.

use crate::mux::{MuxSession, OpenStreamError};
use crate::transport::BoxedStream;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Health state of a pooled session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Accepting new streams
    Active = 0,
    /// Refused a stream recently; skipped until it cools down
    Busy = 1,
    /// Unusable; waiting to be reaped
    Dead = 2,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Active,
            1 => SessionState::Busy,
            _ => SessionState::Dead,
        }
    }
}

/// A multiplexed session with pool metadata
pub struct PoolSession {
    id: u64,
    session: Arc<dyn MuxSession>,
    state: AtomicU8,
    /// When the session was created
    created_at: Instant,
    /// When a stream was last opened on the session
    last_used: Mutex<Instant>,
    /// When `state` last changed
    state_since: Mutex<Instant>,
}

impl PoolSession {
    /// Wrap a freshly created session as `Active`
    pub fn new(id: u64, session: Arc<dyn MuxSession>) -> Self {
        let now = Instant::now();
        PoolSession {
            id,
            session,
            state: AtomicU8::new(SessionState::Active as u8),
            created_at: now,
            last_used: Mutex::new(now),
            state_since: Mutex::new(now),
        }
    }

    /// Pool-local session id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Move to `state`
    pub fn set_state(&self, state: SessionState) {
        let previous = self.state.swap(state as u8, Ordering::SeqCst);
        if previous != state as u8 {
            *self.state_since.lock() = Instant::now();
        }
    }

    /// Usable for new streams: active and the underlying session still open
    pub fn is_healthy(&self) -> bool {
        self.state() == SessionState::Active && !self.session.is_closed()
    }

    /// Marked dead and ready to be reaped
    pub fn is_dead(&self) -> bool {
        self.state() == SessionState::Dead
    }

    /// Whether the underlying session has closed
    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    /// Open streams on the underlying session
    pub fn num_streams(&self) -> usize {
        self.session.num_streams()
    }

    /// Open a logical stream and record the use
    pub async fn open_stream(&self) -> Result<BoxedStream, OpenStreamError> {
        let stream = self.session.open_stream().await?;
        self.touch();
        Ok(stream)
    }

    /// Close the underlying session
    pub fn close(&self) {
        self.session.close();
    }

    /// Mark the session as used
    pub fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    /// Get the age of the session
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Get the time since a stream was last opened
    pub fn idle_time(&self) -> Duration {
        self.last_used.lock().elapsed()
    }

    /// Time spent in the current state
    pub fn state_age(&self) -> Duration {
        self.state_since.lock().elapsed()
    }
}

impl std::fmt::Debug for PoolSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("streams", &self.num_streams())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::io;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct StubSession {
        closed: AtomicBool,
    }

    #[async_trait]
    impl MuxSession for StubSession {
        async fn open_stream(&self) -> Result<BoxedStream, OpenStreamError> {
            if self.is_closed() {
                return Err(OpenStreamError::Fatal(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "closed",
                )));
            }
            let (a, _b) = tokio::io::duplex(8);
            Ok(Box::new(a))
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        fn num_streams(&self) -> usize {
            0
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_session_state_roundtrip() {
        for state in [SessionState::Active, SessionState::Busy, SessionState::Dead] {
            assert_eq!(SessionState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn test_new_session_is_healthy() {
        let session = PoolSession::new(1, Arc::new(StubSession::default()));
        assert_eq!(session.id(), 1);
        assert_eq!(session.state(), SessionState::Active);
        assert!(session.is_healthy());
        assert!(!session.is_dead());
        assert!(session.age() < Duration::from_secs(1));
    }

    #[test]
    fn test_health_follows_state() {
        let session = PoolSession::new(1, Arc::new(StubSession::default()));

        session.set_state(SessionState::Busy);
        assert!(!session.is_healthy());
        assert!(!session.is_dead());

        session.set_state(SessionState::Dead);
        assert!(!session.is_healthy());
        assert!(session.is_dead());
    }

    #[test]
    fn test_closed_session_is_unhealthy() {
        let session = PoolSession::new(1, Arc::new(StubSession::default()));
        session.close();
        assert!(session.is_closed());
        assert!(!session.is_healthy());
        // closed is not dead until someone marks it
        assert!(!session.is_dead());
    }

    #[test]
    fn test_state_age_resets_on_change() {
        let session = PoolSession::new(1, Arc::new(StubSession::default()));
        std::thread::sleep(Duration::from_millis(5));
        let before = session.state_age();

        session.set_state(SessionState::Active);
        assert!(session.state_age() >= before);

        session.set_state(SessionState::Busy);
        assert!(session.state_age() < before);
    }

    #[tokio::test]
    async fn test_open_stream_touches() {
        let session = PoolSession::new(1, Arc::new(StubSession::default()));
        std::thread::sleep(Duration::from_millis(5));
        let idle = session.idle_time();

        session.open_stream().await.unwrap();
        assert!(session.idle_time() < idle);
    }
}
