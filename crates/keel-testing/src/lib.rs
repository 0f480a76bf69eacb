//! # keel-testing
//!
//! Test infrastructure for keel development.
//!
//! Provides an in-memory implementation of the connection capability with
//! enough fault injection to exercise the pool and coordinator without a
//! database: sessions can be killed out from under their worker, connect
//! attempts can be scripted to fail, and connect latency can be dialed in
//! for queue-time assertions.
//!
//! The crate also hosts the cross-crate integration suites (under
//! `tests/`); keeping them here avoids circular dev-dependencies between
//! the pool and coordinator crates.

#![warn(missing_docs)]
#![deny(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use keel_conn::{ConnError, ConnectOptions, Connection, Connector};
use parking_lot::Mutex;

/// An observer handle onto one test session.
///
/// Cheap to clone; stays valid after the session itself is gone, so tests
/// can assert on sessions the pool has already replaced.
#[derive(Clone)]
pub struct SessionHandle {
    id: u64,
    alive: Arc<AtomicBool>,
}

impl SessionHandle {
    /// The session's id, unique per connector.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the session still reports alive.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Kill the session, as if its process died. The owning worker
    /// observes this through the liveness probe.
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// An in-memory session produced by [`TestConnector`].
pub struct TestConnection {
    id: u64,
    alive: Arc<AtomicBool>,
    in_sandbox: bool,
}

impl TestConnection {
    /// The session's id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the session is inside its sandbox wrapping transaction.
    #[must_use]
    pub fn in_sandbox(&self) -> bool {
        self.in_sandbox
    }

    /// An observer handle onto this session.
    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            id: self.id,
            alive: Arc::clone(&self.alive),
        }
    }

    /// Kill the session in place, as if its process died mid-use.
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

// Dropping the session object is the abortive close; the observer handle
// sees it die either way.
impl Drop for TestConnection {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connection for TestConnection {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&mut self) {
        tracing::trace!(session_id = self.id, "test session closed");
        self.alive.store(false, Ordering::SeqCst);
    }

    async fn begin_sandbox(&mut self) -> Result<(), ConnError> {
        if !self.is_alive() {
            return Err(ConnError::Closed);
        }
        self.in_sandbox = true;
        Ok(())
    }

    async fn rollback_sandbox(&mut self) -> Result<(), ConnError> {
        if !self.is_alive() {
            return Err(ConnError::Closed);
        }
        self.in_sandbox = false;
        Ok(())
    }
}

#[derive(Default)]
struct ConnectorInner {
    next_id: AtomicU64,
    opened: AtomicU64,
    fail_connects: AtomicUsize,
    connect_delay: Mutex<Duration>,
    sessions: Mutex<Vec<SessionHandle>>,
}

/// An in-memory connector with fault injection.
///
/// Cheap to clone: all clones share one session log and one fault budget,
/// so a test can keep a handle on the connector it gave the pool.
#[derive(Clone, Default)]
pub struct TestConnector {
    inner: Arc<ConnectorInner>,
}

impl TestConnector {
    /// Create a connector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// How many sessions have been opened so far.
    #[must_use]
    pub fn opened(&self) -> u64 {
        self.inner.opened.load(Ordering::SeqCst)
    }

    /// Make the next `n` connect attempts fail with
    /// [`ConnError::Refused`].
    pub fn fail_next_connects(&self, n: usize) {
        self.inner.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Delay every connect attempt by `delay`.
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.inner.connect_delay.lock() = delay;
    }

    /// Observer handles for every session ever opened, in order.
    #[must_use]
    pub fn sessions(&self) -> Vec<SessionHandle> {
        self.inner.sessions.lock().clone()
    }

    /// Observer handle for the most recently opened session.
    #[must_use]
    pub fn last_session(&self) -> Option<SessionHandle> {
        self.inner.sessions.lock().last().cloned()
    }
}

#[async_trait]
impl Connector for TestConnector {
    type Conn = TestConnection;

    async fn connect(&self, _options: &ConnectOptions) -> Result<TestConnection, ConnError> {
        let delay = *self.inner.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let budget = self.inner.fail_connects.load(Ordering::SeqCst);
        if budget > 0 {
            self.inner.fail_connects.store(budget - 1, Ordering::SeqCst);
            return Err(ConnError::Refused("scripted connect failure".to_string()));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.opened.fetch_add(1, Ordering::SeqCst);

        let conn = TestConnection {
            id,
            alive: Arc::new(AtomicBool::new(true)),
            in_sandbox: false,
        };
        self.inner.sessions.lock().push(conn.handle());
        tracing::trace!(session_id = id, "test session opened");
        Ok(conn)
    }
}

/// Install a test-friendly tracing subscriber once per process.
///
/// Respects `RUST_LOG`; output goes through the libtest capture so it only
/// shows for failing tests.
pub fn init_tracing() {
    static INIT: once_cell::sync::OnceCell<()> = once_cell::sync::OnceCell::new();
    INIT.get_or_init(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sessions_get_sequential_ids() {
        let connector = TestConnector::new();
        let opts = ConnectOptions::default();

        let first = connector.connect(&opts).await.unwrap();
        let second = connector.connect(&opts).await.unwrap();

        assert_eq!(first.id(), 1);
        assert_eq!(second.id(), 2);
        assert_eq!(connector.opened(), 2);
    }

    #[tokio::test]
    async fn kill_switch_is_visible_through_the_handle() {
        let connector = TestConnector::new();
        let conn = connector.connect(&ConnectOptions::default()).await.unwrap();
        let handle = conn.handle();

        assert!(conn.is_alive());
        handle.kill();
        assert!(!conn.is_alive());
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn scripted_connect_failures_are_consumed() {
        let connector = TestConnector::new();
        connector.fail_next_connects(1);
        let opts = ConnectOptions::default();

        assert!(connector.connect(&opts).await.is_err());
        assert!(connector.connect(&opts).await.is_ok());
    }

    #[tokio::test]
    async fn sandbox_instructions_require_a_live_session() {
        let connector = TestConnector::new();
        let mut conn = connector.connect(&ConnectOptions::default()).await.unwrap();

        conn.begin_sandbox().await.unwrap();
        assert!(conn.in_sandbox());

        conn.kill();
        assert!(matches!(
            conn.rollback_sandbox().await,
            Err(ConnError::Closed)
        ));
    }
}
