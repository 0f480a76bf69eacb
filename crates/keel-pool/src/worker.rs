//! Worker: lifecycle wrapper around a single physical connection.

use std::sync::Arc;
use std::time::Duration;

use keel_conn::{ConnError, ConnectOptions, Connection, Connector};

/// Transaction mode carried by a worker's connection.
///
/// The mode is a property of the physical connection, not of any one
/// checkout: a worker switched to [`Mode::Sandbox`] stays sandboxed across
/// checkins, which is what lets a test suite reuse one rolled-back session
/// across many callers, including callers that crashed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Ordinary transactions; work is committed as usual.
    #[default]
    Raw,

    /// The connection sits inside a wrapping transaction that is never
    /// committed. Everything executed on it is rolled back when the sandbox
    /// ends, which gives test suites automatic isolation.
    Sandbox,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Raw => f.write_str("raw"),
            Self::Sandbox => f.write_str("sandbox"),
        }
    }
}

/// Observable worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// No connection; one will be opened at next checkout.
    Disconnected,
    /// A live connection is held.
    Connected,
    /// The connection witnessed a failure and will be closed at checkin.
    Broken,
}

/// How [`Worker::ensure_connected`] obtained its live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectOutcome {
    /// The held connection was still alive and was kept.
    Kept,
    /// The slot was empty; a connection was opened.
    Opened,
    /// The held connection was dead; it was replaced.
    Reopened,
}

/// A single connection slot.
///
/// A worker holds at most one live connection. Connect failures are
/// returned to the caller, never retried here; retry policy belongs to
/// whoever drives the worker.
pub(crate) struct Worker<C: Connector> {
    id: u64,
    opts: Arc<ConnectOptions>,
    conn: Option<C::Conn>,
    broken: bool,
    mode: Mode,
    overflow: bool,
}

impl<C: Connector> Worker<C> {
    pub(crate) fn new(id: u64, opts: Arc<ConnectOptions>, overflow: bool) -> Self {
        Self {
            id,
            opts,
            conn: None,
            broken: false,
            mode: Mode::Raw,
            overflow,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_overflow(&self) -> bool {
        self.overflow
    }

    pub(crate) fn is_broken(&self) -> bool {
        self.broken
    }

    pub(crate) fn mode(&self) -> Mode {
        self.mode
    }

    pub(crate) fn state(&self) -> WorkerState {
        if self.broken {
            WorkerState::Broken
        } else if self.conn.is_some() {
            WorkerState::Connected
        } else {
            WorkerState::Disconnected
        }
    }

    pub(crate) fn connection(&mut self) -> Option<&mut C::Conn> {
        self.conn.as_mut()
    }

    /// Mark the connection as having witnessed a failure. It will be
    /// closed at checkin instead of being reused.
    pub(crate) fn poison(&mut self) {
        self.broken = true;
    }

    /// Make sure a live connection is held, opening one within `timeout`
    /// if needed.
    ///
    /// A held connection that no longer reports alive is treated as an
    /// implicit break: the dead session is dropped and a fresh one opened.
    pub(crate) async fn ensure_connected(
        &mut self,
        connector: &C,
        timeout: Duration,
    ) -> Result<ConnectOutcome, ConnError> {
        if self.broken {
            // Broken workers are normally cleaned at checkin; clean here as
            // a backstop so a checkout never hands out a poisoned session.
            self.discard_connection();
        }

        let mut outcome = ConnectOutcome::Opened;
        if let Some(conn) = self.conn.as_ref() {
            if conn.is_alive() {
                return Ok(ConnectOutcome::Kept);
            }
            tracing::warn!(worker_id = self.id, "session died while worker was idle");
            self.conn = None;
            self.mode = Mode::Raw;
            outcome = ConnectOutcome::Reopened;
        }

        tracing::debug!(worker_id = self.id, "opening connection");
        let conn = tokio::time::timeout(timeout, connector.connect(&self.opts))
            .await
            .map_err(|_| ConnError::Timeout(timeout))??;
        self.conn = Some(conn);
        Ok(outcome)
    }

    /// Whether the worker holds a connection that currently reports alive.
    pub(crate) fn has_live_connection(&self) -> bool {
        !self.broken && self.conn.as_ref().is_some_and(|c| c.is_alive())
    }

    /// Instruct the live connection to enter or leave sandbox mode.
    ///
    /// Errors if no connection is active. A connectivity failure or timeout
    /// poisons the worker; the session state is unknown at that point.
    pub(crate) async fn set_mode(&mut self, mode: Mode, timeout: Duration) -> Result<(), ConnError> {
        let conn = self.conn.as_mut().ok_or(ConnError::Closed)?;

        let instruction = async {
            match mode {
                Mode::Sandbox => conn.begin_sandbox().await,
                Mode::Raw => conn.rollback_sandbox().await,
            }
        };
        let outcome = tokio::time::timeout(timeout, instruction).await;

        match outcome {
            Ok(Ok(())) => {
                tracing::debug!(worker_id = self.id, %mode, "worker mode changed");
                self.mode = mode;
                Ok(())
            }
            Ok(Err(e)) => {
                if e.is_disconnect() {
                    self.broken = true;
                }
                Err(e)
            }
            Err(_) => {
                self.broken = true;
                Err(ConnError::Timeout(timeout))
            }
        }
    }

    /// Forcibly close the live connection. Never errors; a close that does
    /// not finish within `timeout` falls back to dropping the session.
    pub(crate) async fn break_connection(&mut self, timeout: Duration) {
        if let Some(mut conn) = self.conn.take() {
            tracing::warn!(worker_id = self.id, "breaking connection");
            if tokio::time::timeout(timeout, conn.close()).await.is_err() {
                tracing::warn!(worker_id = self.id, "graceful close timed out; dropping session");
            }
        }
        // The sandbox transaction, if any, died with the session.
        self.broken = false;
        self.mode = Mode::Raw;
    }

    /// Drop the connection without a graceful close and reset the slot to
    /// disconnected. Used on the synchronous checkin path.
    pub(crate) fn discard_connection(&mut self) {
        if self.conn.take().is_some() {
            tracing::debug!(worker_id = self.id, "discarding connection");
        }
        self.broken = false;
        self.mode = Mode::Raw;
    }
}
