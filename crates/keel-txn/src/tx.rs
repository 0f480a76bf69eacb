//! The transaction context handle.

use std::time::Duration;

use futures_util::future::BoxFuture;
use keel_conn::Connector;
use keel_pool::{Mode, PooledWorker};

use crate::error::TransactionError;

/// A transaction context: one checked-out worker plus the caller's nesting
/// state.
///
/// The context is created by the outermost
/// [`Coordinator::transaction`](crate::Coordinator::transaction) call and
/// threaded through nested calls by `&mut` reference. It is destroyed,
/// and its worker checked back in, when the outermost call returns,
/// panics, or is cancelled.
pub struct Transaction<C: Connector> {
    worker: PooledWorker<C>,
    mode: Mode,
    depth: u32,
    queue_time: Option<Duration>,
    disconnected: bool,
    completed: bool,
}

impl<C: Connector> Transaction<C> {
    pub(crate) fn new(worker: PooledWorker<C>, queue_time: Duration) -> Self {
        let mode = worker.mode();
        Self {
            worker,
            mode,
            depth: 0,
            queue_time: Some(queue_time),
            disconnected: false,
            completed: false,
        }
    }

    /// The mode of the whole nested stack.
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Current nesting depth. 0 in the outermost body.
    #[must_use]
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// How long this scope waited for its worker.
    ///
    /// `Some` only in the outermost scope; nested scopes reuse the held
    /// worker and report `None`.
    #[must_use]
    pub fn queue_time(&self) -> Option<Duration> {
        self.queue_time
    }

    /// Whether the context has lost its connection.
    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    /// The id of the worker backing this context.
    #[must_use]
    pub fn worker_id(&self) -> u64 {
        self.worker.id()
    }

    /// The live connection.
    ///
    /// Fails with [`TransactionError::NoConnection`] once the context has
    /// been disconnected, anywhere in the nested stack.
    pub fn connection(&mut self) -> Result<&mut C::Conn, TransactionError> {
        if self.disconnected {
            return Err(TransactionError::NoConnection);
        }
        self.worker
            .connection()
            .ok_or(TransactionError::NoConnection)
    }

    /// Run a nested transaction.
    ///
    /// No new checkout happens: the body runs on the same worker, one
    /// level deeper, with `queue_time()` reporting `None`. If the context
    /// was disconnected by an enclosing scope, the body is not invoked and
    /// [`TransactionError::NoConnection`] is returned: a failed outer
    /// transaction poisons every nested attempt under it.
    pub async fn transaction<T, F>(&mut self, body: F) -> Result<T, TransactionError>
    where
        F: for<'t> FnOnce(&'t mut Transaction<C>) -> BoxFuture<'t, T>,
    {
        if self.disconnected {
            return Err(TransactionError::NoConnection);
        }

        self.depth += 1;
        let outer_queue_time = self.queue_time.take();
        tracing::debug!(
            worker_id = self.worker.id(),
            depth = self.depth,
            "entering nested transaction"
        );

        let value = body(self).await;

        self.queue_time = outer_queue_time;
        self.depth -= 1;
        Ok(value)
    }

    /// Run a one-shot body on the held connection.
    ///
    /// Depth-transparent: the nesting level does not change, and the body
    /// sees a queue time of `None` because no checkout happened.
    pub async fn run<T, F>(&mut self, body: F) -> Result<T, TransactionError>
    where
        F: for<'c> FnOnce(&'c mut C::Conn, Option<Duration>) -> BoxFuture<'c, T>,
    {
        let conn = self.connection()?;
        Ok(body(conn, None).await)
    }

    /// Drop the connection from this context.
    ///
    /// In raw mode the physical connection is forcibly closed and every
    /// later `connection()`/nested `transaction` call in this stack fails
    /// with [`TransactionError::NoConnection`]. Never errors.
    ///
    /// In sandbox mode this is suppressed entirely: the sandbox session
    /// carries the test's rolled-back state and outlives failures on
    /// purpose. See the crate-level notes on the sandbox asymmetry.
    pub async fn disconnect(&mut self, timeout: Duration) {
        match self.mode {
            Mode::Sandbox => {
                tracing::debug!(
                    worker_id = self.worker.id(),
                    "disconnect suppressed in sandbox mode"
                );
            }
            Mode::Raw => {
                if self.disconnected {
                    return;
                }
                self.disconnected = true;
                self.worker.break_connection(timeout).await;
            }
        }
    }

    /// Run a fallible body; on `Err`, disconnect before handing the error
    /// back unchanged.
    ///
    /// A connection that witnessed a failure is never silently reused,
    /// except in sandbox mode, where the disconnect is suppressed and the
    /// session survives.
    pub async fn fuse<T, E, F>(&mut self, timeout: Duration, body: F) -> Result<T, E>
    where
        F: for<'t> FnOnce(&'t mut Transaction<C>) -> BoxFuture<'t, Result<T, E>>,
    {
        let result = body(self).await;
        if result.is_err() {
            tracing::debug!(worker_id = self.worker.id(), "fuse body failed; disconnecting");
            self.disconnect(timeout).await;
        }
        result
    }

    /// Switch the whole nested stack between raw and sandbox mode.
    ///
    /// Idempotent: requesting the current mode returns
    /// [`TransactionError::AlreadyInMode`], which is informational (the
    /// operation's intent already holds). The mode sticks to the worker, so
    /// it survives checkin and is inherited by the next checkout.
    ///
    /// A connectivity failure while instructing the connection downgrades
    /// this context to disconnected and reports
    /// [`TransactionError::NoConnection`].
    pub async fn set_mode(&mut self, mode: Mode, timeout: Duration) -> Result<(), TransactionError> {
        if self.disconnected {
            return Err(TransactionError::NoConnection);
        }
        if self.mode == mode {
            return Err(TransactionError::AlreadyInMode(mode));
        }

        let outcome = self.worker.set_mode(mode, timeout).await;
        match outcome {
            Ok(()) => {
                self.mode = mode;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    worker_id = self.worker.id(),
                    error = %e,
                    "mode change failed; downgrading context to disconnected"
                );
                self.disconnected = true;
                Err(TransactionError::NoConnection)
            }
        }
    }

    /// Mark the context as having completed normally. Consumes the
    /// context; the worker checks in when it drops, connection kept warm.
    pub(crate) fn finish(mut self) {
        self.completed = true;
    }
}

impl<C: Connector> Drop for Transaction<C> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        // Dropped mid-flight: panic unwind or cancellation. The physical
        // transaction state is unknown, so in raw mode the session must
        // not be reused. The sandbox session survives by design.
        match self.mode {
            Mode::Raw => {
                if !self.disconnected && self.worker.connection().is_some() {
                    tracing::warn!(
                        worker_id = self.worker.id(),
                        "transaction dropped mid-flight; poisoning session"
                    );
                    self.worker.poison();
                }
            }
            Mode::Sandbox => {
                tracing::debug!(
                    worker_id = self.worker.id(),
                    "transaction dropped mid-flight; sandbox session kept"
                );
            }
        }
    }
}

impl<C: Connector> std::fmt::Debug for Transaction<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("worker_id", &self.worker.id())
            .field("mode", &self.mode)
            .field("depth", &self.depth)
            .field("queue_time", &self.queue_time)
            .field("disconnected", &self.disconnected)
            .finish()
    }
}
