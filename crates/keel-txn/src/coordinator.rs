//! The caller-facing coordinator: transaction and run entry points.

use std::time::Duration;

use futures_util::future::BoxFuture;
use keel_conn::{ConnectOptions, Connector};
use keel_pool::{Pool, PoolConfig, PoolError};

use crate::error::TransactionError;
use crate::tx::Transaction;

/// Transaction and run entry points over a worker pool.
///
/// A `Coordinator` is a cheap handle; clone it into every task that needs
/// database access. Concurrent callers get independent contexts and, in
/// general, independent workers. The only sharing path is nesting within
/// one caller's own context.
pub struct Coordinator<C: Connector> {
    pool: Pool<C>,
}

impl<C: Connector> Clone for Coordinator<C> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
        }
    }
}

impl<C: Connector> Coordinator<C> {
    /// Start a pool and wrap it in a coordinator.
    pub async fn start(
        connector: C,
        options: ConnectOptions,
        config: PoolConfig,
    ) -> Result<Self, PoolError> {
        let pool = Pool::start(connector, options, config).await?;
        Ok(Self { pool })
    }

    /// Wrap an already-running pool.
    pub fn from_pool(pool: Pool<C>) -> Self {
        Self { pool }
    }

    /// The underlying pool, for status and metrics.
    #[must_use]
    pub fn pool(&self) -> &Pool<C> {
        &self.pool
    }

    /// Stop the underlying pool. Outstanding contexts stay valid until
    /// they finish; every later operation fails with
    /// [`PoolError::Closed`].
    pub async fn stop(&self) {
        self.pool.stop().await;
    }

    /// Run `body` inside a transaction context.
    ///
    /// Checks a worker out of the pool (waiting up to `timeout`), builds a
    /// context at depth 0 whose `queue_time()` reports the wait, and hands
    /// it to the body. The worker is checked back in when the context
    /// ends, on normal return and panic and cancellation alike, so a
    /// crashed caller never strands a worker.
    ///
    /// The body's return value comes back wrapped in `Ok`; checkout-layer
    /// failures surface as [`TransactionError::Pool`].
    pub async fn transaction<T, F>(&self, timeout: Duration, body: F) -> Result<T, TransactionError>
    where
        F: for<'t> FnOnce(&'t mut Transaction<C>) -> BoxFuture<'t, T>,
    {
        let (worker, queue_time) = self.pool.checkout(timeout).await?;
        let mut tx = Transaction::new(worker, queue_time);
        let value = body(&mut tx).await;
        tx.finish();
        Ok(value)
    }

    /// Run `body` once on a checked-out connection, without transaction
    /// bookkeeping.
    ///
    /// The body receives the connection and the queue time. The worker is
    /// checked back in on every exit path; a crash while holding a plain
    /// run checkout does not condemn the connection (no transaction was
    /// open, so its state is known good).
    ///
    /// To run one-shot work *inside* an open transaction, use
    /// [`Transaction::run`] on the context instead; it reuses the held
    /// connection and reports its queue time as absent.
    pub async fn run<T, F>(&self, timeout: Duration, body: F) -> Result<T, TransactionError>
    where
        F: for<'c> FnOnce(&'c mut C::Conn, Option<Duration>) -> BoxFuture<'c, T>,
    {
        let (mut worker, queue_time) = self.pool.checkout(timeout).await?;
        let conn = worker
            .connection()
            .ok_or(TransactionError::NoConnection)?;
        let value = body(conn, Some(queue_time)).await;
        drop(worker);
        Ok(value)
    }
}

impl<C: Connector> std::fmt::Debug for Coordinator<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("pool", &self.pool.status())
            .finish()
    }
}
