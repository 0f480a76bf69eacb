//! Pool implementation: bounded checkout/checkin over a set of workers.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use keel_conn::{ConnError, ConnectOptions, Connector};
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
// Queue times come from the tokio clock so they follow a paused test clock.
use tokio::time::Instant as TokioInstant;

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::worker::{ConnectOutcome, Mode, Worker, WorkerState};

/// A bounded pool of connection workers.
///
/// The pool creates `size` base workers at start and allows up to
/// `max_overflow` short-lived overflow workers while demand exceeds the
/// base set. Waiters are served FIFO; a checkout suspends only the
/// requesting task.
///
/// `Pool` is a cheap handle: clone it freely across tasks.
pub struct Pool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

pub(crate) struct PoolInner<C: Connector> {
    connector: C,
    opts: Arc<ConnectOptions>,
    config: PoolConfig,
    /// Gates concurrent checkouts at `size + max_overflow`. FIFO-fair, so
    /// no waiter starves under bounded load.
    semaphore: Arc<Semaphore>,
    state: Mutex<PoolState<C>>,
    next_worker_id: AtomicU64,
    metrics: Mutex<MetricsInner>,
    created_at: Instant,
}

struct PoolState<C: Connector> {
    idle: VecDeque<Worker<C>>,
    /// Live overflow workers (always checked out; they never idle).
    overflow: usize,
    checked_out: usize,
    closed: bool,
}

#[derive(Debug, Default)]
struct MetricsInner {
    checkouts_successful: u64,
    checkouts_failed: u64,
    checkout_timeouts: u64,
    connections_opened: u64,
    connections_closed: u64,
    implicit_breaks: u64,
    explicit_breaks: u64,
}

impl<C: Connector> Pool<C> {
    /// Start a pool.
    ///
    /// Creates `config.size` base workers. Unless `config.lazy`, each
    /// worker opens its connection before this call returns, and the first
    /// connect failure fails startup.
    pub async fn start(
        connector: C,
        options: ConnectOptions,
        config: PoolConfig,
    ) -> Result<Self, PoolError> {
        config.validate()?;
        options
            .validate()
            .map_err(|e| PoolError::Config(e.to_string()))?;

        let opts = Arc::new(options);
        let next_worker_id = AtomicU64::new(1);
        let mut idle = VecDeque::with_capacity(config.size);

        for _ in 0..config.size {
            let id = next_worker_id.fetch_add(1, Ordering::Relaxed);
            let mut worker = Worker::new(id, Arc::clone(&opts), false);
            if !config.lazy {
                worker
                    .ensure_connected(&connector, opts.connect_timeout)
                    .await?;
            }
            idle.push_back(worker);
        }

        let opened = if config.lazy { 0 } else { config.size as u64 };
        let inner = Arc::new(PoolInner {
            connector,
            opts,
            semaphore: Arc::new(Semaphore::new(config.size + config.max_overflow)),
            state: Mutex::new(PoolState {
                idle,
                overflow: 0,
                checked_out: 0,
                closed: false,
            }),
            next_worker_id,
            metrics: Mutex::new(MetricsInner {
                connections_opened: opened,
                ..MetricsInner::default()
            }),
            created_at: Instant::now(),
            config,
        });

        tracing::info!(
            size = inner.config.size,
            max_overflow = inner.config.max_overflow,
            lazy = inner.config.lazy,
            "connection pool started"
        );

        Ok(Self { inner })
    }

    /// Check a worker out, waiting up to `timeout` for one to free up.
    ///
    /// On success returns the worker guard and the queue time: how long
    /// this caller waited for a slot. The guard returns the worker on drop,
    /// so checkin happens on every exit path, panic and cancellation
    /// included.
    ///
    /// Timing out transfers no ownership: the pool's accounting is
    /// untouched and the caller owes nothing.
    pub async fn checkout(
        &self,
        timeout: Duration,
    ) -> Result<(PooledWorker<C>, Duration), PoolError> {
        let started = TokioInstant::now();

        let permit = match tokio::time::timeout(
            timeout,
            Arc::clone(&self.inner.semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                self.inner.metrics.lock().checkouts_failed += 1;
                return Err(PoolError::Closed);
            }
            Err(_) => {
                self.inner.metrics.lock().checkout_timeouts += 1;
                return Err(PoolError::Timeout {
                    waited: started.elapsed(),
                });
            }
        };
        let queue_time = started.elapsed();

        let mut worker = {
            let mut state = self.inner.state.lock();
            if state.closed {
                // Permit drops here; the stopping pool keeps its books.
                self.inner.metrics.lock().checkouts_failed += 1;
                return Err(PoolError::Closed);
            }
            match state.idle.pop_front() {
                Some(worker) => worker,
                None => {
                    // All base workers are out; the permit guarantees we
                    // are still within size + max_overflow.
                    state.overflow += 1;
                    let id = self.inner.next_worker_id.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(worker_id = id, "creating overflow worker");
                    Worker::new(id, Arc::clone(&self.inner.opts), true)
                }
            }
        };

        let budget = timeout.saturating_sub(started.elapsed());
        let connected = worker.ensure_connected(&self.inner.connector, budget).await;
        match connected {
            Ok(outcome) => {
                let mut metrics = self.inner.metrics.lock();
                metrics.checkouts_successful += 1;
                match outcome {
                    ConnectOutcome::Kept => {}
                    ConnectOutcome::Opened => metrics.connections_opened += 1,
                    ConnectOutcome::Reopened => {
                        metrics.implicit_breaks += 1;
                        metrics.connections_opened += 1;
                        metrics.connections_closed += 1;
                    }
                }
            }
            Err(e) => {
                self.inner.restore_unconnected(worker);
                self.inner.metrics.lock().checkouts_failed += 1;
                return Err(PoolError::Connect(e));
            }
        }

        self.inner.state.lock().checked_out += 1;
        tracing::debug!(
            worker_id = worker.id(),
            queue_ms = queue_time.as_millis() as u64,
            "worker checked out"
        );

        Ok((
            PooledWorker {
                worker: Some(worker),
                pool: Arc::clone(&self.inner),
                _permit: permit,
            },
            queue_time,
        ))
    }

    /// Check a worker out without waiting.
    ///
    /// Returns `Ok(None)` when no slot or no immediately usable worker is
    /// available; never opens a new connection.
    pub fn try_checkout(&self) -> Result<Option<PooledWorker<C>>, PoolError> {
        let permit = match Arc::clone(&self.inner.semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(PoolError::Closed),
            Err(TryAcquireError::NoPermits) => return Ok(None),
        };

        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(PoolError::Closed);
        }

        let usable = state.idle.front().is_some_and(|w| w.has_live_connection());
        if !usable {
            return Ok(None);
        }

        // Checked above; the deque is not touched in between.
        let Some(worker) = state.idle.pop_front() else {
            return Ok(None);
        };
        state.checked_out += 1;
        drop(state);

        self.inner.metrics.lock().checkouts_successful += 1;
        tracing::debug!(worker_id = worker.id(), "worker checked out (try)");

        Ok(Some(PooledWorker {
            worker: Some(worker),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        }))
    }

    /// Stop the pool.
    ///
    /// Idle connections are closed gracefully within the configured
    /// shutdown grace. Outstanding checkouts stay valid until their guards
    /// drop (their workers are then destroyed instead of re-idling), and
    /// every subsequent pool operation fails with [`PoolError::Closed`].
    pub async fn stop(&self) {
        let drained = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.idle)
        };
        self.inner.semaphore.close();

        let grace = self.inner.config.shutdown_grace;
        let mut closed = 0u64;
        for mut worker in drained {
            if worker.connection().is_some() {
                closed += 1;
            }
            worker.break_connection(grace).await;
        }
        self.inner.metrics.lock().connections_closed += closed;

        tracing::info!("connection pool stopped");
    }

    /// Whether [`Pool::stop`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Current pool occupancy.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            size: self.inner.config.size,
            max_overflow: self.inner.config.max_overflow,
            idle: state.idle.len(),
            checked_out: state.checked_out,
            overflow: state.overflow,
        }
    }

    /// Counters accumulated since start.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        let metrics = self.inner.metrics.lock();
        PoolMetrics {
            checkouts_successful: metrics.checkouts_successful,
            checkouts_failed: metrics.checkouts_failed,
            checkout_timeouts: metrics.checkout_timeouts,
            connections_opened: metrics.connections_opened,
            connections_closed: metrics.connections_closed,
            implicit_breaks: metrics.implicit_breaks,
            explicit_breaks: metrics.explicit_breaks,
            uptime: self.inner.created_at.elapsed(),
        }
    }

    /// The pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }
}

impl<C: Connector> PoolInner<C> {
    /// Return a worker whose connect attempt failed. The slot stays in the
    /// pool (disconnected) so the next checkout can retry; overflow workers
    /// are simply discarded.
    fn restore_unconnected(&self, worker: Worker<C>) {
        let mut state = self.state.lock();
        if worker.is_overflow() {
            state.overflow -= 1;
        } else if !state.closed {
            state.idle.push_back(worker);
        }
    }

    fn checkin(&self, mut worker: Worker<C>) {
        let mut state = self.state.lock();
        state.checked_out -= 1;

        let mut closed_connections = 0u64;
        if worker.is_broken() {
            tracing::warn!(worker_id = worker.id(), "checked-in worker was broken; closing session");
            worker.discard_connection();
            closed_connections += 1;
        }

        if worker.is_overflow() {
            state.overflow -= 1;
            if worker.connection().is_some() {
                closed_connections += 1;
            }
            tracing::trace!(worker_id = worker.id(), "overflow worker destroyed at checkin");
        } else if state.closed {
            if worker.connection().is_some() {
                closed_connections += 1;
            }
            tracing::trace!(worker_id = worker.id(), "worker destroyed at checkin; pool stopped");
        } else {
            tracing::trace!(worker_id = worker.id(), "worker checked in");
            state.idle.push_back(worker);
        }
        drop(state);

        if closed_connections > 0 {
            self.metrics.lock().connections_closed += closed_connections;
        }
    }
}

/// A worker checked out of the pool.
///
/// Dropping the guard checks the worker back in. There is deliberately no
/// way to keep the worker past the guard: "checkout has an owner, and
/// owner death implies checkin".
pub struct PooledWorker<C: Connector> {
    worker: Option<Worker<C>>,
    pool: Arc<PoolInner<C>>,
    // Declared last: released only after the worker is back in the idle
    // deque, so the next waiter always finds it there.
    _permit: OwnedSemaphorePermit,
}

impl<C: Connector> PooledWorker<C> {
    // The Option is None only while Drop runs.
    #[allow(clippy::expect_used)]
    fn worker(&self) -> &Worker<C> {
        self.worker.as_ref().expect("worker present until drop")
    }

    #[allow(clippy::expect_used)]
    fn worker_mut(&mut self) -> &mut Worker<C> {
        self.worker.as_mut().expect("worker present until drop")
    }

    /// The worker's id, for correlation with log output.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.worker().id()
    }

    /// The transaction mode currently set on the worker's connection.
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.worker().mode()
    }

    /// The worker's lifecycle state.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        self.worker().state()
    }

    /// The live connection, if any. `None` after a break.
    pub fn connection(&mut self) -> Option<&mut C::Conn> {
        self.worker_mut().connection()
    }

    /// Mark the connection as having witnessed a failure; it will be
    /// closed at checkin instead of being reused.
    pub fn poison(&mut self) {
        tracing::warn!(worker_id = self.id(), "worker poisoned");
        self.worker_mut().poison();
    }

    /// Switch the connection between raw and sandbox mode.
    ///
    /// The mode sticks to the worker across checkins. Errors if the worker
    /// has no live connection; a connectivity failure poisons the worker.
    pub async fn set_mode(&mut self, mode: Mode, timeout: Duration) -> Result<(), ConnError> {
        self.worker_mut().set_mode(mode, timeout).await
    }

    /// Forcibly close the connection now. Never errors; the worker reverts
    /// to disconnected and reconnects on a later checkout.
    pub async fn break_connection(&mut self, timeout: Duration) {
        let had_connection = self.worker_mut().connection().is_some();
        self.worker_mut().break_connection(timeout).await;
        if had_connection {
            let mut metrics = self.pool.metrics.lock();
            metrics.explicit_breaks += 1;
            metrics.connections_closed += 1;
        }
    }
}

impl<C: Connector> Drop for PooledWorker<C> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.pool.checkin(worker);
        }
    }
}

impl<C: Connector> std::fmt::Debug for PooledWorker<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledWorker")
            .field("id", &self.id())
            .field("state", &self.worker().state())
            .field("mode", &self.mode())
            .finish()
    }
}

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy)]
pub struct PoolStatus {
    /// Configured base size.
    pub size: usize,
    /// Configured overflow allowance.
    pub max_overflow: usize,
    /// Idle base workers.
    pub idle: usize,
    /// Workers currently checked out (base and overflow).
    pub checked_out: usize,
    /// Live overflow workers.
    pub overflow: usize,
}

impl PoolStatus {
    /// Fraction of total capacity currently checked out, as a percentage.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        let capacity = self.size + self.max_overflow;
        if capacity == 0 {
            return 0.0;
        }
        (self.checked_out as f64 / capacity as f64) * 100.0
    }

    /// Whether every slot, overflow included, is in use.
    #[must_use]
    pub fn is_at_capacity(&self) -> bool {
        self.checked_out >= self.size + self.max_overflow
    }
}

/// Counters accumulated over the pool's lifetime.
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    /// Checkouts that handed out a worker.
    pub checkouts_successful: u64,
    /// Checkouts that failed (pool closed, connect error).
    pub checkouts_failed: u64,
    /// Checkouts that gave up waiting.
    pub checkout_timeouts: u64,
    /// Physical connections opened.
    pub connections_opened: u64,
    /// Physical connections closed, gracefully or not.
    pub connections_closed: u64,
    /// Sessions found dead at checkout and replaced.
    pub implicit_breaks: u64,
    /// Connections forcibly closed by callers.
    pub explicit_breaks: u64,
    /// Time since the pool started.
    pub uptime: Duration,
}

impl PoolMetrics {
    /// Fraction of checkout attempts that succeeded, 0.0 to 1.0.
    #[must_use]
    pub fn checkout_success_rate(&self) -> f64 {
        let total = self.checkouts_successful + self.checkouts_failed + self.checkout_timeouts;
        if total == 0 {
            return 1.0;
        }
        self.checkouts_successful as f64 / total as f64
    }
}
