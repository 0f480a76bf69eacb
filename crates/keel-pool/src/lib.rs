//! # keel-pool
//!
//! Bounded connection-worker pool for the keel database core.
//!
//! The pool owns a fixed set of workers, one physical connection slot
//! each, plus a bounded overflow. Callers check a worker out for the
//! duration of some work and the worker returns to the pool afterwards,
//! connection kept warm. All waiting is cooperative: a checkout suspends
//! only the requesting task, never the pool.
//!
//! Checkout and checkin are strictly paired. The [`PooledWorker`] guard
//! returns its worker on drop, so the pairing holds on early return, panic
//! unwind, and future cancellation alike; there is no code path that leaks
//! a checked-out worker.
//!
//! ## Example
//!
//! ```rust,ignore
//! use keel_pool::{Pool, PoolConfig};
//! use std::time::Duration;
//!
//! let config = PoolConfig::new().size(4).max_overflow(2);
//! let pool = Pool::start(connector, options, config).await?;
//!
//! let (worker, queue_time) = pool.checkout(Duration::from_secs(5)).await?;
//! // Use worker.connection()...
//! // Worker returns to the pool on drop.
//!
//! let status = pool.status();
//! println!("pool utilization: {:.1}%", status.utilization());
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod pool;
pub mod worker;

pub use config::PoolConfig;
pub use error::PoolError;
pub use pool::{Pool, PoolMetrics, PoolStatus, PooledWorker};
pub use worker::{Mode, WorkerState};
