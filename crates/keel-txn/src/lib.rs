//! # keel-txn
//!
//! Nested-transaction coordinator over the keel worker pool.
//!
//! A [`Coordinator`] gives callers a connection for the lifetime of a
//! closure, with nesting and crash-safety:
//!
//! - The outermost [`Coordinator::transaction`] checks a worker out of the
//!   pool; nested [`Transaction::transaction`] calls reuse it with no
//!   second checkout, reporting their queue time as absent.
//! - The context handle is threaded through nested calls as `&mut`:
//!   there is no ambient per-task state, and exclusive access across
//!   concurrent callers is a compile-time fact rather than a convention.
//! - Cleanup is guaranteed on every exit path. Normal return, panic
//!   unwind, and future cancellation all check the worker back in.
//!
//! ## Sandbox asymmetry
//!
//! The coordinator runs in one of two [`Mode`]s. `Raw` is the ordinary
//! committable mode. `Sandbox` keeps the physical connection inside a
//! wrapping transaction that is never committed, giving test suites
//! automatic rollback. Sandbox mode deliberately trades crash isolation
//! away to protect that state:
//!
//! - a panic mid-transaction closes the connection in raw mode but **keeps
//!   it alive** in sandbox mode;
//! - [`Transaction::disconnect`] breaks the connection in raw mode but is
//!   **suppressed entirely** in sandbox mode;
//! - [`Transaction::fuse`] disconnects on error in raw mode but leaves the
//!   sandbox session untouched.
//!
//! This asymmetry is easy to miss and entirely intentional: the sandbox
//! connection *is* the test state, so it must survive failures that would
//! rightly condemn an ordinary connection.
//!
//! ## Example
//!
//! ```rust,ignore
//! use keel_txn::Coordinator;
//! use std::time::Duration;
//!
//! let db = Coordinator::start(connector, options, config).await?;
//!
//! let value = db
//!     .transaction(Duration::from_secs(5), |tx| {
//!         Box::pin(async move {
//!             let conn = tx.connection()?;
//!             // ... use the connection ...
//!             Ok::<_, keel_txn::TransactionError>(42)
//!         })
//!     })
//!     .await??;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod coordinator;
pub mod error;
pub mod tx;

pub use coordinator::Coordinator;
pub use error::TransactionError;
pub use keel_pool::Mode;
pub use tx::Transaction;
