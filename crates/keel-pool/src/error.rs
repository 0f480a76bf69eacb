//! Pool error types.

use std::time::Duration;

use keel_conn::ConnError;
use thiserror::Error;

/// Errors produced by pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The configuration is invalid.
    #[error("invalid pool configuration: {0}")]
    Config(String),

    /// The pool is not running. Outstanding and future checkouts against a
    /// stopped pool all see this error; the caller must obtain a fresh
    /// pool to continue.
    #[error("pool is not running")]
    Closed,

    /// No worker became available within the allotted time. No ownership
    /// was transferred: the caller holds nothing and owes nothing.
    #[error("checkout timed out after {waited:?}")]
    Timeout {
        /// How long the caller waited before giving up.
        waited: Duration,
    },

    /// A worker failed to open its connection.
    #[error(transparent)]
    Connect(#[from] ConnError),
}
