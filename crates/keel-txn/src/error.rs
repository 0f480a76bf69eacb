//! Coordinator error types.

use keel_pool::{Mode, PoolError};
use thiserror::Error;

/// Errors produced by transaction operations.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// No usable connection in this transaction context. Returned after a
    /// disconnect (or a connectivity failure) anywhere in the nested
    /// stack; recovering means starting a fresh outermost transaction.
    #[error("no usable connection in this transaction")]
    NoConnection,

    /// The context is already in the requested mode. Benign and
    /// informational: nothing changed, and nothing needed to.
    #[error("transaction is already in {0} mode")]
    AlreadyInMode(Mode),

    /// The checkout layer failed: pool stopped, checkout timed out, or the
    /// worker could not connect.
    #[error(transparent)]
    Pool(#[from] PoolError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_mode() {
        let err = TransactionError::AlreadyInMode(Mode::Sandbox);
        assert_eq!(err.to_string(), "transaction is already in sandbox mode");
    }

    #[test]
    fn pool_errors_pass_through() {
        let err = TransactionError::from(PoolError::Closed);
        assert_eq!(err.to_string(), "pool is not running");
    }
}
