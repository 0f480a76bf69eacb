//! Connection-level error types.

use std::time::Duration;

use thiserror::Error;

/// Errors produced while opening or instructing a physical connection.
#[derive(Debug, Error)]
pub enum ConnError {
    /// The connect attempt did not finish within the allotted time.
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    /// The server refused the connection or rejected the credentials.
    #[error("connection refused: {0}")]
    Refused(String),

    /// The option bag is malformed or incomplete.
    #[error("invalid connection options: {0}")]
    Options(String),

    /// The session is gone; the instruction could not be delivered.
    #[error("connection closed")]
    Closed,

    /// Transport-level IO failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConnError {
    /// Whether the error indicates the session itself is unusable, as
    /// opposed to a failure to establish one.
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Closed | Self::Io(_))
    }
}
