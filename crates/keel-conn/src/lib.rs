//! # keel-conn
//!
//! Connection capability contract for the keel database core.
//!
//! The pool and transaction layers never speak a wire protocol themselves.
//! Instead they consume two small traits supplied by an adapter:
//!
//! - [`Connector`] opens physical connections from a set of
//!   [`ConnectOptions`].
//! - [`Connection`] is one live session: it can report liveness, close
//!   gracefully, and enter or leave the sandbox wrapping transaction used
//!   for test isolation.
//!
//! The option bag is deliberately opaque: keel passes it through to the
//! adapter and interprets nothing beyond the connect timeout.
//!
//! ## Example
//!
//! ```rust,ignore
//! use keel_conn::{ConnectOptions, Connector};
//!
//! let opts = ConnectOptions::from_connection_string(
//!     "Host=localhost;Port=5432;Database=app;User Id=app;Password=secret;",
//! )?;
//!
//! let conn = adapter.connect(&opts).await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod error;
pub mod options;

pub use error::ConnError;
pub use options::ConnectOptions;

use async_trait::async_trait;

/// A live physical database session.
///
/// Implementations own whatever transport state the adapter needs. Dropping
/// a connection is the abortive close; [`Connection::close`] is the graceful
/// variant and is best-effort.
#[async_trait]
pub trait Connection: Send + 'static {
    /// Whether the underlying session is still usable.
    ///
    /// This is a cheap local probe (socket state, heartbeat flag), not a
    /// round trip. The pool uses it to detect sessions that died while a
    /// worker held them idle.
    fn is_alive(&self) -> bool;

    /// Close the session gracefully.
    ///
    /// Errors are swallowed by callers; a session that fails to close
    /// cleanly is simply dropped.
    async fn close(&mut self);

    /// Begin the wrapping transaction that backs sandbox mode.
    ///
    /// The transaction is never committed; everything executed on the
    /// session afterwards is rolled back when the sandbox ends.
    async fn begin_sandbox(&mut self) -> Result<(), ConnError>;

    /// Leave the sandbox wrapping transaction, rolling it back.
    async fn rollback_sandbox(&mut self) -> Result<(), ConnError>;
}

/// Opens physical database sessions.
///
/// One connector serves one logical database; the pool calls it whenever a
/// worker needs a fresh session.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// The session type this connector produces.
    type Conn: Connection;

    /// Open a new session.
    ///
    /// Implementations should honor `options.connect_timeout` for the
    /// transport-level dial; the pool additionally bounds the whole call
    /// with the caller's checkout timeout.
    async fn connect(&self, options: &ConnectOptions) -> Result<Self::Conn, ConnError>;
}
