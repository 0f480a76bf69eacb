//! Connection options.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::ConnError;

/// Configuration bag handed to a [`Connector`](crate::Connector).
///
/// keel treats this as opaque: only `connect_timeout` is read by the core.
/// Everything else, including the free-form `params` map, is for the
/// adapter. Unrecognized connection-string keys land in `params` instead of
/// being rejected, so adapter-specific options round-trip untouched.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Server hostname or IP address.
    pub host: String,

    /// Server port.
    pub port: u16,

    /// Database name.
    pub database: Option<String>,

    /// Login user.
    pub username: String,

    /// Login password.
    pub password: String,

    /// Adapter-specific options not interpreted by the core.
    pub params: BTreeMap<String, String>,

    /// Transport-level dial timeout.
    pub connect_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: None,
            username: String::new(),
            password: String::new(),
            params: BTreeMap::new(),
            connect_timeout: Duration::from_secs(15),
        }
    }
}

impl ConnectOptions {
    /// Create options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a `Key=Value;` connection string.
    ///
    /// ```text
    /// Host=db.internal;Port=5433;Database=app;User Id=app;Password=secret;
    /// ```
    ///
    /// Recognized keys (case-insensitive): `host`/`server`, `port`,
    /// `database`, `user id`/`user`/`uid`, `password`/`pwd`,
    /// `connect timeout`/`timeout` (seconds). Anything else is preserved in
    /// [`ConnectOptions::params`].
    pub fn from_connection_string(conn_str: &str) -> Result<Self, ConnError> {
        let mut opts = Self::default();

        for part in conn_str.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| ConnError::Options(format!("invalid key-value: {part}")))?;

            let key = key.trim().to_lowercase();
            let value = value.trim();

            match key.as_str() {
                "host" | "server" => {
                    // Accept host,port in one key for parity with ADO-style
                    // connection strings.
                    if let Some((host, port)) = value.split_once(',') {
                        opts.host = host.to_string();
                        opts.port = port
                            .parse()
                            .map_err(|_| ConnError::Options(format!("invalid port: {port}")))?;
                    } else {
                        opts.host = value.to_string();
                    }
                }
                "port" => {
                    opts.port = value
                        .parse()
                        .map_err(|_| ConnError::Options(format!("invalid port: {value}")))?;
                }
                "database" => {
                    opts.database = Some(value.to_string());
                }
                "user id" | "user" | "uid" => {
                    opts.username = value.to_string();
                }
                "password" | "pwd" => {
                    opts.password = value.to_string();
                }
                "connect timeout" | "timeout" => {
                    let secs: u64 = value
                        .parse()
                        .map_err(|_| ConnError::Options(format!("invalid timeout: {value}")))?;
                    opts.connect_timeout = Duration::from_secs(secs);
                }
                _ => {
                    opts.params.insert(key, value.to_string());
                }
            }
        }

        Ok(opts)
    }

    /// Set the server host.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the server port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the database name.
    #[must_use]
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set the login user.
    #[must_use]
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    /// Set the login password.
    #[must_use]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    /// Set an adapter-specific parameter.
    #[must_use]
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Set the transport-level dial timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Check the options for obvious mistakes.
    pub fn validate(&self) -> Result<(), ConnError> {
        if self.host.is_empty() {
            return Err(ConnError::Options("host must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(ConnError::Options("port must not be zero".to_string()));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConnError::Options(
                "connect_timeout must not be zero".to_string(),
            ));
        }
        Ok(())
    }
}

// Manual Debug so the password never reaches logs.
impl std::fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"***")
            .field("params", &self.params)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}
