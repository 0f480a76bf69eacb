//! Pool configuration.

use std::time::Duration;

use crate::error::PoolError;

/// Configuration for a worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of base workers. Base workers live for the lifetime of the
    /// pool and keep their connections warm between checkouts.
    pub size: usize,

    /// Number of additional overflow workers that may exist while demand
    /// exceeds `size`. Overflow workers are created on demand and destroyed
    /// at checkin.
    pub max_overflow: usize,

    /// When true, base workers open their connections on first checkout
    /// instead of at [`Pool::start`](crate::Pool::start).
    pub lazy: bool,

    /// Grace period for closing connections during
    /// [`Pool::stop`](crate::Pool::stop).
    pub shutdown_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 4,
            max_overflow: 0,
            lazy: false,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of base workers.
    #[must_use]
    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Set the overflow allowance.
    #[must_use]
    pub fn max_overflow(mut self, max_overflow: usize) -> Self {
        self.max_overflow = max_overflow;
        self
    }

    /// Defer connection opening to first checkout.
    #[must_use]
    pub fn lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    /// Set the shutdown grace period.
    #[must_use]
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Check the configuration for obvious mistakes.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.size == 0 {
            return Err(PoolError::Config(
                "pool size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_fluent() {
        let config = PoolConfig::new().size(8).max_overflow(2).lazy(true);

        assert_eq!(config.size, 8);
        assert_eq!(config.max_overflow, 2);
        assert!(config.lazy);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_size_rejected() {
        let config = PoolConfig::new().size(0);
        assert!(config.validate().is_err());
    }
}
