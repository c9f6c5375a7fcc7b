//! Registry store configuration.

use std::time::Duration;

use super::defaults::{
    DEFAULT_BOUNDS_PRECISION, DEFAULT_LOCK_TIMEOUT_SECS, DEFAULT_MAX_RETRIES,
    DEFAULT_RETRY_DELAY_MS,
};

/// Durability and locking parameters of a registry store.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use sarlayer::config::StoreConfig;
///
/// let config = StoreConfig::new()
///     .with_max_retries(5)
///     .with_retry_delay(Duration::from_millis(200));
/// assert_eq!(config.bounds_precision(), 6);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    max_retries: u32,
    retry_delay: Duration,
    bounds_precision: u32,
    lock_timeout: Duration,
}

impl StoreConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts per update (values below 1 are treated as 1). Default: 3.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Delay between attempts. Default: 1 second.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Decimal places kept for stored chip bounds. Default: 6.
    pub fn with_bounds_precision(mut self, decimals: u32) -> Self {
        self.bounds_precision = decimals;
        self
    }

    /// How long a writer waits for the registry lock. Default: 60 seconds.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn bounds_precision(&self) -> u32 {
        self.bounds_precision
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            bounds_precision: DEFAULT_BOUNDS_PRECISION,
            lock_timeout: Duration::from_secs(DEFAULT_LOCK_TIMEOUT_SECS),
        }
    }
}
