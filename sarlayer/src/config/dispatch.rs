//! Batch dispatch configuration.

use std::time::Duration;

use chrono::TimeDelta;

use super::defaults::{
    DEFAULT_SEARCH_DAYS, DEFAULT_SLOTS, DEFAULT_STAGE_ATTEMPTS, DEFAULT_STAGE_BACKOFF_MAX_SECS,
    DEFAULT_STAGE_BACKOFF_MS,
};

/// Exponential backoff for the acquire and ancillary stages.
///
/// Only transient collaborator failures are retried; see
/// [`CollaboratorError::is_transient`](crate::collaborators::CollaboratorError::is_transient).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageRetry {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
}

impl StageRetry {
    /// `max_attempts` includes the first try; the delay doubles per retry.
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay: Duration::from_secs(DEFAULT_STAGE_BACKOFF_MAX_SECS),
        }
    }

    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `attempt` (1-based), or `None` once the
    /// attempts are used up.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt >= self.max_attempts {
            return None;
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        Some(self.initial_delay.saturating_mul(factor).min(self.max_delay))
    }
}

impl Default for StageRetry {
    fn default() -> Self {
        Self::new(DEFAULT_STAGE_ATTEMPTS, Duration::from_millis(DEFAULT_STAGE_BACKOFF_MS))
    }
}

/// Concurrency and search parameters of the dispatcher.
///
/// `workers` bounds how many requests are in flight at once; `slots` bounds
/// how many of them may be inside the acquire → ancillary → correction
/// section, one per execution slot. Unless set explicitly, `workers` follows
/// `slots`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    slots: usize,
    workers: Option<usize>,
    search_window: TimeDelta,
    stage_retry: StageRetry,
}

impl DispatchConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of execution slots. Default: 2.
    pub fn with_slots(mut self, slots: usize) -> Self {
        self.slots = slots;
        self
    }

    /// Request-level concurrency. Default: same as `slots`.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Half-width of the acquisition search window. Default: 90 days.
    pub fn with_search_days(mut self, days: i64) -> Self {
        self.search_window = TimeDelta::days(days);
        self
    }

    /// Retry policy for acquire and ancillary. Default: 4 attempts, 500 ms
    /// initial backoff.
    pub fn with_stage_retry(mut self, retry: StageRetry) -> Self {
        self.stage_retry = retry;
        self
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn workers(&self) -> usize {
        self.workers.unwrap_or(self.slots)
    }

    pub fn search_window(&self) -> TimeDelta {
        self.search_window
    }

    pub fn stage_retry(&self) -> StageRetry {
        self.stage_retry
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            slots: DEFAULT_SLOTS,
            workers: None,
            search_window: TimeDelta::days(DEFAULT_SEARCH_DAYS),
            stage_retry: StageRetry::default(),
        }
    }
}
