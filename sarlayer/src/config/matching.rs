//! Reuse matching thresholds.

use chrono::TimeDelta;

use super::defaults::{
    DEFAULT_COORDINATE_TOLERANCE, DEFAULT_DATE_TOLERANCE_DAYS, DEFAULT_FOOTPRINT_BUFFER,
};

/// Thresholds used by the matcher.
///
/// # Example
///
/// ```
/// use sarlayer::config::MatchConfig;
///
/// let config = MatchConfig::new()
///     .with_coordinate_tolerance(0.005)
///     .with_date_tolerance_days(10);
/// assert_eq!(config.footprint_buffer(), 0.1);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchConfig {
    coordinate_tolerance: f64,
    date_tolerance: TimeDelta,
    footprint_buffer: f64,
    strict_phase: bool,
}

impl MatchConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-component tolerance for exact-chip reuse (degrees).
    pub fn with_coordinate_tolerance(mut self, tolerance: f64) -> Self {
        self.coordinate_tolerance = tolerance;
        self
    }

    /// Maximum distance between request date and scene date for containment
    /// reuse.
    pub fn with_date_tolerance_days(mut self, days: i64) -> Self {
        self.date_tolerance = TimeDelta::days(days);
        self
    }

    /// Buffer around a scene footprint for containment reuse (degrees).
    pub fn with_footprint_buffer(mut self, buffer: f64) -> Self {
        self.footprint_buffer = buffer;
        self
    }

    /// When set, a request of unknown phase never reuses a scene whose phase
    /// is known.
    pub fn with_strict_phase(mut self, strict: bool) -> Self {
        self.strict_phase = strict;
        self
    }

    pub fn coordinate_tolerance(&self) -> f64 {
        self.coordinate_tolerance
    }

    pub fn date_tolerance(&self) -> TimeDelta {
        self.date_tolerance
    }

    pub fn footprint_buffer(&self) -> f64 {
        self.footprint_buffer
    }

    pub fn strict_phase(&self) -> bool {
        self.strict_phase
    }
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            coordinate_tolerance: DEFAULT_COORDINATE_TOLERANCE,
            date_tolerance: TimeDelta::days(DEFAULT_DATE_TOLERANCE_DAYS),
            footprint_buffer: DEFAULT_FOOTPRINT_BUFFER,
            strict_phase: false,
        }
    }
}
