//! Default values for all configuration settings.
//!
//! Contains the `DEFAULT_*` constants and the `ConfigFile::default()`
//! implementation.

use std::path::PathBuf;

use super::settings::*;

// =============================================================================
// Matching
// =============================================================================

/// Per-component tolerance for exact-chip reuse, in degrees.
pub const DEFAULT_COORDINATE_TOLERANCE: f64 = 0.01;

/// Maximum distance between request date and scene acquisition date.
pub const DEFAULT_DATE_TOLERANCE_DAYS: i64 = 30;

/// Buffer added around a scene footprint for containment reuse, in degrees.
pub const DEFAULT_FOOTPRINT_BUFFER: f64 = 0.1;

// =============================================================================
// Dispatch
// =============================================================================

/// Number of execution slots (accelerators).
pub const DEFAULT_SLOTS: usize = 2;

/// Half-width of the acquisition search window, in days.
pub const DEFAULT_SEARCH_DAYS: i64 = 90;

/// Attempts per acquire/ancillary call (one initial try plus three retries).
pub const DEFAULT_STAGE_ATTEMPTS: u32 = 4;

/// Delay before the first stage retry; doubles on every further retry.
pub const DEFAULT_STAGE_BACKOFF_MS: u64 = 500;

/// Upper bound for a single stage retry delay.
pub const DEFAULT_STAGE_BACKOFF_MAX_SECS: u64 = 30;

// =============================================================================
// Registry
// =============================================================================

/// Attempts per registry update.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Delay between registry update attempts.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// Decimal places kept for stored chip bounds.
pub const DEFAULT_BOUNDS_PRECISION: u32 = 6;

/// How long a writer waits for the registry lock.
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 60;

// =============================================================================
// Raster / paths / logging
// =============================================================================

/// Output kinds whose files must pass the raster structure check.
pub const DEFAULT_RASTER_KINDS: &[&str] = &["vv", "vh", "clipped"];

/// Default output root, relative to the working directory.
pub const DEFAULT_OUTPUT_DIR: &str = "sarlayer-output";

/// Default log filter when `RUST_LOG` is unset.
pub const DEFAULT_LOG_LEVEL: &str = "info";

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            paths: PathsSettings {
                output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
                chip_dir: None,
                label_dir: None,
            },
            matching: MatchingSettings {
                coordinate_tolerance: DEFAULT_COORDINATE_TOLERANCE,
                date_tolerance_days: DEFAULT_DATE_TOLERANCE_DAYS,
                footprint_buffer: DEFAULT_FOOTPRINT_BUFFER,
                strict_phase: false,
            },
            dispatch: DispatchSettings {
                slots: DEFAULT_SLOTS,
                workers: None,
                search_days: DEFAULT_SEARCH_DAYS,
                stage_attempts: DEFAULT_STAGE_ATTEMPTS,
                stage_backoff_ms: DEFAULT_STAGE_BACKOFF_MS,
            },
            registry: RegistrySettings {
                max_retries: DEFAULT_MAX_RETRIES,
                retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
                bounds_precision: DEFAULT_BOUNDS_PRECISION,
                validate_after_run: true,
            },
            raster: RasterSettings {
                raster_kinds: DEFAULT_RASTER_KINDS.iter().map(|s| s.to_string()).collect(),
            },
            collaborators: CollaboratorSettings::default(),
            logging: LoggingSettings {
                level: DEFAULT_LOG_LEVEL.to_string(),
            },
        }
    }
}
