//! Settings structs for all configuration sections.
//!
//! Each struct represents one `[section]` of the INI config file.
//! These are pure data types with no parsing or serialization logic.

use std::path::PathBuf;

/// Complete application configuration loaded from config.ini.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigFile {
    /// Input and output locations
    pub paths: PathsSettings,
    /// Reuse matching thresholds
    pub matching: MatchingSettings,
    /// Batch concurrency
    pub dispatch: DispatchSettings,
    /// Registry durability
    pub registry: RegistrySettings,
    /// Output validation
    pub raster: RasterSettings,
    /// External command collaborators
    pub collaborators: CollaboratorSettings,
    /// Logging
    pub logging: LoggingSettings,
}

/// `[paths]`
#[derive(Debug, Clone, PartialEq)]
pub struct PathsSettings {
    /// Output root holding the registry and all products.
    pub output_dir: PathBuf,
    /// Directory of input optical chips.
    pub chip_dir: Option<PathBuf>,
    /// Directory of per-chip label JSON.
    pub label_dir: Option<PathBuf>,
}

/// `[matching]`
#[derive(Debug, Clone, PartialEq)]
pub struct MatchingSettings {
    pub coordinate_tolerance: f64,
    pub date_tolerance_days: i64,
    pub footprint_buffer: f64,
    /// Treat requests of unknown phase as conflicting with phased scenes.
    pub strict_phase: bool,
}

/// `[dispatch]`
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchSettings {
    pub slots: usize,
    /// Request-level concurrency; `None` means one worker per slot.
    pub workers: Option<usize>,
    pub search_days: i64,
    /// Attempts per acquire/ancillary call, including the first.
    pub stage_attempts: u32,
    pub stage_backoff_ms: u64,
}

/// `[registry]`
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrySettings {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub bounds_precision: u32,
    /// Run the finalized-output audit after each batch.
    pub validate_after_run: bool,
}

/// `[raster]`
#[derive(Debug, Clone, PartialEq)]
pub struct RasterSettings {
    pub raster_kinds: Vec<String>,
}

/// `[collaborators]`: shell commands for each processing stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollaboratorSettings {
    pub acquire: Option<String>,
    pub ancillary: Option<String>,
    pub correction: Option<String>,
    pub clip: Option<String>,
}

/// `[logging]`
#[derive(Debug, Clone, PartialEq)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
}
