//! Configuration file handling for ~/.sarlayer/config.ini.
//!
//! Settings structs live in [`super::settings`], constants in
//! [`super::defaults`], parsing in [`super::parser`], and serialization in
//! [`super::writer`].

use std::path::{Path, PathBuf};

use ini::Ini;
use thiserror::Error;

pub use super::defaults::*;
pub use super::settings::*;

use super::{DispatchConfig, MatchConfig, StageRetry, StoreConfig};
use crate::layout::OutputLayout;

/// Configuration file errors.
#[derive(Debug, Error)]
pub enum ConfigFileError {
    /// Failed to read config file
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] ini::Error),

    /// Failed to write config file
    #[error("Failed to write config file: {0}")]
    WriteError(String),

    /// Invalid configuration value
    #[error("Invalid configuration: {section}.{key} = '{value}' - {reason}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
        reason: String,
    },

    /// Failed to create config directory
    #[error("Failed to create config directory: {0}")]
    DirectoryError(std::io::Error),
}

impl ConfigFile {
    /// Load configuration from the default path (~/.sarlayer/config.ini).
    pub fn load() -> Result<Self, ConfigFileError> {
        Self::load_from(&config_file_path())
    }

    /// Load configuration from a specific path.
    ///
    /// If the file doesn't exist, returns defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigFileError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let ini = Ini::load_from_file(path)?;
        super::parser::parse_ini(&ini)
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigFileError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(ConfigFileError::DirectoryError)?;
        }

        let content = self.to_config_string();
        crate::persist::write_atomic(path, content.as_bytes())
            .map_err(|e| ConfigFileError::WriteError(e.to_string()))
    }

    /// Commented INI representation, as written by [`save_to`](Self::save_to).
    pub fn to_config_string(&self) -> String {
        super::writer::to_config_string(self)
    }

    /// Write the default config file at `path` if nothing exists there.
    ///
    /// Returns `true` if a file was written.
    pub fn ensure_exists_at(path: &Path) -> Result<bool, ConfigFileError> {
        if path.exists() {
            return Ok(false);
        }
        Self::default().save_to(path)?;
        Ok(true)
    }

    /// Check cross-field constraints. Violations are fatal at startup.
    pub fn validate(&self) -> Result<(), ConfigFileError> {
        let invalid = |section: &str, key: &str, value: String, reason: &str| {
            Err(ConfigFileError::InvalidValue {
                section: section.to_string(),
                key: key.to_string(),
                value,
                reason: reason.to_string(),
            })
        };

        let m = &self.matching;
        if !(m.coordinate_tolerance.is_finite() && m.coordinate_tolerance > 0.0) {
            return invalid(
                "matching",
                "coordinate_tolerance",
                m.coordinate_tolerance.to_string(),
                "must be greater than zero",
            );
        }
        if !(m.footprint_buffer.is_finite() && m.footprint_buffer >= 0.0) {
            return invalid(
                "matching",
                "footprint_buffer",
                m.footprint_buffer.to_string(),
                "must not be negative",
            );
        }
        if m.date_tolerance_days < 0 {
            return invalid(
                "matching",
                "date_tolerance_days",
                m.date_tolerance_days.to_string(),
                "must not be negative",
            );
        }

        let d = &self.dispatch;
        if d.slots == 0 {
            return invalid("dispatch", "slots", "0".to_string(), "must be at least 1");
        }
        if d.workers == Some(0) {
            return invalid("dispatch", "workers", "0".to_string(), "must be at least 1");
        }
        if d.search_days <= 0 {
            return invalid(
                "dispatch",
                "search_days",
                d.search_days.to_string(),
                "must be greater than zero",
            );
        }
        if d.stage_attempts == 0 {
            return invalid("dispatch", "stage_attempts", "0".to_string(), "must be at least 1");
        }

        if self.registry.max_retries == 0 {
            return invalid("registry", "max_retries", "0".to_string(), "must be at least 1");
        }
        if self.registry.bounds_precision > 12 {
            return invalid(
                "registry",
                "bounds_precision",
                self.registry.bounds_precision.to_string(),
                "must be between 0 and 12",
            );
        }

        Ok(())
    }

    /// Matching thresholds.
    pub fn match_config(&self) -> MatchConfig {
        MatchConfig::new()
            .with_coordinate_tolerance(self.matching.coordinate_tolerance)
            .with_date_tolerance_days(self.matching.date_tolerance_days)
            .with_footprint_buffer(self.matching.footprint_buffer)
            .with_strict_phase(self.matching.strict_phase)
    }

    /// Registry durability parameters.
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig::new()
            .with_max_retries(self.registry.max_retries)
            .with_retry_delay(std::time::Duration::from_millis(self.registry.retry_delay_ms))
            .with_bounds_precision(self.registry.bounds_precision)
    }

    /// Dispatcher concurrency.
    pub fn dispatch_config(&self) -> DispatchConfig {
        let config = DispatchConfig::new()
            .with_slots(self.dispatch.slots)
            .with_search_days(self.dispatch.search_days)
            .with_stage_retry(StageRetry::new(
                self.dispatch.stage_attempts,
                std::time::Duration::from_millis(self.dispatch.stage_backoff_ms),
            ));
        match self.dispatch.workers {
            Some(workers) => config.with_workers(workers),
            None => config,
        }
    }

    /// Layout of the configured output root.
    pub fn output_layout(&self) -> OutputLayout {
        OutputLayout::new(&self.paths.output_dir)
    }
}

/// Get the path to the config directory (~/.sarlayer).
pub fn config_directory() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".sarlayer")
}

/// Get the path to the config file (~/.sarlayer/config.ini).
pub fn config_file_path() -> PathBuf {
    config_directory().join("config.ini")
}
