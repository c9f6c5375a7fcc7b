//! CLI runner for common setup.
//!
//! Loads the config file, initializes logging under the output root and
//! builds the library components shared by the commands.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use sarlayer::collaborators::{CommandCollaborators, CommandSet, Collaborators};
use sarlayer::config::{config_file_path, ConfigFile};
use sarlayer::layout::OutputLayout;
use sarlayer::logging::{default_log_file, init_logging_full, LoggingGuard};
use sarlayer::matcher::Matcher;
use sarlayer::registry::RegistryStore;
use sarlayer::validation::FileValidator;

use crate::error::CliError;

/// Load the config file at `path`, or the default location.
///
/// A missing file yields defaults.
pub fn load_config(path: Option<&Path>) -> Result<(PathBuf, ConfigFile), CliError> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(config_file_path);
    let config = ConfigFile::load_from(&path)?;
    Ok((path, config))
}

/// Runner that manages CLI lifecycle and common operations.
pub struct CliRunner {
    /// Logging guard - keeps logging active while runner exists
    #[allow(dead_code)]
    logging_guard: LoggingGuard,
    config: ConfigFile,
    config_path: PathBuf,
}

impl CliRunner {
    /// Validate `config` and start logging to `<output_dir>/logs/`.
    ///
    /// Stdout logging is turned off when a progress bar owns the terminal.
    pub fn new(
        config_path: PathBuf,
        config: ConfigFile,
        stdout_logging: bool,
    ) -> Result<Self, CliError> {
        config.validate()?;

        let logs_dir = config.output_layout().logs_dir();
        let logging_guard = init_logging_full(
            &logs_dir,
            default_log_file(),
            &config.logging.level,
            stdout_logging,
        )
        .map_err(|e| CliError::LoggingInit(e.to_string()))?;

        Ok(Self {
            logging_guard,
            config,
            config_path,
        })
    }

    /// Get the effective configuration.
    pub fn config(&self) -> &ConfigFile {
        &self.config
    }

    /// Layout of the configured output root.
    pub fn layout(&self) -> OutputLayout {
        self.config.output_layout()
    }

    /// Log startup information for a command.
    pub fn log_startup(&self, command: &str) {
        info!("sarlayer v{}", sarlayer::VERSION);
        info!(
            config = %self.config_path.display(),
            output_dir = %self.config.paths.output_dir.display(),
            "sarlayer CLI: {} command",
            command
        );
    }

    /// Registry handle for the output root.
    pub fn store(&self) -> RegistryStore {
        RegistryStore::for_layout(&self.layout(), self.config.store_config())
    }

    /// Matcher with the file validation gate.
    pub fn matcher(&self) -> Matcher {
        let validator =
            FileValidator::with_header_inspector(self.config.raster.raster_kinds.clone());
        Matcher::new(self.config.match_config(), Arc::new(validator))
    }

    /// Subprocess collaborators from the `[collaborators]` section.
    ///
    /// Every stage must have a command.
    pub fn collaborators(&self) -> Result<Collaborators, CliError> {
        let commands = CommandSet::from(&self.config.collaborators);
        let missing = commands.missing_stages();
        if !missing.is_empty() {
            return Err(CliError::MissingCollaborators(missing));
        }
        Ok(Collaborators::from_shared(Arc::new(
            CommandCollaborators::new(commands),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_config_missing_file_gives_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.ini");

        let (loaded_path, config) = load_config(Some(&path)).unwrap();

        assert_eq!(loaded_path, path);
        assert_eq!(config.dispatch.slots, ConfigFile::default().dispatch.slots);
    }

    #[test]
    fn test_load_config_reads_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.ini");
        std::fs::write(&path, "[dispatch]\nslots = 4\n").unwrap();

        let (_, config) = load_config(Some(&path)).unwrap();

        assert_eq!(config.dispatch.slots, 4);
    }
}
