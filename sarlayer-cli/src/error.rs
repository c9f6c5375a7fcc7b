//! CLI error handling with user-friendly messages.
//!
//! Centralizes error handling for the CLI, providing consistent formatting
//! and appropriate exit codes.

use std::fmt;
use std::process;

use sarlayer::collaborators::Stage;
use sarlayer::config::ConfigFileError;
use sarlayer::dispatch::{DispatchError, InputError};
use sarlayer::registry::RegistryError;

/// CLI-specific errors with user-friendly messages.
#[derive(Debug)]
pub enum CliError {
    /// Failed to initialize logging
    LoggingInit(String),
    /// Configuration error
    Config(String),
    /// Config file could not be read, written or validated
    ConfigFile(ConfigFileError),
    /// External commands missing for some stages
    MissingCollaborators(Vec<Stage>),
    /// Chip or label discovery failed
    Input(InputError),
    /// Dispatcher rejected its configuration
    Dispatch(DispatchError),
    /// Registry operation failed
    Registry(RegistryError),
    /// Async runtime could not be started
    Runtime(std::io::Error),
}

impl CliError {
    /// Exit the process with an appropriate error message and code.
    pub fn exit(&self) -> ! {
        eprintln!("Error: {}", self);

        match self {
            CliError::MissingCollaborators(_) => {
                eprintln!();
                eprintln!("Each processing stage runs an external command. Set them in the");
                eprintln!("[collaborators] section of config.ini:");
                eprintln!("  acquire, ancillary, correction, clip");
                eprintln!();
                eprintln!("Run 'sarlayer init' to create a config file with every key listed.");
            }
            CliError::ConfigFile(ConfigFileError::InvalidValue { .. }) => {
                eprintln!();
                eprintln!("Run 'sarlayer config' to see the effective settings.");
            }
            CliError::Input(_) => {
                eprintln!();
                eprintln!("Check paths.chip_dir and paths.label_dir (or --chip-dir/--label-dir).");
            }
            _ => {}
        }

        process::exit(1)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::LoggingInit(msg) => write!(f, "Failed to initialize logging: {}", msg),
            CliError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CliError::ConfigFile(e) => write!(f, "{}", e),
            CliError::MissingCollaborators(stages) => {
                let names: Vec<&str> = stages.iter().map(Stage::as_str).collect();
                write!(f, "No command configured for: {}", names.join(", "))
            }
            CliError::Input(e) => write!(f, "Failed to read inputs: {}", e),
            CliError::Dispatch(e) => write!(f, "Failed to start dispatcher: {}", e),
            CliError::Registry(e) => write!(f, "Registry error: {}", e),
            CliError::Runtime(e) => write!(f, "Failed to start async runtime: {}", e),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::ConfigFile(e) => Some(e),
            CliError::Input(e) => Some(e),
            CliError::Dispatch(e) => Some(e),
            CliError::Registry(e) => Some(e),
            CliError::Runtime(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigFileError> for CliError {
    fn from(e: ConfigFileError) -> Self {
        CliError::ConfigFile(e)
    }
}

impl From<InputError> for CliError {
    fn from(e: InputError) -> Self {
        CliError::Input(e)
    }
}

impl From<DispatchError> for CliError {
    fn from(e: DispatchError) -> Self {
        CliError::Dispatch(e)
    }
}

impl From<RegistryError> for CliError {
    fn from(e: RegistryError) -> Self {
        CliError::Registry(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_collaborators_lists_stages() {
        let err = CliError::MissingCollaborators(vec![Stage::Acquire, Stage::Clip]);
        assert_eq!(err.to_string(), "No command configured for: acquire, clip");
    }

    #[test]
    fn test_config_file_error_keeps_source() {
        let err: CliError = ConfigFileError::InvalidValue {
            section: "dispatch".to_string(),
            key: "slots".to_string(),
            value: "0".to_string(),
            reason: "must be at least 1".to_string(),
        }
        .into();
        assert!(err.to_string().contains("dispatch.slots"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
