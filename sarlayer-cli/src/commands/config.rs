//! Config command - show the effective configuration.

use std::path::PathBuf;

use crate::error::CliError;
use crate::runner::load_config;

/// Print the config file path and the effective settings.
pub fn run(config: Option<PathBuf>) -> Result<(), CliError> {
    let (path, config) = load_config(config.as_deref())?;

    if path.exists() {
        println!("; Configuration file: {}", path.display());
    } else {
        println!("; Configuration file: {} (not found, using defaults)", path.display());
    }
    if let Err(e) = config.validate() {
        println!("; Warning: {}", e);
    }
    println!();
    print!("{}", config.to_config_string());
    Ok(())
}
