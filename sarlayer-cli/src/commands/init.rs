//! Init command - write a default configuration file.

use std::path::{Path, PathBuf};

use sarlayer::config::{config_file_path, ConfigFile};

use crate::error::CliError;

/// Run the init command.
pub fn run(path: Option<PathBuf>) -> Result<(), CliError> {
    let path = path.unwrap_or_else(config_file_path);

    if write_default(&path)? {
        println!("Created configuration file: {}", path.display());
    } else {
        println!("Configuration file already exists: {}", path.display());
    }
    println!();
    println!("Set paths.chip_dir, paths.label_dir and the [collaborators] commands,");
    println!("then run 'sarlayer run'.");
    println!("CLI arguments override config file values when specified.");
    Ok(())
}

/// Write the default config at `path` unless a file is already there.
fn write_default(path: &Path) -> Result<bool, CliError> {
    Ok(ConfigFile::ensure_exists_at(path)?)
}
