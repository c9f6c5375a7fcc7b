//! Rebuild command - reconstruct the registry from finalized outputs.

use std::path::PathBuf;

use sarlayer::registry::FilesystemEvidence;

use crate::error::CliError;
use crate::runner::{load_config, CliRunner};

/// Run the rebuild command.
///
/// The existing registry is backed up before it is replaced.
pub fn run(config: Option<PathBuf>, output_dir: Option<PathBuf>) -> Result<(), CliError> {
    let (config_path, mut config) = load_config(config.as_deref())?;
    if let Some(dir) = output_dir {
        config.paths.output_dir = dir;
    }

    let runner = CliRunner::new(config_path, config, false)?;
    runner.log_startup("rebuild");

    let store = runner.store();
    let registry = store.rebuild(&FilesystemEvidence::new(runner.layout()))?;

    println!("Registry rebuilt: {}", store.path().display());
    println!("  Scenes: {}", registry.len());
    println!("  Chips:  {}", registry.chip_count());
    Ok(())
}
