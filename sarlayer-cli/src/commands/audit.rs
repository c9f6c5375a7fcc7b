//! Audit command - compare `final/` against the registry.

use std::path::PathBuf;

use console::style;

use sarlayer::registry::AuditReport;

use crate::error::CliError;
use crate::runner::{load_config, CliRunner};

/// Run the audit command.
pub fn run(config: Option<PathBuf>, output_dir: Option<PathBuf>) -> Result<(), CliError> {
    let (config_path, mut config) = load_config(config.as_deref())?;
    if let Some(dir) = output_dir {
        config.paths.output_dir = dir;
    }

    let runner = CliRunner::new(config_path, config, false)?;
    runner.log_startup("audit");

    let report = runner.store().validate_registry()?;
    print_audit(&report);
    Ok(())
}

/// Print an audit report.
pub fn print_audit(report: &AuditReport) {
    if report.is_clean() {
        println!(
            "{} All {} finalized outputs are registered",
            style("✓").green(),
            report.finalized
        );
        return;
    }

    println!(
        "{} {} of {} finalized outputs are not registered:",
        style("!").yellow(),
        report.unregistered.len(),
        report.finalized
    );
    for path in &report.unregistered {
        println!("  {}", path.display());
    }
    println!();
    println!("Run 'sarlayer rebuild' to reconstruct the registry from finalized outputs.");
}
