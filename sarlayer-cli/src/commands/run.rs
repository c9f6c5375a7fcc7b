//! Run command - process every chip of a directory.

use std::path::PathBuf;
use std::time::Duration;

use console::{style, Term};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::info;

use sarlayer::config::ConfigFile;
use sarlayer::dispatch::{discover_requests, BatchReport, Dispatcher, Outcome};
use sarlayer::registry::AuditReport;

use super::audit::print_audit;
use crate::error::CliError;
use crate::runner::{load_config, CliRunner};

/// Failed requests listed individually in the summary.
const MAX_LISTED_FAILURES: usize = 20;

/// Arguments for the run command.
#[derive(Debug, Default)]
pub struct RunArgs {
    pub config: Option<PathBuf>,
    pub chip_dir: Option<PathBuf>,
    pub label_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub slots: Option<usize>,
    pub workers: Option<usize>,
}

impl RunArgs {
    /// CLI arguments take precedence over config file values.
    fn apply_to(&self, config: &mut ConfigFile) {
        if let Some(dir) = &self.output_dir {
            config.paths.output_dir = dir.clone();
        }
        if let Some(dir) = &self.chip_dir {
            config.paths.chip_dir = Some(dir.clone());
        }
        if let Some(dir) = &self.label_dir {
            config.paths.label_dir = Some(dir.clone());
        }
        if let Some(slots) = self.slots {
            config.dispatch.slots = slots;
        }
        if let Some(workers) = self.workers {
            config.dispatch.workers = Some(workers);
        }
    }
}

/// Run the run command.
pub fn run(args: RunArgs) -> Result<(), CliError> {
    let (config_path, mut config) = load_config(args.config.as_deref())?;
    args.apply_to(&mut config);

    let chip_dir = config.paths.chip_dir.clone().ok_or_else(|| {
        CliError::Config(
            "No chip directory configured. Set paths.chip_dir in config.ini or use --chip-dir"
                .to_string(),
        )
    })?;
    let label_dir = config.paths.label_dir.clone().ok_or_else(|| {
        CliError::Config(
            "No label directory configured. Set paths.label_dir in config.ini or use --label-dir"
                .to_string(),
        )
    })?;

    let interactive = Term::stdout().is_term();
    let runner = CliRunner::new(config_path, config, !interactive)?;
    runner.log_startup("run");

    let collaborators = runner.collaborators()?;
    let requests = discover_requests(&chip_dir, &label_dir)?;
    if requests.is_empty() {
        println!("No chips found in {}", chip_dir.display());
        return Ok(());
    }

    let dispatcher = Dispatcher::new(
        runner.store(),
        runner.matcher(),
        collaborators,
        runner.config().dispatch_config(),
    )?;

    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        eprintln!();
        eprintln!("Received interrupt, finishing in-flight requests...");
        handler_token.cancel();
    })
    .map_err(|e| CliError::Config(format!("Failed to set signal handler: {}", e)))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(CliError::Runtime)?;

    println!(
        "Processing {} chips ({} slots, {} workers)",
        requests.len(),
        dispatcher.config().slots(),
        dispatcher.config().workers()
    );

    let progress = progress_bar(requests.len() as u64, interactive);
    let report = runtime.block_on(dispatcher.run_batch_with_progress(
        requests,
        cancel,
        |job| {
            progress.set_message(format!("{} {}", job.request_id, job.outcome.label()));
            progress.inc(1);
        },
    ));
    progress.finish_and_clear();

    print_report(&report);
    println!("Summary: {}", dispatcher.layout().summary_path().display());

    if runner.config().registry.validate_after_run {
        let audit: AuditReport = dispatcher.store().validate_registry()?;
        println!();
        print_audit(&audit);
    }

    info!(
        completed = report.completed,
        reused = report.reused,
        failed = report.failed,
        "Batch finished"
    );
    Ok(())
}

fn progress_bar(len: u64, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(len);
    let style = ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {wide_msg}",
    )
    .map(|s| s.progress_chars("=> "))
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    bar.set_style(style);
    bar.enable_steady_tick(Duration::from_millis(200));
    bar
}

fn print_report(report: &BatchReport) {
    println!();
    println!("Batch Summary");
    println!("=============");
    println!("  Total:     {}", report.total_requests);
    println!("  Completed: {}", style(report.completed).green());
    println!("  Reused:    {}", style(report.reused).cyan());
    if report.failed > 0 {
        println!("  Failed:    {}", style(report.failed).red());
    } else {
        println!("  Failed:    0");
    }

    let failures: Vec<_> = report
        .jobs
        .iter()
        .filter_map(|job| match &job.outcome {
            Outcome::Failed { reason } => Some((&job.request_id, reason)),
            _ => None,
        })
        .collect();
    if failures.is_empty() {
        return;
    }

    println!();
    println!("Failed requests:");
    for (request_id, reason) in failures.iter().take(MAX_LISTED_FAILURES) {
        println!("  {} - {}", request_id, reason);
    }
    if failures.len() > MAX_LISTED_FAILURES {
        println!("  ... and {} more", failures.len() - MAX_LISTED_FAILURES);
    }
}
