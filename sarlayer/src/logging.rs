//! Logging infrastructure.
//!
//! Structured logging to a file and to stdout:
//! - Writes to `<output_dir>/logs/sarlayer.log` (cleared on session start)
//! - Also prints to stdout for tailing a batch
//! - Filter from `RUST_LOG`, falling back to the configured level

use std::fs;
use std::io;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Guard that must be kept alive for the duration of logging.
///
/// Dropping this guard flushes and closes the log file writer.
pub struct LoggingGuard {
    _file_guard: WorkerGuard,
}

/// Initialize the global subscriber with file and stdout output.
///
/// `default_level` is used when `RUST_LOG` is unset or invalid.
pub fn init_logging(
    log_dir: &Path,
    log_file: &str,
    default_level: &str,
) -> Result<LoggingGuard, io::Error> {
    init_logging_full(log_dir, log_file, default_level, true)
}

/// Initialize the global subscriber.
///
/// Creates `log_dir` if needed, truncates `log_file`, and installs a file
/// layer (no ANSI). A stdout layer is added when `stdout_enabled` is set;
/// the CLI turns it off while a progress bar owns the terminal.
///
/// # Errors
///
/// Returns an error if the directory cannot be created, the log file cannot
/// be cleared, or a global subscriber is already installed.
pub fn init_logging_full(
    log_dir: &Path,
    log_file: &str,
    default_level: &str,
    stdout_enabled: bool,
) -> Result<LoggingGuard, io::Error> {
    fs::create_dir_all(log_dir)?;
    fs::write(log_dir.join(log_file), "")?;

    let file_appender = tracing_appender::rolling::never(log_dir, log_file);
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false);

    let stdout_layer = stdout_enabled.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(io::stdout)
            .with_ansi(true)
            .with_target(false)
            .compact()
    });

    tracing_subscriber::registry()
        .with(env_filter(default_level))
        .with(file_layer)
        .with(stdout_layer)
        .try_init()
        .map_err(io::Error::other)?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Default log file name.
pub fn default_log_file() -> &'static str {
    "sarlayer.log"
}
