//! sarlayer CLI - command-line interface
//!
//! Drives reuse-aware SAR processing of optical chips through the sarlayer
//! library: batch runs, registry rebuild and audit, and configuration.

mod commands;
mod error;
mod runner;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use commands::run::RunArgs;

#[derive(Parser)]
#[command(name = "sarlayer")]
#[command(version = sarlayer::VERSION)]
#[command(about = "Reuse-aware SAR processing of optical imagery chips", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process every chip in a directory, reusing registered scenes
    Run {
        /// Config file (default: ~/.sarlayer/config.ini)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Directory of input chips (*.tif, *.tiff)
        #[arg(long)]
        chip_dir: Option<PathBuf>,

        /// Directory of per-chip label JSON
        #[arg(long)]
        label_dir: Option<PathBuf>,

        /// Output root holding the registry and products
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Number of execution slots (accelerators)
        #[arg(long)]
        slots: Option<usize>,

        /// Number of requests processed concurrently (default: slots)
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Rebuild the registry from finalized outputs
    Rebuild {
        /// Config file (default: ~/.sarlayer/config.ini)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Output root holding the registry and products
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },

    /// Report finalized outputs missing from the registry
    Audit {
        /// Config file (default: ~/.sarlayer/config.ini)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Output root holding the registry and products
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },

    /// Write a default configuration file
    Init {
        /// Where to write it (default: ~/.sarlayer/config.ini)
        #[arg(long)]
        path: Option<PathBuf>,
    },

    /// Show the effective configuration
    Config {
        /// Config file (default: ~/.sarlayer/config.ini)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            config,
            chip_dir,
            label_dir,
            output_dir,
            slots,
            workers,
        } => commands::run::run(RunArgs {
            config,
            chip_dir,
            label_dir,
            output_dir,
            slots,
            workers,
        }),
        Commands::Rebuild { config, output_dir } => commands::rebuild::run(config, output_dir),
        Commands::Audit { config, output_dir } => commands::audit::run(config, output_dir),
        Commands::Init { path } => commands::init::run(path),
        Commands::Config { config } => commands::config::run(config),
    };

    if let Err(e) = result {
        e.exit();
    }
}
