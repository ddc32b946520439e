//! CLI commands implementation.
//!
//! This module contains the CLI parser and dispatches to command-specific modules.

mod finalize;
mod helpers;
mod launch;
mod promote;
mod reset;
mod run_cmd;
mod status;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use crate::config::{load_settings_with_options, BackendKind, LoadOptions};

/// Output format for command results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable tables
    #[default]
    Table,
    /// Machine-readable JSON
    Json,
}

#[derive(Parser)]
#[command(name = "tagweld")]
#[command(about = "Diagram annotation orchestration for asset graphs")]
#[command(version)]
pub struct Cli {
    /// Config file path (overrides auto-discovery)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Pipeline to operate on (overrides config)
    #[arg(short, long, global = true)]
    pipeline: Option<String>,

    /// Restrict selection to one site
    #[arg(long, global = true)]
    site: Option<String>,

    /// Restrict selection to one unit within a site
    #[arg(long, global = true)]
    unit: Option<String>,

    /// Store and detection backend: memory or http (overrides config)
    #[arg(long, global = true)]
    backend: Option<String>,

    /// Output format for summaries and status
    #[arg(short, long, value_enum, default_value = "table", global = true)]
    format: OutputFormat,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Select labeled diagrams and submit detection jobs
    Launch {
        /// Limit number of diagrams to launch (0 = unlimited)
        #[arg(short, long, default_value = "0")]
        limit: usize,
    },

    /// Claim launched batches and commit finished detection results
    Finalize {
        /// Number of finalize workers (default: from config)
        #[arg(short, long)]
        workers: Option<usize>,
        /// Limit number of batches to claim (0 = unlimited)
        #[arg(short, long, default_value = "0")]
        limit: usize,
        /// Run continuously, checking for new work
        #[arg(long)]
        daemon: bool,
        /// Seconds to wait between checks in daemon mode (default: from config)
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Resolve suggested edges against the asset registry
    Promote {
        /// Report what would change without writing anything
        #[arg(long)]
        dry_run: bool,
        /// Limit number of edges to settle (0 = unlimited)
        #[arg(short, long, default_value = "0")]
        limit: usize,
        /// Run continuously, checking for new work
        #[arg(long)]
        daemon: bool,
        /// Seconds to wait between checks in daemon mode (default: from config)
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Run launch, finalize and promote as a single pass
    Run {
        /// Run continuously, checking for new work
        #[arg(long)]
        daemon: bool,
        /// Seconds to wait between checks in daemon mode (default: from config)
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Show pipeline status
    Status {
        /// Only show states with this status (new, retry, processing,
        /// finalizing, annotated, failed)
        status: Option<String>,
    },

    /// Reset annotation states so their diagrams are picked up again
    Reset {
        /// Diagram refs to reset
        diagram_refs: Vec<String>,
        /// Reset every state in the pipeline
        #[arg(long)]
        all: bool,
        /// Confirm resetting everything
        #[arg(long)]
        confirm: bool,
    },
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let options = LoadOptions {
        config_path: cli.config,
        pipeline: cli.pipeline,
        site: cli.site,
        unit: cli.unit,
    };
    let (mut settings, _config) = load_settings_with_options(options)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    // --backend switches both halves; a memory store with a live
    // detection API is never what anyone wants.
    if let Some(backend) = &cli.backend {
        let kind = BackendKind::parse(backend).map_err(|e| anyhow::anyhow!(e))?;
        settings.store.backend = kind;
        settings.detect.backend = kind;
    }
    settings.validate().map_err(|e| anyhow::anyhow!(e))?;

    let settings = Arc::new(settings);
    let format = cli.format;

    match cli.command {
        Commands::Launch { limit } => launch::cmd_launch(&settings, format, limit).await,
        Commands::Finalize {
            workers,
            limit,
            daemon,
            interval,
        } => finalize::cmd_finalize(&settings, format, workers, limit, daemon, interval).await,
        Commands::Promote {
            dry_run,
            limit,
            daemon,
            interval,
        } => promote::cmd_promote(&settings, format, dry_run, limit, daemon, interval).await,
        Commands::Run { daemon, interval } => {
            run_cmd::cmd_run(&settings, format, daemon, interval).await
        }
        Commands::Status { status } => status::cmd_status(&settings, format, status.as_deref()).await,
        Commands::Reset {
            diagram_refs,
            all,
            confirm,
        } => reset::cmd_reset(&settings, diagram_refs, all, confirm).await,
    }
}
