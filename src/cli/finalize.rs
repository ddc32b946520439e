//! Finalize command: claim launched batches and commit detection results.

use std::sync::Arc;
use std::time::Duration;

use console::style;
use tokio::sync::mpsc;

use crate::config::Settings;
use crate::services::{FinalizeEvent, FinalizeOptions, FinalizeService, RunSummary};
use crate::store::StoreContext;

use super::helpers::{build_detect, check_failed, print_summary, zero_to_none};
use super::OutputFormat;

pub async fn cmd_finalize(
    settings: &Arc<Settings>,
    format: OutputFormat,
    workers: Option<usize>,
    limit: usize,
    daemon: bool,
    interval: Option<u64>,
) -> anyhow::Result<()> {
    let store = StoreContext::from_settings(settings)?;
    let detect = build_detect(settings)?;
    let service = FinalizeService::new(store, detect, settings.clone());
    let interval = interval.unwrap_or(settings.runtime.daemon_poll_secs);

    if daemon {
        println!(
            "{} Running in daemon mode (interval: {}s)",
            style("→").cyan(),
            interval
        );
    }

    loop {
        let summary = run_finalize_pass(&service, format, workers, limit).await;
        print_summary(&summary, format)?;

        if !daemon {
            return check_failed(&summary);
        }

        println!(
            "{} Sleeping for {}s before next check...",
            style("→").dim(),
            interval
        );
        tokio::time::sleep(Duration::from_secs(interval)).await;
    }
}

/// One finalize pass with its event printer. Also used by the combined
/// `run` command.
pub(super) async fn run_finalize_pass(
    service: &FinalizeService,
    format: OutputFormat,
    workers: Option<usize>,
    limit: usize,
) -> RunSummary {
    let (event_tx, mut event_rx) = mpsc::channel::<FinalizeEvent>(100);
    let show_events = format == OutputFormat::Table;

    // Spawn event handler task (UI layer)
    let event_handler = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if !show_events {
                continue;
            }
            match event {
                FinalizeEvent::Started { workers } => {
                    println!("{} Starting {} finalize workers", style("→").cyan(), workers);
                }
                FinalizeEvent::Claimed {
                    worker_id,
                    diagram_ref,
                } => {
                    println!(
                        "  {} worker {} claimed a batch at {}",
                        style("→").dim(),
                        worker_id,
                        diagram_ref
                    );
                }
                FinalizeEvent::BatchRequeued { diagrams, .. } => {
                    println!(
                        "  {} {} diagrams still waiting on detection jobs",
                        style("!").yellow(),
                        diagrams
                    );
                }
                FinalizeEvent::BatchCommitted {
                    diagrams, edges, ..
                } => {
                    println!(
                        "{} Committed {} diagrams ({} edges)",
                        style("✓").green(),
                        diagrams,
                        edges
                    );
                }
                FinalizeEvent::BatchFailed {
                    diagrams, error, ..
                } => {
                    println!(
                        "  {} batch of {} diagrams: {}",
                        style("✗").red(),
                        diagrams,
                        error
                    );
                }
                FinalizeEvent::CommitConflict { worker_id } => {
                    println!(
                        "  {} worker {} lost a commit race, batch stays queued",
                        style("!").yellow(),
                        worker_id
                    );
                }
                FinalizeEvent::Complete { .. } => {}
            }
        }
    });

    let options = FinalizeOptions {
        workers,
        limit: zero_to_none(limit),
    };
    let summary = service.run(&options, event_tx).await;
    let _ = event_handler.await;
    summary
}
