//! Promote command: resolve suggested edges against the asset registry.

use std::sync::Arc;
use std::time::Duration;

use console::style;
use tokio::sync::mpsc;

use crate::config::Settings;
use crate::services::{PromoteEvent, PromoteOptions, PromoteService, RunSummary};
use crate::store::StoreContext;

use super::helpers::{check_failed, print_summary, zero_to_none};
use super::OutputFormat;

pub async fn cmd_promote(
    settings: &Arc<Settings>,
    format: OutputFormat,
    dry_run: bool,
    limit: usize,
    daemon: bool,
    interval: Option<u64>,
) -> anyhow::Result<()> {
    let store = StoreContext::from_settings(settings)?;
    let service = PromoteService::new(store, settings.clone());
    let interval = interval.unwrap_or(settings.runtime.daemon_poll_secs);

    if daemon {
        println!(
            "{} Running in daemon mode (interval: {}s)",
            style("→").cyan(),
            interval
        );
    }

    loop {
        let summary = run_promote_pass(&service, format, dry_run, limit).await;
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

/// One promote pass with its event printer. Also used by the combined
/// `run` command.
pub(super) async fn run_promote_pass(
    service: &PromoteService,
    format: OutputFormat,
    dry_run: bool,
    limit: usize,
) -> RunSummary {
    let (event_tx, mut event_rx) = mpsc::channel::<PromoteEvent>(100);
    let show_events = format == OutputFormat::Table;

    // Spawn event handler task (UI layer)
    let event_handler = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if !show_events {
                continue;
            }
            match event {
                PromoteEvent::Started { dry_run } => {
                    if dry_run {
                        println!(
                            "{} Dry run: reporting matches without writing",
                            style("→").cyan()
                        );
                    }
                }
                PromoteEvent::EdgePromoted {
                    diagram_ref,
                    text,
                    asset,
                } => {
                    println!(
                        "{} {} '{}' {} {}",
                        style("✓").green(),
                        diagram_ref,
                        text,
                        style("promoted to").dim(),
                        asset
                    );
                }
                PromoteEvent::EdgeRejected { diagram_ref, text } => {
                    println!(
                        "  {} {} '{}' matches nothing, rejected",
                        style("→").dim(),
                        diagram_ref,
                        text
                    );
                }
                PromoteEvent::EdgeAmbiguous {
                    diagram_ref,
                    text,
                    candidates,
                } => {
                    println!(
                        "  {} {} '{}' matches {} assets, left for review",
                        style("!").yellow(),
                        diagram_ref,
                        text,
                        candidates
                    );
                }
                PromoteEvent::Complete { .. } => {}
            }
        }
    });

    let options = PromoteOptions {
        dry_run,
        limit: zero_to_none(limit),
    };
    let summary = service.run(&options, event_tx).await;
    let _ = event_handler.await;
    summary
}
