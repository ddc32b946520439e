//! Launch command: select labeled diagrams and submit detection jobs.

use std::sync::Arc;

use console::style;
use tokio::sync::mpsc;

use crate::config::Settings;
use crate::services::{LaunchEvent, LaunchOptions, LaunchService, RunSummary};
use crate::store::StoreContext;

use super::helpers::{build_detect, check_failed, print_summary, zero_to_none};
use super::OutputFormat;

pub async fn cmd_launch(
    settings: &Arc<Settings>,
    format: OutputFormat,
    limit: usize,
) -> anyhow::Result<()> {
    let store = StoreContext::from_settings(settings)?;
    let detect = build_detect(settings)?;
    let service = LaunchService::new(store, detect, settings.clone());

    let summary = run_launch_pass(&service, format, limit).await;
    print_summary(&summary, format)?;
    check_failed(&summary)
}

/// One launch pass with its event printer. Also used by the combined
/// `run` command.
pub(super) async fn run_launch_pass(
    service: &LaunchService,
    format: OutputFormat,
    limit: usize,
) -> RunSummary {
    let (event_tx, mut event_rx) = mpsc::channel::<LaunchEvent>(100);
    let show_events = format == OutputFormat::Table;

    // Spawn event handler task (UI layer)
    let event_handler = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if !show_events {
                continue;
            }
            match event {
                LaunchEvent::Started { candidates } => {
                    println!(
                        "{} Selected {} diagrams for launch",
                        style("→").cyan(),
                        candidates
                    );
                }
                LaunchEvent::StatesCreated { count } => {
                    println!(
                        "  {} {} newly labeled diagrams entered the pipeline",
                        style("→").dim(),
                        count
                    );
                }
                LaunchEvent::GroupStarted { scope, diagrams } => {
                    println!("  {} {} ({} diagrams)", style("→").dim(), scope, diagrams);
                }
                LaunchEvent::CacheRebuilt {
                    scope,
                    assets,
                    patterns,
                } => {
                    println!(
                        "  {} Rebuilt reference lists for {} ({} assets, {} patterns)",
                        style("↻").cyan(),
                        scope,
                        assets,
                        patterns
                    );
                }
                LaunchEvent::BatchLaunched {
                    scope, diagrams, ..
                } => {
                    println!(
                        "{} Launched {} diagrams for {}",
                        style("✓").green(),
                        diagrams,
                        scope
                    );
                }
                LaunchEvent::BatchLost { scope, diagrams } => {
                    println!(
                        "  {} {} diagrams for {} claimed elsewhere",
                        style("!").yellow(),
                        diagrams,
                        scope
                    );
                }
                LaunchEvent::DiagramFailed { diagram_ref, error } => {
                    println!("  {} {}: {}", style("✗").red(), diagram_ref, error);
                }
                LaunchEvent::GroupFailed { scope, error } => {
                    println!("  {} {}: {}", style("✗").red(), scope, error);
                }
                LaunchEvent::Complete { .. } => {}
            }
        }
    });

    let options = LaunchOptions {
        limit: zero_to_none(limit),
    };
    let summary = service.run(&options, event_tx).await;
    let _ = event_handler.await;
    summary
}
