//! Run command: launch, finalize and promote chained as a single pass.

use std::sync::Arc;
use std::time::Duration;

use console::style;

use crate::config::Settings;
use crate::services::{FinalizeService, LaunchService, PromoteService, RunStatus, RunSummary};
use crate::store::StoreContext;

use super::finalize::run_finalize_pass;
use super::helpers::{build_detect, print_summary};
use super::launch::run_launch_pass;
use super::promote::run_promote_pass;
use super::OutputFormat;

pub async fn cmd_run(
    settings: &Arc<Settings>,
    format: OutputFormat,
    daemon: bool,
    interval: Option<u64>,
) -> anyhow::Result<()> {
    let store = StoreContext::from_settings(settings)?;
    let detect = build_detect(settings)?;

    let launch = LaunchService::new(store.clone(), detect.clone(), settings.clone());
    let finalize = FinalizeService::new(store.clone(), detect.clone(), settings.clone());
    let promote = PromoteService::new(store, settings.clone());
    let interval = interval.unwrap_or(settings.runtime.daemon_poll_secs);

    if daemon {
        println!(
            "{} Running in daemon mode (interval: {}s)",
            style("→").cyan(),
            interval
        );
    }

    loop {
        let launch_summary = run_launch_pass(&launch, format, 0).await;
        print_summary(&launch_summary, format)?;

        let finalize_summary = run_finalize_pass(&finalize, format, None, 0).await;
        print_summary(&finalize_summary, format)?;

        let promote_summary = run_promote_pass(&promote, format, false, 0).await;
        print_summary(&promote_summary, format)?;

        let requeued = count_of(&finalize_summary, "batches_requeued");
        let advancing = count_of(&finalize_summary, "pages_remaining");
        let failed = [&launch_summary, &finalize_summary, &promote_summary]
            .iter()
            .any(|s| s.status == RunStatus::Failure);

        if !daemon {
            println!();
            if requeued > 0 {
                println!(
                    "{} {} batches still waiting on detection jobs; run again later",
                    style("!").yellow(),
                    requeued
                );
            }
            if advancing > 0 {
                println!(
                    "{} {} diagrams have pages left; the next run continues them",
                    style("→").dim(),
                    advancing
                );
            }
            if failed {
                anyhow::bail!("one or more passes failed");
            }
            return Ok(());
        }

        println!(
            "{} Sleeping for {}s before next check...",
            style("→").dim(),
            interval
        );
        tokio::time::sleep(Duration::from_secs(interval)).await;
    }
}

fn count_of(summary: &RunSummary, name: &str) -> usize {
    summary.counts.get(name).copied().unwrap_or(0)
}
