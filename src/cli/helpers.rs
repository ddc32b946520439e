//! Shared helper functions for CLI commands.

use std::sync::Arc;
use std::time::Duration;

use console::style;

use crate::config::{BackendKind, Settings};
use crate::detect::{DetectionService, HttpDetectionService, SimDetectionService};
use crate::services::{RunStatus, RunSummary};

use super::OutputFormat;

/// Build the detection client the settings ask for.
pub fn build_detect(settings: &Settings) -> anyhow::Result<Arc<dyn DetectionService>> {
    match settings.detect.backend {
        BackendKind::Memory => Ok(Arc::new(SimDetectionService::new())),
        BackendKind::Http => {
            let service = HttpDetectionService::new(
                &settings.detect.base_url,
                settings.detect.api_token.clone(),
                Duration::from_secs(settings.detect.timeout_secs),
            )?;
            Ok(Arc::new(service))
        }
    }
}

/// Treat the CLI's `0` sentinel as "no limit".
pub fn zero_to_none(limit: usize) -> Option<usize> {
    if limit == 0 {
        None
    } else {
        Some(limit)
    }
}

/// Print a pass summary in the selected format.
pub fn print_summary(summary: &RunSummary, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(summary)?);
        }
        OutputFormat::Table => {
            let status = match summary.status {
                RunStatus::Success => style(summary.status.as_str()).green(),
                RunStatus::Partial => style(summary.status.as_str()).yellow(),
                RunStatus::Failure => style(summary.status.as_str()).red(),
            };

            println!();
            println!(
                "{}",
                style(format!("{} summary", title_case(summary.phase.as_str()))).bold()
            );
            println!("{}", "-".repeat(40));
            println!("{:<20} {}", "Pipeline:", summary.pipeline);
            println!("{:<20} {}", "Status:", status);
            println!("{:<20} {}", "Processed:", summary.processed);
            println!("{:<20} {}ms", "Elapsed:", summary.elapsed_ms);
            for (name, value) in &summary.counts {
                if *value > 0 {
                    println!("{:<20} {}", format!("{}:", name), value);
                }
            }
            if !summary.message.is_empty() {
                println!("{:<20} {}", "Message:", summary.message);
            }
            for failure in &summary.failures {
                println!("  {} {}", style("✗").red(), failure);
            }
        }
    }
    Ok(())
}

/// Nonzero exit for passes that could not do their work at all.
pub fn check_failed(summary: &RunSummary) -> anyhow::Result<()> {
    if summary.status == RunStatus::Failure {
        anyhow::bail!("{} pass failed: {}", summary.phase.as_str(), summary.message);
    }
    Ok(())
}

fn title_case(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
