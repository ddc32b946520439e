//! Status command: pipeline health at a glance.

use std::collections::BTreeMap;
use std::sync::Arc;

use console::style;
use serde_json::json;

use crate::config::Settings;
use crate::models::AnnotationStatus;
use crate::store::{GraphStore, StateFilter, StoreContext};

use super::OutputFormat;

pub async fn cmd_status(
    settings: &Arc<Settings>,
    format: OutputFormat,
    status: Option<&str>,
) -> anyhow::Result<()> {
    let only = match status {
        Some(raw) => match AnnotationStatus::from_str(raw) {
            Some(parsed) => Some(parsed),
            None => anyhow::bail!(
                "unknown status '{}' (expected new, retry, processing, finalizing, annotated or failed)",
                raw
            ),
        },
        None => None,
    };

    let store = StoreContext::from_settings(settings)?;
    if let Err(err) = store.test_connection().await {
        println!("{} Store unreachable: {}", style("!").yellow(), err);
        return Ok(());
    }

    let pipeline = &settings.annotation.pipeline;
    let filter = StateFilter {
        pipeline: Some(pipeline.clone()),
        statuses: only.into_iter().collect(),
        diagram_ref: None,
    };

    let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    let mut in_flight: Vec<(String, u32)> = Vec::new();
    let mut failed: Vec<(String, String)> = Vec::new();
    let mut total = 0usize;
    let mut active = 0usize;
    let mut cursor: Option<String> = None;

    loop {
        let page = store.graph().list_states(&filter, cursor.as_deref()).await?;
        for state in &page.items {
            total += 1;
            *counts.entry(state.status.as_str()).or_insert(0) += 1;
            if !state.status.is_terminal() {
                active += 1;
            }
            if state.status.is_claimable() {
                in_flight.push((state.diagram_ref.clone(), state.attempt_count));
            } else if state.status == AnnotationStatus::Failed {
                failed.push((
                    state.diagram_ref.clone(),
                    state.message.clone().unwrap_or_default(),
                ));
            }
        }
        cursor = page.next_cursor;
        if cursor.is_none() {
            break;
        }
    }

    if format == OutputFormat::Json {
        let payload = json!({
            "pipeline": pipeline,
            "store_backend": settings.store.backend.as_str(),
            "detect_backend": settings.detect.backend.as_str(),
            "total_states": total,
            "active_states": active,
            "states": counts,
            "in_flight": in_flight
                .iter()
                .map(|(diagram_ref, attempt)| json!({
                    "diagram_ref": diagram_ref,
                    "attempt": attempt,
                }))
                .collect::<Vec<_>>(),
            "failed": failed
                .iter()
                .map(|(diagram_ref, message)| json!({
                    "diagram_ref": diagram_ref,
                    "message": message,
                }))
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    println!("\n{}", style("Tagweld Status").bold());
    println!("{}", "-".repeat(40));
    println!("{:<20} {}", "Pipeline:", pipeline);
    println!(
        "{:<20} {} ({})",
        "Store:",
        settings.store.backend.as_str(),
        settings.store.base_url
    );
    println!(
        "{:<20} {} ({})",
        "Detection:",
        settings.detect.backend.as_str(),
        settings.detect.base_url
    );
    println!("{:<20} {}", "Total States:", total);
    println!("{:<20} {}", "Active:", active);

    for status in [
        AnnotationStatus::New,
        AnnotationStatus::Retry,
        AnnotationStatus::Processing,
        AnnotationStatus::Finalizing,
        AnnotationStatus::Annotated,
        AnnotationStatus::Failed,
    ] {
        if let Some(&count) = counts.get(status.as_str()) {
            if count > 0 {
                println!("{:<20} {}", format!("  {}:", status.as_str()), count);
            }
        }
    }

    if !in_flight.is_empty() {
        println!("\n{}", style("In Flight").bold());
        println!("{}", "-".repeat(40));
        for (diagram_ref, attempt) in &in_flight {
            println!(
                "  {} {} (attempt {})",
                style("→").dim(),
                diagram_ref,
                attempt
            );
        }
    }

    if !failed.is_empty() {
        println!("\n{}", style("Failed").bold());
        println!("{}", "-".repeat(40));
        for (diagram_ref, message) in failed.iter().take(10) {
            println!("  {} {}: {}", style("✗").red(), diagram_ref, message);
        }
        if failed.len() > 10 {
            println!("  {} ... and {} more", style("→").dim(), failed.len() - 10);
        }
    }

    Ok(())
}
