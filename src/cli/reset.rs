//! Reset command: push annotation states back to the start of the pipeline.

use std::sync::Arc;
use std::time::Duration;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::cache::bump_epoch;
use crate::config::Settings;
use crate::models::AnnotationState;
use crate::store::{GraphStore, StateFilter, StoreContext};

pub async fn cmd_reset(
    settings: &Arc<Settings>,
    diagram_refs: Vec<String>,
    all: bool,
    confirm: bool,
) -> anyhow::Result<()> {
    if diagram_refs.is_empty() && !all {
        println!(
            "{} Name the diagrams to reset, or pass --all for the whole pipeline.",
            style("!").yellow()
        );
        return Ok(());
    }

    if all && !confirm {
        println!(
            "{} This will reset EVERY annotation state in pipeline '{}'.",
            style("!").yellow(),
            settings.annotation.pipeline
        );
        println!("  In-flight detection jobs will be abandoned and every diagram");
        println!("  will be annotated again from page one.");
        println!("  Use --confirm to proceed.");
        return Ok(());
    }

    let store = StoreContext::from_settings(settings)?;
    let pipeline = &settings.annotation.pipeline;

    let mut targets: Vec<AnnotationState> = Vec::new();
    if all {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .unwrap(),
        );
        pb.enable_steady_tick(Duration::from_millis(100));
        pb.set_message("Collecting annotation states...");

        let filter = StateFilter {
            pipeline: Some(pipeline.clone()),
            ..StateFilter::default()
        };
        let mut cursor: Option<String> = None;
        loop {
            let page = store.graph().list_states(&filter, cursor.as_deref()).await?;
            targets.extend(page.items);
            pb.set_message(format!("Collecting annotation states... {}", targets.len()));
            cursor = page.next_cursor;
            if cursor.is_none() {
                break;
            }
        }
        pb.finish_and_clear();
    } else {
        for diagram_ref in &diagram_refs {
            match store.graph().get_state(diagram_ref, pipeline).await? {
                Some(state) => targets.push(state),
                None => println!(
                    "{} No state for {} in pipeline '{}'",
                    style("!").yellow(),
                    diagram_ref,
                    pipeline
                ),
            }
        }
    }

    let mut reset_count = 0usize;
    for mut state in targets {
        let expected = state.version;
        state.reset();
        match store.graph().put_state(&state, Some(expected)).await {
            Ok(_) => {
                reset_count += 1;
                println!("{} Reset {}", style("✓").green(), state.diagram_ref);
            }
            Err(err) if err.is_conflict() => {
                println!(
                    "{} {} changed underneath the reset, skipped",
                    style("!").yellow(),
                    state.diagram_ref
                );
            }
            Err(err) => return Err(err.into()),
        }
    }

    if reset_count > 0 {
        let epoch = bump_epoch(store.kv(), pipeline).await?;
        println!(
            "{} Reset {} states; cached reference lists invalidated (epoch {})",
            style("✓").green(),
            reset_count,
            epoch
        );
    }

    Ok(())
}
