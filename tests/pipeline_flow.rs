//! Pipeline Flow Tests
//!
//! Drives the launch, finalize and promote phases end to end against the
//! in-memory store and simulated detection backend, the same pair the
//! `--backend memory` CLI flag wires up.

use std::sync::Arc;

use tokio::sync::mpsc;

use tagweld::cache::bump_epoch;
use tagweld::config::Settings;
use tagweld::detect::SimDetectionService;
use tagweld::models::{
    AnnotationStatus, AssetKey, BoundingBox, CandidateAsset, DiagramNode, EdgeStatus, EdgeTag,
    ScopeKey,
};
use tagweld::services::{
    FinalizeOptions, FinalizeService, LaunchOptions, LaunchService, PromoteOptions, PromoteService,
    RunSummary,
};
use tagweld::store::{GraphStore, KvTable, MemoryStore, StoreContext};

fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.annotation.pipeline = "pipe-std".to_string();
    settings
}

fn diagram(external_id: &str, pages: u32) -> DiagramNode {
    DiagramNode {
        external_id: external_id.to_string(),
        name: external_id.to_string(),
        site: Some("site-a".to_string()),
        unit: None,
        page_count: pages,
        labels: vec!["needs-annotation".to_string()],
    }
}

fn asset(external_id: &str, name: &str, aliases: &[&str]) -> CandidateAsset {
    CandidateAsset {
        key: AssetKey::new("assets", external_id),
        name: name.to_string(),
        aliases: aliases.iter().map(|a| a.to_string()).collect(),
        scope: ScopeKey::new("site-a", None),
    }
}

fn region(x: f64) -> BoundingBox {
    BoundingBox::new(x, 10.0, x + 20.0, 14.0)
}

fn count(summary: &RunSummary, name: &str) -> usize {
    summary.counts.get(name).copied().unwrap_or(0)
}

/// The three services sharing one store and one detection backend, as
/// the `run` command builds them.
struct Pipeline {
    store: Arc<MemoryStore>,
    detect: Arc<SimDetectionService>,
    launch: LaunchService,
    finalize: FinalizeService,
    promote: PromoteService,
}

impl Pipeline {
    fn new(settings: Settings) -> Self {
        let store = Arc::new(MemoryStore::new());
        let detect = Arc::new(SimDetectionService::new());
        let settings = Arc::new(settings);
        let launch = LaunchService::new(
            StoreContext::from_memory(store.clone()),
            detect.clone(),
            settings.clone(),
        );
        let finalize = FinalizeService::new(
            StoreContext::from_memory(store.clone()),
            detect.clone(),
            settings.clone(),
        );
        let promote = PromoteService::new(StoreContext::from_memory(store.clone()), settings);
        Self {
            store,
            detect,
            launch,
            finalize,
            promote,
        }
    }

    async fn launch_pass(&self) -> RunSummary {
        let (tx, _rx) = mpsc::channel(256);
        self.launch.run(&LaunchOptions::default(), tx).await
    }

    async fn finalize_pass(&self) -> RunSummary {
        let (tx, _rx) = mpsc::channel(256);
        self.finalize.run(&FinalizeOptions::default(), tx).await
    }

    async fn promote_pass(&self, dry_run: bool) -> RunSummary {
        let (tx, _rx) = mpsc::channel(256);
        let options = PromoteOptions {
            dry_run,
            limit: None,
        };
        self.promote.run(&options, tx).await
    }
}

#[tokio::test]
async fn test_labeled_diagram_converges_to_annotated() {
    let pipeline = Pipeline::new(test_settings());
    pipeline.store.seed_diagram(diagram("dwg-1", 1)).await;
    pipeline
        .store
        .seed_assets([asset("a-1", "Pump P-100", &["P-100"])])
        .await;
    // One callout the asset list knows, one only the digit pattern
    // matches.
    pipeline.detect.seed_text("dwg-1", 1, "P-100", region(0.0)).await;
    pipeline.detect.seed_text("dwg-1", 1, "P-999", region(40.0)).await;

    let launch = pipeline.launch_pass().await;
    assert_eq!(count(&launch, "states_created"), 1);
    assert_eq!(count(&launch, "launched"), 1);
    assert_eq!(count(&launch, "batches"), 1);

    let finalize = pipeline.finalize_pass().await;
    assert_eq!(count(&finalize, "batches_committed"), 1);
    assert_eq!(count(&finalize, "annotated"), 1);
    assert_eq!(count(&finalize, "edges_written"), 2);

    let state = pipeline
        .store
        .get_state("dwg-1", "pipe-std")
        .await
        .unwrap()
        .expect("state exists");
    assert_eq!(state.status, AnnotationStatus::Annotated);
    assert_eq!(state.annotated_page_count, 1);
    assert!(state.detect_job_id.is_none());

    let node = pipeline.store.get_diagram("dwg-1").await.unwrap();
    assert!(node.labels.contains(&"annotated".to_string()));
    assert!(!node.labels.contains(&"needs-annotation".to_string()));

    // The known callout resolved straight to the asset; the pattern hit
    // landed on the review node as a suggestion.
    assert_eq!(pipeline.store.edge_count().await, 2);
    let edges = pipeline
        .store
        .list_edges(&Default::default(), None)
        .await
        .unwrap()
        .items;
    let approved = edges.iter().find(|e| e.text == "P-100").unwrap();
    assert_eq!(approved.status, EdgeStatus::Approved);
    assert_eq!(approved.target, AssetKey::new("assets", "a-1"));
    let suggested = edges.iter().find(|e| e.text == "P-999").unwrap();
    assert_eq!(suggested.status, EdgeStatus::Suggested);
    assert_eq!(suggested.target, test_settings().annotation.review_node);

    // Nothing in the graph answers P-999, so promotion rejects it.
    let promote = pipeline.promote_pass(false).await;
    assert_eq!(count(&promote, "rejected"), 1);
    assert_eq!(count(&promote, "promoted"), 0);
    let rejected = pipeline
        .store
        .get_edge(&suggested.external_id)
        .await
        .expect("edge kept");
    assert_eq!(rejected.status, EdgeStatus::Rejected);
}

#[tokio::test]
async fn test_settled_pipeline_is_idle_on_rerun() {
    let pipeline = Pipeline::new(test_settings());
    pipeline.store.seed_diagram(diagram("dwg-1", 1)).await;
    pipeline
        .store
        .seed_assets([asset("a-1", "Pump P-100", &["P-100"])])
        .await;
    pipeline.detect.seed_text("dwg-1", 1, "P-100", region(0.0)).await;

    pipeline.launch_pass().await;
    pipeline.finalize_pass().await;

    // An annotated diagram is out of the queue for every later pass.
    let launch = pipeline.launch_pass().await;
    assert_eq!(launch.processed, 0);
    assert_eq!(count(&launch, "selected"), 0);
    assert_eq!(count(&launch, "states_created"), 0);

    let finalize = pipeline.finalize_pass().await;
    assert_eq!(finalize.processed, 0);
    assert_eq!(count(&finalize, "batches_claimed"), 0);

    assert_eq!(pipeline.store.edge_count().await, 1);
}

#[tokio::test]
async fn test_reference_cache_survives_runs_until_epoch_bump() {
    let pipeline = Pipeline::new(test_settings());
    pipeline
        .store
        .seed_assets([asset("a-1", "Pump P-100", &["P-100"])])
        .await;

    // First run builds the scope's reference lists from the graph.
    pipeline.store.seed_diagram(diagram("dwg-1", 1)).await;
    let first = pipeline.launch_pass().await;
    assert!(count(&first, "cache_misses") > 0);
    assert_eq!(count(&first, "cache_kv_hits"), 0);
    pipeline.finalize_pass().await;

    // A later run over the same scope reads them back from the shared
    // table; the in-run memory tier never carries across runs.
    pipeline.store.seed_diagram(diagram("dwg-2", 1)).await;
    let second = pipeline.launch_pass().await;
    assert_eq!(count(&second, "cache_misses"), 0);
    assert!(count(&second, "cache_kv_hits") > 0);
    pipeline.finalize_pass().await;

    let kv: Arc<dyn KvTable> = pipeline.store.clone();
    bump_epoch(&kv, "pipe-std").await.unwrap();

    pipeline.store.seed_diagram(diagram("dwg-3", 1)).await;
    let third = pipeline.launch_pass().await;
    assert!(count(&third, "cache_misses") > 0);
    assert_eq!(count(&third, "cache_kv_hits"), 0);
}

#[tokio::test]
async fn test_promotion_heals_a_stale_reference_cache() {
    let pipeline = Pipeline::new(test_settings());
    pipeline
        .store
        .seed_assets([asset("a-1", "Pump P-100", &["P-100"])])
        .await;

    // Prime the scope's cached reference lists before a-2 exists.
    pipeline.store.seed_diagram(diagram("dwg-1", 1)).await;
    pipeline.launch_pass().await;
    pipeline.finalize_pass().await;

    pipeline
        .store
        .seed_assets([asset("a-2", "Pump P-200", &["P-200"])])
        .await;
    pipeline.store.seed_diagram(diagram("dwg-2", 1)).await;
    pipeline.detect.seed_text("dwg-2", 1, "P-200", region(0.0)).await;

    // The stale asset list misses a-2, but the digit pattern still
    // catches the callout and parks it on the review node.
    let launch = pipeline.launch_pass().await;
    assert!(count(&launch, "cache_kv_hits") > 0);
    let finalize = pipeline.finalize_pass().await;
    assert_eq!(count(&finalize, "edges_written"), 1);

    let edges = pipeline
        .store
        .list_edges(&Default::default(), None)
        .await
        .unwrap()
        .items;
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].status, EdgeStatus::Suggested);

    // Promotion asks the graph directly and finds the new asset.
    let promote = pipeline.promote_pass(false).await;
    assert_eq!(count(&promote, "promoted"), 1);
    assert_eq!(count(&promote, "alias_lookups"), 1);

    let healed = pipeline
        .store
        .get_edge(&edges[0].external_id)
        .await
        .expect("edge kept");
    assert_eq!(healed.status, EdgeStatus::Approved);
    assert_eq!(healed.target, AssetKey::new("assets", "a-2"));
    assert!(healed.has_tag(EdgeTag::PromotedAuto));
    assert!(healed.has_tag(EdgeTag::PromoteAttempted));
}

#[tokio::test]
async fn test_large_diagram_advances_window_by_window() {
    let pipeline = Pipeline::new(test_settings());
    pipeline.store.seed_diagram(diagram("dwg-1", 60)).await;
    pipeline
        .store
        .seed_assets([asset("a-1", "Pump P-100", &["P-100"])])
        .await;
    pipeline.detect.seed_text("dwg-1", 1, "P-100", region(0.0)).await;
    pipeline.detect.seed_text("dwg-1", 55, "P-100", region(0.0)).await;

    // First pass covers pages 1-50 and leaves the diagram queued.
    pipeline.launch_pass().await;
    let first = pipeline.finalize_pass().await;
    assert_eq!(count(&first, "pages_remaining"), 1);
    assert_eq!(count(&first, "annotated"), 0);
    assert_eq!(count(&first, "edges_written"), 1);

    let state = pipeline
        .store
        .get_state("dwg-1", "pipe-std")
        .await
        .unwrap()
        .expect("state exists");
    assert_eq!(state.status, AnnotationStatus::New);
    assert_eq!(state.annotated_page_count, 50);

    let node = pipeline.store.get_diagram("dwg-1").await.unwrap();
    assert!(node.labels.contains(&"needs-annotation".to_string()));

    // Second pass picks up at page 51, finds the far callout and
    // finishes the diagram.
    let relaunch = pipeline.launch_pass().await;
    assert_eq!(count(&relaunch, "states_created"), 0);
    assert_eq!(count(&relaunch, "launched"), 1);
    let second = pipeline.finalize_pass().await;
    assert_eq!(count(&second, "annotated"), 1);
    assert_eq!(count(&second, "edges_written"), 1);

    let state = pipeline
        .store
        .get_state("dwg-1", "pipe-std")
        .await
        .unwrap()
        .expect("state exists");
    assert_eq!(state.status, AnnotationStatus::Annotated);
    assert_eq!(state.annotated_page_count, 60);

    let node = pipeline.store.get_diagram("dwg-1").await.unwrap();
    assert!(node.labels.contains(&"annotated".to_string()));
    assert!(!node.labels.contains(&"needs-annotation".to_string()));
    assert_eq!(pipeline.store.edge_count().await, 2);
}

#[tokio::test]
async fn test_slow_jobs_requeue_until_they_finish() {
    let pipeline = Pipeline::new(test_settings());
    pipeline.store.seed_diagram(diagram("dwg-1", 1)).await;
    pipeline
        .store
        .seed_assets([asset("a-1", "Pump P-100", &["P-100"])])
        .await;
    pipeline.detect.seed_text("dwg-1", 1, "P-100", region(0.0)).await;
    pipeline.detect.hold_submissions().await;

    pipeline.launch_pass().await;

    // Jobs are still queued on the backend: the batch goes back in the
    // finalize queue untouched.
    let waiting = pipeline.finalize_pass().await;
    assert_eq!(count(&waiting, "batches_requeued"), 1);
    assert_eq!(count(&waiting, "batches_committed"), 0);

    let state = pipeline
        .store
        .get_state("dwg-1", "pipe-std")
        .await
        .unwrap()
        .expect("state exists");
    assert_eq!(state.status, AnnotationStatus::Processing);
    assert!(state.job_pair().is_some());

    pipeline.detect.release_jobs().await;

    let done = pipeline.finalize_pass().await;
    assert_eq!(count(&done, "batches_committed"), 1);
    assert_eq!(count(&done, "annotated"), 1);
    assert_eq!(pipeline.store.edge_count().await, 1);
}

#[tokio::test]
async fn test_reset_reruns_a_diagram_without_duplicating_edges() {
    let pipeline = Pipeline::new(test_settings());
    pipeline.store.seed_diagram(diagram("dwg-1", 1)).await;
    pipeline
        .store
        .seed_assets([asset("a-1", "Pump P-100", &["P-100"])])
        .await;
    pipeline.detect.seed_text("dwg-1", 1, "P-100", region(0.0)).await;

    pipeline.launch_pass().await;
    pipeline.finalize_pass().await;
    assert_eq!(pipeline.store.edge_count().await, 1);

    // Operator reset: back to page zero, next generation.
    let mut state = pipeline
        .store
        .get_state("dwg-1", "pipe-std")
        .await
        .unwrap()
        .expect("state exists");
    let expected = state.version;
    state.reset();
    pipeline.store.put_state(&state, Some(expected)).await.unwrap();

    // Selection goes by state status, so the swapped labels do not
    // keep the diagram out of the queue.
    let relaunch = pipeline.launch_pass().await;
    assert_eq!(count(&relaunch, "states_created"), 0);
    assert_eq!(count(&relaunch, "selected"), 1);
    assert_eq!(count(&relaunch, "launched"), 1);

    let rerun = pipeline.finalize_pass().await;
    assert_eq!(count(&rerun, "annotated"), 1);

    // The callout hashes to the same edge identity, so the rerun
    // updates in place.
    assert_eq!(pipeline.store.edge_count().await, 1);

    let state = pipeline
        .store
        .get_state("dwg-1", "pipe-std")
        .await
        .unwrap()
        .expect("state exists");
    assert_eq!(state.status, AnnotationStatus::Annotated);
    assert_eq!(state.generation, 1);
    assert_eq!(state.attempt_count, 1);

    let node = pipeline.store.get_diagram("dwg-1").await.unwrap();
    assert_eq!(node.labels, vec!["annotated".to_string()]);
}
