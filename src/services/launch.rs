//! Launch coordinator.
//!
//! One pass over the pipeline's launch queue: create states for
//! diagrams newly carrying the review label, select everything in
//! `New`/`Retry`, group by site/unit scope, build per-scope candidate
//! and pattern lists through the cache, submit paired detection jobs
//! per diagram batch and claim each batch with one conditional write.
//! A group that fails stays in the queue for the next pass; a batch
//! another worker claims first is skipped without fuss.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cache::{self, ScopedCache};
use crate::config::Settings;
use crate::detect::{
    DetectPayload, DetectRequest, DetectionService, DiagramWindow, PageRange, SearchTarget,
};
use crate::models::{AnnotationState, AnnotationStatus, CandidateAsset, DiagramNode, ScopeKey};
use crate::store::{
    tables, BatchCommit, CommitItem, DiagramFilter, GraphStore, StateFilter, StoreContext,
};
use crate::text::patterns::{generate_patterns, merge_patterns, PatternOverrides};

use super::{Phase, RunSummary};

/// Events emitted during a launch pass.
/// Fields are populated when events are created, even if consumers don't read all of them.
#[derive(Debug, Clone)]
#[allow(dead_code)]
pub enum LaunchEvent {
    /// Selection finished; launching begins.
    Started { candidates: usize },
    /// States created for newly labeled diagrams.
    StatesCreated { count: usize },
    /// A scope group is being prepared.
    GroupStarted { scope: String, diagrams: usize },
    /// Reference lists were rebuilt on a cache miss.
    CacheRebuilt {
        scope: String,
        assets: usize,
        patterns: usize,
    },
    /// A diagram batch was submitted and claimed.
    BatchLaunched {
        scope: String,
        diagrams: usize,
        detect_job: String,
        pattern_job: String,
    },
    /// Another worker claimed the batch first.
    BatchLost { scope: String, diagrams: usize },
    /// A diagram was dropped with a terminal data error.
    DiagramFailed { diagram_ref: String, error: String },
    /// A whole scope group failed and stays queued for the next pass.
    GroupFailed { scope: String, error: String },
    /// Launch complete.
    Complete { launched: usize, failed: usize },
}

/// Knobs for one launch invocation.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    /// Cap on how many states are selected this run.
    pub limit: Option<usize>,
}

#[derive(Debug, Default)]
struct GroupOutcome {
    launched: usize,
    batches: usize,
    lost: usize,
    skipped: usize,
    failures: Vec<String>,
}

/// Coordinates the launch phase.
pub struct LaunchService {
    store: StoreContext,
    detect: Arc<dyn DetectionService>,
    settings: Arc<Settings>,
}

impl LaunchService {
    pub fn new(
        store: StoreContext,
        detect: Arc<dyn DetectionService>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            store,
            detect,
            settings,
        }
    }

    /// Run one launch pass. Everything that happened lands in the
    /// summary; only a run that could not start at all reports Failure
    /// without counts.
    pub async fn run(
        &self,
        options: &LaunchOptions,
        event_tx: mpsc::Sender<LaunchEvent>,
    ) -> RunSummary {
        let started = Instant::now();
        let pipeline = self.settings.annotation.pipeline.clone();
        let mut summary = RunSummary::new(Phase::Launch, &pipeline);
        match self.execute(options, &event_tx, &mut summary).await {
            Ok(message) => summary.finish(started, message),
            Err(err) => {
                warn!(pipeline = %pipeline, "launch pass aborted: {:#}", err);
                RunSummary::failed(Phase::Launch, &pipeline, started, format!("{err:#}"))
            }
        }
    }

    async fn execute(
        &self,
        options: &LaunchOptions,
        event_tx: &mpsc::Sender<LaunchEvent>,
        summary: &mut RunSummary,
    ) -> anyhow::Result<String> {
        let pipeline = self.settings.annotation.pipeline.as_str();
        let graph = self.store.graph();

        let created = self.create_missing_states(pipeline).await?;
        if created > 0 {
            let _ = event_tx
                .send(LaunchEvent::StatesCreated { count: created })
                .await;
        }
        summary.count("states_created", created);

        let candidates = self.select_candidates(pipeline, options.limit).await?;
        summary.count("selected", candidates.len());
        let _ = event_tx
            .send(LaunchEvent::Started {
                candidates: candidates.len(),
            })
            .await;
        if candidates.is_empty() {
            let _ = event_tx
                .send(LaunchEvent::Complete {
                    launched: 0,
                    failed: 0,
                })
                .await;
            return Ok("nothing to launch".to_string());
        }

        // Join each state with its diagram node and group by scope.
        // Diagrams without a site are a data error and leave the
        // pipeline; a diagram we cannot reach right now stays queued.
        let mut groups: BTreeMap<ScopeKey, Vec<(AnnotationState, DiagramNode)>> = BTreeMap::new();
        let mut data_errors = 0usize;
        for state in candidates {
            match graph.get_diagram(&state.diagram_ref).await {
                Ok(diagram) => match diagram.scope() {
                    Some(scope) => groups.entry(scope).or_default().push((state, diagram)),
                    None => {
                        self.fail_diagram(state, "diagram has no site attribute", event_tx)
                            .await?;
                        data_errors += 1;
                    }
                },
                Err(err) if err.is_not_found() => {
                    self.fail_diagram(state, "diagram node not found", event_tx)
                        .await?;
                    data_errors += 1;
                }
                Err(err) => {
                    warn!(diagram = %state.diagram_ref, "diagram lookup failed: {}", err);
                    summary.add_failure(format!("diagram {}: {err}", state.diagram_ref));
                }
            }
        }

        let epoch = cache::current_epoch(self.store.kv(), pipeline).await?;
        let cache = ScopedCache::new(self.store.kv().clone(), &self.settings);

        let mut outcome = GroupOutcome::default();
        let group_count = groups.len();
        for (scope, members) in groups {
            let _ = event_tx
                .send(LaunchEvent::GroupStarted {
                    scope: scope.token(),
                    diagrams: members.len(),
                })
                .await;
            if let Err(err) = self
                .launch_group(&cache, epoch, &scope, &members, event_tx, &mut outcome)
                .await
            {
                warn!(scope = %scope.token(), "launch group failed: {:#}", err);
                outcome
                    .failures
                    .push(format!("scope {}: {err:#}", scope.token()));
                let _ = event_tx
                    .send(LaunchEvent::GroupFailed {
                        scope: scope.token(),
                        error: format!("{err:#}"),
                    })
                    .await;
            }
        }

        summary.processed = outcome.launched;
        summary.count("launched", outcome.launched);
        summary.count("batches", outcome.batches);
        summary.count("batches_lost", outcome.lost);
        summary.count("window_exhausted", outcome.skipped);
        summary.count("data_errors", data_errors);
        let (memory_hits, kv_hits, misses) = cache.stats().snapshot();
        summary.count("cache_memory_hits", memory_hits);
        summary.count("cache_kv_hits", kv_hits);
        summary.count("cache_misses", misses);
        for failure in outcome.failures.drain(..) {
            summary.add_failure(failure);
        }

        let failed = summary.failures.len() + data_errors;
        let _ = event_tx
            .send(LaunchEvent::Complete {
                launched: outcome.launched,
                failed,
            })
            .await;
        info!(
            pipeline = %pipeline,
            launched = outcome.launched,
            batches = outcome.batches,
            "launch pass finished"
        );
        Ok(format!(
            "launched {} diagrams in {} batches across {} scopes",
            outcome.launched, outcome.batches, group_count
        ))
    }

    /// Give every diagram carrying the review label a state record.
    /// Creation is conditional on absence, so concurrent workers race
    /// harmlessly.
    async fn create_missing_states(&self, pipeline: &str) -> anyhow::Result<usize> {
        let graph = self.store.graph();
        let mut known: HashSet<String> = HashSet::new();
        let filter = StateFilter {
            pipeline: Some(pipeline.to_string()),
            ..StateFilter::default()
        };
        let mut cursor: Option<String> = None;
        loop {
            let page = graph.list_states(&filter, cursor.as_deref()).await?;
            known.extend(page.items.into_iter().map(|s| s.diagram_ref));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        let filter = DiagramFilter {
            site: self.settings.runtime.site.clone(),
            label: Some(self.settings.annotation.review_label.clone()),
        };
        let mut created = 0usize;
        let mut cursor: Option<String> = None;
        loop {
            let page = graph.list_diagrams(&filter, cursor.as_deref()).await?;
            for diagram in page.items {
                if known.contains(&diagram.external_id) {
                    continue;
                }
                let state = AnnotationState::new(&diagram.external_id, pipeline);
                match graph.put_state(&state, None).await {
                    Ok(_) => created += 1,
                    Err(err) if err.is_conflict() => {
                        debug!(diagram = %diagram.external_id, "state created elsewhere");
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(created)
    }

    async fn select_candidates(
        &self,
        pipeline: &str,
        limit: Option<usize>,
    ) -> anyhow::Result<Vec<AnnotationState>> {
        let filter = StateFilter {
            pipeline: Some(pipeline.to_string()),
            statuses: vec![AnnotationStatus::New, AnnotationStatus::Retry],
            diagram_ref: None,
        };
        let mut candidates = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .store
                .graph()
                .list_states(&filter, cursor.as_deref())
                .await?;
            for state in page.items {
                debug_assert!(state.status.is_launchable());
                candidates.push(state);
                if limit.is_some_and(|max| candidates.len() >= max) {
                    return Ok(candidates);
                }
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(candidates)
    }

    async fn launch_group(
        &self,
        cache: &ScopedCache,
        epoch: u64,
        scope: &ScopeKey,
        members: &[(AnnotationState, DiagramNode)],
        event_tx: &mpsc::Sender<LaunchEvent>,
        outcome: &mut GroupOutcome,
    ) -> anyhow::Result<()> {
        let annotation = &self.settings.annotation;
        let pipeline = annotation.pipeline.as_str();

        let mut rebuilt = false;
        let assets = match cache.get_assets(pipeline, scope, epoch).await? {
            Some(assets) => assets,
            None => {
                rebuilt = true;
                let assets = self.load_assets(scope).await?;
                cache
                    .put_assets(pipeline, scope, epoch, assets.clone())
                    .await?;
                assets
            }
        };
        let patterns = match cache.get_patterns(pipeline, scope, epoch).await? {
            Some(patterns) => patterns,
            None => {
                rebuilt = true;
                let generated =
                    generate_patterns(assets.iter().flat_map(|asset| asset.match_strings()));
                let overrides = self.load_overrides(scope, &mut outcome.failures).await?;
                let merged = merge_patterns(generated, &overrides);
                cache
                    .put_patterns(pipeline, scope, epoch, merged.clone())
                    .await?;
                merged
            }
        };
        if rebuilt {
            let _ = event_tx
                .send(LaunchEvent::CacheRebuilt {
                    scope: scope.token(),
                    assets: assets.len(),
                    patterns: patterns.len(),
                })
                .await;
        }

        let targets: Vec<SearchTarget> = assets
            .iter()
            .map(|asset| SearchTarget {
                asset: asset.key.clone(),
                terms: asset.match_strings().map(str::to_string).collect(),
            })
            .collect();

        for chunk in members.chunks(annotation.batch_size) {
            let mut windows = Vec::with_capacity(chunk.len());
            let mut ready: Vec<&AnnotationState> = Vec::with_capacity(chunk.len());
            for (state, diagram) in chunk {
                let start = state.annotated_page_count + 1;
                let end = diagram
                    .page_count
                    .min(state.annotated_page_count + annotation.max_pages_per_pass);
                if start > end {
                    warn!(
                        diagram = %state.diagram_ref,
                        pages = diagram.page_count,
                        cursor = state.annotated_page_count,
                        "no pages left to scan, leaving in queue"
                    );
                    outcome.skipped += 1;
                    continue;
                }
                windows.push(DiagramWindow::new(
                    state.diagram_ref.clone(),
                    PageRange::new(start, end),
                ));
                ready.push(state);
            }
            if windows.is_empty() {
                continue;
            }

            let detect_job = self
                .detect
                .submit(DetectRequest {
                    items: windows.clone(),
                    payload: DetectPayload::Standard {
                        targets: targets.clone(),
                    },
                })
                .await?;
            let pattern_job = match self
                .detect
                .submit(DetectRequest {
                    items: windows,
                    payload: DetectPayload::Pattern {
                        patterns: patterns.clone(),
                    },
                })
                .await
            {
                Ok(job) => job,
                Err(err) => {
                    // Half a pair is useless; drop the standard job
                    // and leave the chunk queued.
                    let _ = self.detect.cancel(&detect_job).await;
                    return Err(err.into());
                }
            };

            let mut items = Vec::with_capacity(ready.len());
            for state in &ready {
                let expected = state.version;
                let mut next = (*state).clone();
                next.mark_processing(detect_job.clone(), pattern_job.clone());
                items.push(CommitItem::state_only(next, expected));
            }
            match self
                .store
                .graph()
                .commit_batch(BatchCommit { items })
                .await
            {
                Ok(stored) => {
                    outcome.launched += stored.len();
                    outcome.batches += 1;
                    let _ = event_tx
                        .send(LaunchEvent::BatchLaunched {
                            scope: scope.token(),
                            diagrams: stored.len(),
                            detect_job: detect_job.as_str().to_string(),
                            pattern_job: pattern_job.as_str().to_string(),
                        })
                        .await;
                }
                Err(err) if err.is_conflict() => {
                    debug!(scope = %scope.token(), "batch claimed by another worker");
                    outcome.lost += ready.len();
                    let _ = self.detect.cancel(&detect_job).await;
                    let _ = self.detect.cancel(&pattern_job).await;
                    let _ = event_tx
                        .send(LaunchEvent::BatchLost {
                            scope: scope.token(),
                            diagrams: ready.len(),
                        })
                        .await;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    async fn load_assets(&self, scope: &ScopeKey) -> anyhow::Result<Vec<CandidateAsset>> {
        let mut assets = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .store
                .graph()
                .list_assets(scope, cursor.as_deref())
                .await?;
            assets.extend(page.items);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(assets)
    }

    /// Manual pattern rows from the overrides table. A row that does
    /// not parse is skipped and reported; the tiers that do parse
    /// still apply.
    async fn load_overrides(
        &self,
        scope: &ScopeKey,
        failures: &mut Vec<String>,
    ) -> anyhow::Result<PatternOverrides> {
        let unit = match &scope.unit {
            Some(unit) => {
                self.override_tier(&format!("unit:{}/{unit}", scope.site), failures)
                    .await?
            }
            None => Vec::new(),
        };
        Ok(PatternOverrides {
            unit,
            site: self
                .override_tier(&format!("site:{}", scope.site), failures)
                .await?,
            global: self.override_tier("global", failures).await?,
        })
    }

    async fn override_tier(
        &self,
        key: &str,
        failures: &mut Vec<String>,
    ) -> anyhow::Result<Vec<String>> {
        match self.store.kv().get(tables::PATTERN_OVERRIDES, key).await? {
            Some(raw) => match serde_json::from_str::<Vec<String>>(&raw) {
                Ok(rows) => Ok(rows),
                Err(err) => {
                    warn!(key = %key, "skipping malformed pattern override row: {}", err);
                    failures.push(format!("pattern override '{key}': {err}"));
                    Ok(Vec::new())
                }
            },
            None => Ok(Vec::new()),
        }
    }

    async fn fail_diagram(
        &self,
        mut state: AnnotationState,
        reason: &str,
        event_tx: &mpsc::Sender<LaunchEvent>,
    ) -> anyhow::Result<()> {
        let expected = state.version;
        let diagram_ref = state.diagram_ref.clone();
        state.mark_failed(reason);
        match self.store.graph().put_state(&state, Some(expected)).await {
            Ok(_) => {
                let _ = event_tx
                    .send(LaunchEvent::DiagramFailed {
                        diagram_ref,
                        error: reason.to_string(),
                    })
                    .await;
                Ok(())
            }
            Err(err) if err.is_conflict() => {
                debug!(diagram = %diagram_ref, "state changed elsewhere, not failing it");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AssetKey;
    use crate::store::MemoryStore;

    fn test_settings() -> Settings {
        let mut settings = Settings::default();
        settings.annotation.pipeline = "pipe-std".to_string();
        settings.annotation.batch_size = 2;
        settings
    }

    fn diagram(external_id: &str, site: &str, pages: u32) -> DiagramNode {
        DiagramNode {
            external_id: external_id.to_string(),
            name: external_id.to_string(),
            site: Some(site.to_string()),
            unit: None,
            page_count: pages,
            labels: vec!["needs-annotation".to_string()],
        }
    }

    fn asset(external_id: &str, name: &str, site: &str) -> CandidateAsset {
        CandidateAsset {
            key: AssetKey::new("assets", external_id),
            name: name.to_string(),
            aliases: vec![],
            scope: ScopeKey::new(site, None),
        }
    }

    fn service(store: Arc<MemoryStore>) -> (LaunchService, Arc<crate::detect::SimDetectionService>) {
        let detect = Arc::new(crate::detect::SimDetectionService::new());
        let service = LaunchService::new(
            StoreContext::from_memory(store),
            detect.clone(),
            Arc::new(test_settings()),
        );
        (service, detect)
    }

    #[tokio::test]
    async fn test_launch_creates_states_and_claims_batches() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..3 {
            store
                .seed_diagram(diagram(&format!("diagrams/d-{i}"), "site-a", 10))
                .await;
        }
        store
            .seed_assets([asset("a-1", "P-100", "site-a")])
            .await;

        let (service, _) = service(store.clone());
        let (tx, mut rx) = mpsc::channel(64);
        let summary = service.run(&LaunchOptions::default(), tx).await;

        assert_eq!(summary.counts["states_created"], 3);
        assert_eq!(summary.processed, 3);
        // batch_size 2 splits three diagrams into two batches.
        assert_eq!(summary.counts["batches"], 2);
        assert!(summary.failures.is_empty());

        let filter = StateFilter {
            pipeline: Some("pipe-std".to_string()),
            statuses: vec![AnnotationStatus::Processing],
            diagram_ref: None,
        };
        let page = store.list_states(&filter, None).await.unwrap();
        assert_eq!(page.items.len(), 3);
        for state in &page.items {
            assert_eq!(state.attempt_count, 1);
            assert!(state.job_pair().is_some());
        }
        // The two diagrams of the first batch share a job pair; the
        // third has its own.
        let pairs: HashSet<String> = page
            .items
            .iter()
            .map(|s| {
                let (d, p) = s.job_pair().unwrap();
                format!("{}/{}", d.as_str(), p.as_str())
            })
            .collect();
        assert_eq!(pairs.len(), 2);

        let mut saw_batch = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, LaunchEvent::BatchLaunched { .. }) {
                saw_batch = true;
            }
        }
        assert!(saw_batch);
    }

    #[tokio::test]
    async fn test_scopeless_diagram_is_failed_terminally() {
        let store = Arc::new(MemoryStore::new());
        let mut bad = diagram("diagrams/d-bad", "site-a", 5);
        bad.site = None;
        store.seed_diagram(bad).await;

        let (service, _) = service(store.clone());
        let (tx, _rx) = mpsc::channel(64);
        let summary = service.run(&LaunchOptions::default(), tx).await;
        assert_eq!(summary.counts["data_errors"], 1);

        let state = store
            .get_state("diagrams/d-bad", "pipe-std")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.status, AnnotationStatus::Failed);
        assert_eq!(
            state.message.as_deref(),
            Some("diagram has no site attribute")
        );
    }

    #[tokio::test]
    async fn test_limit_caps_selection() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..5 {
            store
                .seed_diagram(diagram(&format!("diagrams/d-{i}"), "site-a", 10))
                .await;
        }
        store.seed_assets([asset("a-1", "P-100", "site-a")]).await;

        let (service, _) = service(store.clone());
        let (tx, _rx) = mpsc::channel(64);
        let options = LaunchOptions { limit: Some(2) };
        let summary = service.run(&options, tx).await;
        assert_eq!(summary.processed, 2);

        let filter = StateFilter {
            pipeline: Some("pipe-std".to_string()),
            statuses: vec![AnnotationStatus::New],
            diagram_ref: None,
        };
        let remaining = store.list_states(&filter, None).await.unwrap();
        assert_eq!(remaining.items.len(), 3);
    }

    #[tokio::test]
    async fn test_submit_failure_leaves_group_queued() {
        let store = Arc::new(MemoryStore::new());
        store.seed_diagram(diagram("diagrams/d-0", "site-a", 10)).await;
        store.seed_assets([asset("a-1", "P-100", "site-a")]).await;

        let (service, detect) = service(store.clone());
        detect.refuse_submissions("connection refused").await;
        let (tx, _rx) = mpsc::channel(64);
        let summary = service.run(&LaunchOptions::default(), tx).await;

        assert_eq!(summary.processed, 0);
        assert_eq!(summary.failures.len(), 1);
        let state = store
            .get_state("diagrams/d-0", "pipe-std")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.status, AnnotationStatus::New);
        assert_eq!(state.attempt_count, 0);
    }
}
