//! Finalize coordinator.
//!
//! Claims launched batches, polls their detection job pair, and turns
//! completed results into annotation edges plus state transitions in
//! one conditional batch write per claim. Several workers may run at
//! once, in this process or on other hosts; the version check on the
//! claim write keeps them off each other's batches, and a lost commit
//! is simply abandoned for the next pass to redo.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{Duration, Utc};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::detect::{DetectError, DetectionService, JobState, RawDetection};
use crate::models::{
    AnnotationEdge, AnnotationState, AnnotationStatus, Detection, DetectionMode, EdgeStatus, JobId,
};
use crate::store::{
    BatchCommit, CommitItem, EdgeFilter, GraphStore, LabelSwap, StateFilter, StoreContext,
};

use super::{Phase, RunSummary};

/// Events emitted during a finalize pass.
/// Fields are populated when events are created, even if consumers don't read all of them.
#[derive(Debug, Clone)]
#[allow(dead_code)]
pub enum FinalizeEvent {
    /// Worker pool is up.
    Started { workers: usize },
    /// A worker claimed a batch, named by the state it claimed through.
    Claimed { worker_id: usize, diagram_ref: String },
    /// Jobs are still running; the batch went back to the queue.
    BatchRequeued { worker_id: usize, diagrams: usize },
    /// Results landed as edges and state transitions.
    BatchCommitted {
        worker_id: usize,
        diagrams: usize,
        edges: usize,
    },
    /// A detection job failed; its states went to retry or failed.
    BatchFailed {
        worker_id: usize,
        diagrams: usize,
        error: String,
    },
    /// The final commit lost its version race and was abandoned.
    CommitConflict { worker_id: usize },
    /// Finalize complete.
    Complete {
        annotated: usize,
        requeued: usize,
        failed: usize,
    },
}

/// Knobs for one finalize invocation.
#[derive(Debug, Clone, Default)]
pub struct FinalizeOptions {
    /// Worker task count; defaults to the configured pool size.
    pub workers: Option<usize>,
    /// Cap on how many batches are claimed this run.
    pub limit: Option<usize>,
}

#[derive(Default)]
struct FinalizeCounters {
    claimed: AtomicUsize,
    batches: AtomicUsize,
    annotated: AtomicUsize,
    advanced: AtomicUsize,
    requeued: AtomicUsize,
    retried: AtomicUsize,
    failed: AtomicUsize,
    edges: AtomicUsize,
    conflicts: AtomicUsize,
    failures: Mutex<Vec<String>>,
}

/// Coordinates the finalize phase.
pub struct FinalizeService {
    store: StoreContext,
    detect: Arc<dyn DetectionService>,
    settings: Arc<Settings>,
}

impl FinalizeService {
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

    /// Run one finalize pass: claim every batch in flight once, settle
    /// the ones whose jobs are done, and hand the rest back.
    pub async fn run(
        &self,
        options: &FinalizeOptions,
        event_tx: mpsc::Sender<FinalizeEvent>,
    ) -> RunSummary {
        let started = Instant::now();
        let pipeline = self.settings.annotation.pipeline.clone();
        let workers = options
            .workers
            .unwrap_or(self.settings.runtime.workers)
            .max(1);
        let counters = Arc::new(FinalizeCounters::default());
        // Job pairs already claimed (or lost) this run. Without this a
        // worker would immediately re-claim the batch it just handed
        // back because its jobs were still pending.
        let seen_pairs: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

        let _ = event_tx.send(FinalizeEvent::Started { workers }).await;

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let worker = FinalizeWorker {
                worker_id,
                store: self.store.clone(),
                detect: self.detect.clone(),
                settings: self.settings.clone(),
                pipeline: pipeline.clone(),
                limit: options.limit,
                seen_pairs: seen_pairs.clone(),
                counters: counters.clone(),
                event_tx: event_tx.clone(),
            };
            handles.push(tokio::spawn(worker.run()));
        }
        for handle in handles {
            let _ = handle.await;
        }

        let batches = counters.batches.load(Ordering::Relaxed);
        let annotated = counters.annotated.load(Ordering::Relaxed);
        let advanced = counters.advanced.load(Ordering::Relaxed);
        let requeued = counters.requeued.load(Ordering::Relaxed);
        let retried = counters.retried.load(Ordering::Relaxed);
        let failed = counters.failed.load(Ordering::Relaxed);
        let edges = counters.edges.load(Ordering::Relaxed);

        let mut summary = RunSummary::new(Phase::Finalize, &pipeline);
        summary.processed = annotated + advanced + retried + failed;
        summary.count("batches_claimed", counters.claimed.load(Ordering::Relaxed));
        summary.count("batches_committed", batches);
        summary.count("batches_requeued", requeued);
        summary.count("annotated", annotated);
        summary.count("pages_remaining", advanced);
        summary.count("retried", retried);
        summary.count("failed", failed);
        summary.count("edges_written", edges);
        summary.count("conflicts", counters.conflicts.load(Ordering::Relaxed));
        {
            let mut failures = counters.failures.lock().await;
            for failure in failures.drain(..) {
                summary.add_failure(failure);
            }
        }

        let _ = event_tx
            .send(FinalizeEvent::Complete {
                annotated,
                requeued,
                failed,
            })
            .await;
        info!(
            pipeline = %pipeline,
            batches,
            annotated,
            requeued,
            "finalize pass finished"
        );
        let message = format!(
            "{batches} batches committed: {annotated} annotated, {advanced} with pages remaining, {requeued} requeued"
        );
        summary.finish(started, message)
    }
}

/// One worker task of the finalize pool.
struct FinalizeWorker {
    worker_id: usize,
    store: StoreContext,
    detect: Arc<dyn DetectionService>,
    settings: Arc<Settings>,
    pipeline: String,
    limit: Option<usize>,
    seen_pairs: Arc<Mutex<HashSet<String>>>,
    counters: Arc<FinalizeCounters>,
    event_tx: mpsc::Sender<FinalizeEvent>,
}

impl FinalizeWorker {
    async fn run(self) {
        loop {
            if let Some(max) = self.limit {
                if self.counters.claimed.load(Ordering::Relaxed) >= max {
                    break;
                }
            }
            let claimed = match self.claim_next().await {
                Ok(Some(state)) => state,
                Ok(None) => break,
                Err(err) => {
                    warn!(worker = self.worker_id, "claim scan failed: {:#}", err);
                    self.record_failure(format!("worker {}: {err:#}", self.worker_id))
                        .await;
                    break;
                }
            };
            self.counters.claimed.fetch_add(1, Ordering::Relaxed);
            let diagram_ref = claimed.diagram_ref.clone();
            let _ = self
                .event_tx
                .send(FinalizeEvent::Claimed {
                    worker_id: self.worker_id,
                    diagram_ref: diagram_ref.clone(),
                })
                .await;
            if let Err(err) = self.settle_batch(claimed).await {
                warn!(
                    worker = self.worker_id,
                    diagram = %diagram_ref,
                    "batch settlement failed: {:#}",
                    err
                );
                self.record_failure(format!("{diagram_ref}: {err:#}")).await;
            }
        }
    }

    /// Scan the in-flight states and claim one batch by flipping a
    /// single state to `Finalizing` with a conditional write. The
    /// version bump is the claim; peers sharing the job pair stay put
    /// and are settled together.
    async fn claim_next(&self) -> anyhow::Result<Option<AnnotationState>> {
        let graph = self.store.graph();
        let filter = StateFilter {
            pipeline: Some(self.pipeline.clone()),
            statuses: vec![AnnotationStatus::Processing, AnnotationStatus::Finalizing],
            ..StateFilter::default()
        };
        let mut cursor: Option<String> = None;
        loop {
            let page = graph.list_states(&filter, cursor.as_deref()).await?;
            for state in page.items {
                let pair_key = match state.job_pair() {
                    Some((detect_job, pattern_job)) => format!("{detect_job}/{pattern_job}"),
                    None => {
                        // In flight without job ids cannot ever settle.
                        self.fail_state(state, "state carries no detection job ids")
                            .await?;
                        continue;
                    }
                };
                {
                    let mut seen = self.seen_pairs.lock().await;
                    if !seen.insert(pair_key) {
                        continue;
                    }
                }
                let mut next = state.clone();
                if next.status == AnnotationStatus::Processing {
                    next.mark_finalizing();
                }
                match graph.put_state(&next, Some(state.version)).await {
                    Ok(stored) => return Ok(Some(stored)),
                    Err(err) if err.is_conflict() => {
                        debug!(diagram = %state.diagram_ref, "claim lost to another worker");
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(None),
            }
        }
    }

    /// Settle one claimed batch: poll its job pair, then either commit
    /// results, hand the batch back, or walk it down the retry ladder.
    async fn settle_batch(&self, claimed: AnnotationState) -> anyhow::Result<()> {
        let (detect_job, pattern_job) = match claimed.job_pair() {
            Some((d, p)) => (d.clone(), p.clone()),
            None => return Ok(()),
        };
        let batch = self.collect_batch(&detect_job, &pattern_job).await?;
        if batch.is_empty() {
            return Ok(());
        }

        let detect_status = match self.detect.job_status(&detect_job).await {
            Ok(status) => status,
            Err(DetectError::JobNotFound(id)) => {
                let _ = self.detect.cancel(&pattern_job).await;
                return self
                    .settle_failed(batch, &format!("detection job {id} disappeared"))
                    .await;
            }
            Err(err) => {
                warn!(worker = self.worker_id, "job status poll failed: {}", err);
                return self.requeue_batch(batch).await;
            }
        };
        let pattern_status = match self.detect.job_status(&pattern_job).await {
            Ok(status) => status,
            Err(DetectError::JobNotFound(id)) => {
                let _ = self.detect.cancel(&detect_job).await;
                return self
                    .settle_failed(batch, &format!("detection job {id} disappeared"))
                    .await;
            }
            Err(err) => {
                warn!(worker = self.worker_id, "job status poll failed: {}", err);
                return self.requeue_batch(batch).await;
            }
        };

        if let JobState::Failed { message } = &detect_status.state {
            let _ = self.detect.cancel(&pattern_job).await;
            return self.settle_failed(batch, message).await;
        }
        if let JobState::Failed { message } = &pattern_status.state {
            let _ = self.detect.cancel(&detect_job).await;
            return self.settle_failed(batch, message).await;
        }

        if !(detect_status.state.is_completed() && pattern_status.state.is_completed()) {
            // Submission time survives crashes and requeues, so it is
            // the one clock that can catch a job stuck forever.
            let oldest = detect_status.submitted_at.min(pattern_status.submitted_at);
            let age = Utc::now().signed_duration_since(oldest);
            if age > Duration::seconds(self.settings.detect.job_timeout_secs as i64) {
                let _ = self.detect.cancel(&detect_job).await;
                let _ = self.detect.cancel(&pattern_job).await;
                let message =
                    format!("detection jobs pending for {}s, timed out", age.num_seconds());
                return self.settle_failed(batch, &message).await;
            }
            return self.requeue_batch(batch).await;
        }

        let standard = match self.detect.job_results(&detect_job).await {
            Ok(results) => results,
            Err(err) => {
                warn!(worker = self.worker_id, "job result fetch failed: {}", err);
                return self.requeue_batch(batch).await;
            }
        };
        let pattern = match self.detect.job_results(&pattern_job).await {
            Ok(results) => results,
            Err(err) => {
                warn!(worker = self.worker_id, "job result fetch failed: {}", err);
                return self.requeue_batch(batch).await;
            }
        };

        self.commit_results(batch, standard, pattern).await
    }

    /// Every in-flight state tied to this job pair, the claimed one
    /// included. One launch batch, one commit.
    async fn collect_batch(
        &self,
        detect_job: &JobId,
        pattern_job: &JobId,
    ) -> anyhow::Result<Vec<AnnotationState>> {
        let graph = self.store.graph();
        let filter = StateFilter {
            pipeline: Some(self.pipeline.clone()),
            statuses: vec![AnnotationStatus::Processing, AnnotationStatus::Finalizing],
            ..StateFilter::default()
        };
        let mut batch = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = graph.list_states(&filter, cursor.as_deref()).await?;
            for state in page.items {
                if state.job_pair() == Some((detect_job, pattern_job)) {
                    batch.push(state);
                }
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(batch)
    }

    /// Turn raw results into edges and advance every state of the
    /// batch in one conditional write.
    async fn commit_results(
        &self,
        batch: Vec<AnnotationState>,
        standard: Vec<RawDetection>,
        pattern: Vec<RawDetection>,
    ) -> anyhow::Result<()> {
        let graph = self.store.graph();
        let annotation = &self.settings.annotation;

        let mut by_diagram: HashMap<String, Vec<Detection>> = HashMap::new();
        for raw in standard {
            if raw.target.is_none() {
                warn!(
                    diagram = %raw.diagram_ref,
                    text = %raw.text,
                    "standard detection without a target, dropped"
                );
                continue;
            }
            push_detection(&mut by_diagram, raw, DetectionMode::Standard);
        }
        for raw in pattern {
            push_detection(&mut by_diagram, raw, DetectionMode::Pattern);
        }

        let mut items: Vec<CommitItem> = Vec::new();
        let mut annotated = 0usize;
        let mut advanced = 0usize;
        let mut edges_total = 0usize;
        for state in batch {
            let diagram = match graph.get_diagram(&state.diagram_ref).await {
                Ok(diagram) => diagram,
                Err(err) if err.is_not_found() => {
                    self.fail_state(state, "diagram node not found").await?;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            let detections = by_diagram.remove(&state.diagram_ref).unwrap_or_default();
            // Same physical callout found by both modes: standard wins.
            let mut chosen: BTreeMap<String, Detection> = BTreeMap::new();
            for detection in detections {
                let hash = detection.stable_hash();
                let replace = match chosen.get(&hash) {
                    Some(existing) => detection.mode.precedence() < existing.mode.precedence(),
                    None => true,
                };
                if replace {
                    chosen.insert(hash, detection);
                }
            }

            // A fresh pass over a diagram optionally wipes everything
            // earlier runs wrote. When it does, rejected edges go too,
            // so the re-reject guard only applies otherwise.
            let cleaning = annotation.clean_old_edges && state.annotated_page_count == 0;
            let rejected = if cleaning {
                HashSet::new()
            } else {
                self.rejected_ids(&state.diagram_ref).await?
            };

            let mut edges: Vec<AnnotationEdge> = Vec::new();
            for detection in chosen.into_values() {
                let (target, status) = match detection.mode {
                    DetectionMode::Standard => {
                        let Some(target) = detection.target.clone() else {
                            continue;
                        };
                        match EdgeStatus::from_confidence(
                            detection.confidence,
                            annotation.approve_threshold,
                            annotation.suggest_threshold,
                        ) {
                            Some(status) => (target, status),
                            None => continue,
                        }
                    }
                    DetectionMode::Pattern => {
                        (annotation.review_node.clone(), EdgeStatus::Suggested)
                    }
                };
                let edge = AnnotationEdge::from_detection(&detection, target, status, &self.pipeline);
                if rejected.contains(&edge.external_id) {
                    debug!(
                        diagram = %state.diagram_ref,
                        text = %edge.text,
                        "a reviewer rejected this callout, leaving it rejected"
                    );
                    continue;
                }
                edges.push(edge);
            }

            if cleaning {
                let filter = EdgeFilter {
                    pipeline: Some(self.pipeline.clone()),
                    diagram_ref: Some(state.diagram_ref.clone()),
                    ..EdgeFilter::default()
                };
                let removed = graph.delete_edges(&filter).await?;
                if removed > 0 {
                    debug!(
                        diagram = %state.diagram_ref,
                        removed,
                        "cleared edges from previous passes"
                    );
                }
            }

            let expected = state.version;
            let mut next = state;
            if next.status == AnnotationStatus::Processing {
                next.mark_finalizing();
            }
            let window_end = diagram
                .page_count
                .min(next.annotated_page_count + annotation.max_pages_per_pass);
            let label_swap = if window_end >= diagram.page_count {
                next.mark_annotated(diagram.page_count);
                annotated += 1;
                Some(LabelSwap {
                    diagram_ref: next.diagram_ref.clone(),
                    remove: vec![annotation.review_label.clone()],
                    add: vec![annotation.annotated_label.clone()],
                })
            } else {
                next.mark_pages_remaining(window_end);
                advanced += 1;
                None
            };
            edges_total += edges.len();
            items.push(CommitItem {
                state: next,
                expected_version: expected,
                edges,
                label_swap,
            });
        }

        for leftover in by_diagram.keys() {
            warn!(
                diagram = %leftover,
                "job results name a diagram outside the claimed batch, ignoring"
            );
        }

        if items.is_empty() {
            return Ok(());
        }
        let diagrams = items.len();
        match graph.commit_batch(BatchCommit { items }).await {
            Ok(_) => {
                self.counters.batches.fetch_add(1, Ordering::Relaxed);
                self.counters.annotated.fetch_add(annotated, Ordering::Relaxed);
                self.counters.advanced.fetch_add(advanced, Ordering::Relaxed);
                self.counters.edges.fetch_add(edges_total, Ordering::Relaxed);
                let _ = self
                    .event_tx
                    .send(FinalizeEvent::BatchCommitted {
                        worker_id: self.worker_id,
                        diagrams,
                        edges: edges_total,
                    })
                    .await;
            }
            Err(err) if err.is_conflict() => {
                debug!(
                    worker = self.worker_id,
                    "commit lost its version race, abandoning the claim"
                );
                self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
                let _ = self
                    .event_tx
                    .send(FinalizeEvent::CommitConflict {
                        worker_id: self.worker_id,
                    })
                    .await;
            }
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    /// External ids of edges a reviewer already rejected on this
    /// diagram. A later pass never resurrects those.
    async fn rejected_ids(&self, diagram_ref: &str) -> anyhow::Result<HashSet<String>> {
        let graph = self.store.graph();
        let filter = EdgeFilter {
            pipeline: Some(self.pipeline.clone()),
            diagram_ref: Some(diagram_ref.to_string()),
            status: Some(EdgeStatus::Rejected),
            ..EdgeFilter::default()
        };
        let mut ids = HashSet::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = graph.list_edges(&filter, cursor.as_deref()).await?;
            ids.extend(page.items.into_iter().map(|e| e.external_id));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(ids)
    }

    /// Jobs are still running: hand the claimed state back so a later
    /// pass polls again. Unclaimed peers are already queued.
    async fn requeue_batch(&self, batch: Vec<AnnotationState>) -> anyhow::Result<()> {
        let graph = self.store.graph();
        let diagrams = batch.len();
        for state in batch {
            if state.status != AnnotationStatus::Finalizing {
                continue;
            }
            let expected = state.version;
            let mut next = state;
            next.mark_reenqueued();
            match graph.put_state(&next, Some(expected)).await {
                Ok(_) => {}
                Err(err) if err.is_conflict() => {
                    debug!(diagram = %next.diagram_ref, "requeue write lost, leaving as is");
                    self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => return Err(err.into()),
            }
        }
        self.counters.requeued.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .event_tx
            .send(FinalizeEvent::BatchRequeued {
                worker_id: self.worker_id,
                diagrams,
            })
            .await;
        Ok(())
    }

    /// The job pair is lost: every state of the batch retries if it
    /// has attempts left, otherwise it fails for good.
    async fn settle_failed(&self, batch: Vec<AnnotationState>, message: &str) -> anyhow::Result<()> {
        let graph = self.store.graph();
        let diagrams = batch.len();
        let max_attempts = self.settings.annotation.max_attempts;
        for state in batch {
            let expected = state.version;
            let mut next = state;
            let terminal = next.attempt_count >= max_attempts;
            if terminal {
                next.mark_failed(message);
            } else {
                if next.status == AnnotationStatus::Processing {
                    next.mark_finalizing();
                }
                next.mark_retry(message);
            }
            match graph.put_state(&next, Some(expected)).await {
                Ok(_) => {
                    if terminal {
                        self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    } else {
                        self.counters.retried.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(err) if err.is_conflict() => {
                    debug!(diagram = %next.diagram_ref, "failure write lost, leaving as is");
                    self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => return Err(err.into()),
            }
        }
        warn!(
            worker = self.worker_id,
            diagrams, "detection batch failed: {}", message
        );
        let _ = self
            .event_tx
            .send(FinalizeEvent::BatchFailed {
                worker_id: self.worker_id,
                diagrams,
                error: message.to_string(),
            })
            .await;
        Ok(())
    }

    /// Terminal data error on a single state.
    async fn fail_state(&self, state: AnnotationState, reason: &str) -> anyhow::Result<()> {
        warn!(diagram = %state.diagram_ref, "{}", reason);
        let expected = state.version;
        let mut next = state;
        next.mark_failed(reason);
        match self.store.graph().put_state(&next, Some(expected)).await {
            Ok(_) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(err) if err.is_conflict() => {
                debug!(diagram = %next.diagram_ref, "state changed elsewhere, not failing it");
                self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn record_failure(&self, line: String) {
        let mut failures = self.counters.failures.lock().await;
        failures.push(line);
    }
}

fn push_detection(
    by_diagram: &mut HashMap<String, Vec<Detection>>,
    raw: RawDetection,
    mode: DetectionMode,
) {
    let diagram_ref = raw.diagram_ref.clone();
    let detection = Detection {
        diagram_ref: raw.diagram_ref,
        text: raw.text,
        page: raw.page,
        region: raw.region,
        confidence: match mode {
            DetectionMode::Standard => raw.confidence,
            DetectionMode::Pattern => None,
        },
        target: match mode {
            DetectionMode::Standard => raw.target,
            DetectionMode::Pattern => None,
        },
        mode,
    };
    by_diagram.entry(diagram_ref).or_default().push(detection);
}
