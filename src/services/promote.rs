//! Promote coordinator.
//!
//! Walks the suggested edges parked on the review placeholder and asks
//! the promotion resolver what their text names. A unique match
//! repoints and approves the edge, a confirmed miss rejects it, and an
//! ambiguous match is tagged and left for a reviewer. Every edge is
//! touched at most once; the attempt tag keeps later passes off edges
//! that stayed suggestions.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cache::{PromotionOutcome, PromotionResolver};
use crate::config::Settings;
use crate::models::{EdgeStatus, EdgeTag, ScopeKey};
use crate::store::{EdgeFilter, GraphStore, StoreContext};

use super::{Phase, RunSummary};

/// Events emitted during a promote pass.
/// Fields are populated when events are created, even if consumers don't read all of them.
#[derive(Debug, Clone)]
#[allow(dead_code)]
pub enum PromoteEvent {
    /// Selection starts. In a dry run nothing is written.
    Started { dry_run: bool },
    /// An edge resolved to exactly one asset and was approved.
    EdgePromoted {
        diagram_ref: String,
        text: String,
        asset: String,
    },
    /// An edge's text names nothing; the edge was rejected.
    EdgeRejected { diagram_ref: String, text: String },
    /// More than one asset matches; the edge stays for a reviewer.
    EdgeAmbiguous {
        diagram_ref: String,
        text: String,
        candidates: usize,
    },
    /// Promote complete.
    Complete {
        promoted: usize,
        rejected: usize,
        ambiguous: usize,
    },
}

/// Knobs for one promote invocation.
#[derive(Debug, Clone, Default)]
pub struct PromoteOptions {
    /// Evaluate and report without writing edges or the promotion table.
    pub dry_run: bool,
    /// Cap on how many edges are handled this run.
    pub limit: Option<usize>,
}

/// Coordinates the promote phase.
pub struct PromoteService {
    store: StoreContext,
    settings: Arc<Settings>,
}

impl PromoteService {
    pub fn new(store: StoreContext, settings: Arc<Settings>) -> Self {
        Self { store, settings }
    }

    /// Run one promote pass over the pipeline's promotable edges.
    pub async fn run(
        &self,
        options: &PromoteOptions,
        event_tx: mpsc::Sender<PromoteEvent>,
    ) -> RunSummary {
        let started = Instant::now();
        let pipeline = self.settings.annotation.pipeline.clone();
        let mut summary = RunSummary::new(Phase::Promote, &pipeline);
        match self.execute(options, &event_tx, &mut summary).await {
            Ok(message) => summary.finish(started, message),
            Err(err) => {
                warn!(pipeline = %pipeline, "promote pass aborted: {:#}", err);
                RunSummary::failed(Phase::Promote, &pipeline, started, format!("{err:#}"))
            }
        }
    }

    async fn execute(
        &self,
        options: &PromoteOptions,
        event_tx: &mpsc::Sender<PromoteEvent>,
        summary: &mut RunSummary,
    ) -> anyhow::Result<String> {
        let annotation = &self.settings.annotation;
        let pipeline = annotation.pipeline.clone();
        let graph = self.store.graph();
        let dry_run = options.dry_run;

        let resolver = if dry_run {
            PromotionResolver::read_only(graph.clone(), self.store.kv().clone())
        } else {
            PromotionResolver::new(graph.clone(), self.store.kv().clone())
        };

        let filter = EdgeFilter {
            pipeline: Some(pipeline.clone()),
            status: Some(EdgeStatus::Suggested),
            target: Some(annotation.review_node.clone()),
            without_tag: Some(EdgeTag::PromoteAttempted),
            ..EdgeFilter::default()
        };

        let _ = event_tx.send(PromoteEvent::Started { dry_run }).await;

        let mut promoted = 0usize;
        let mut rejected = 0usize;
        let mut ambiguous = 0usize;
        let mut data_errors = 0usize;
        // Scope per diagram, resolved once per run.
        let mut scopes: HashMap<String, Option<ScopeKey>> = HashMap::new();
        // Edges already handled this run. A settled edge leaves the
        // filter on its own; this set is what keeps an edge whose
        // resolution errored from being retried forever.
        let mut seen: HashSet<String> = HashSet::new();
        let mut cursor: Option<String> = None;

        'pages: loop {
            let page = graph.list_edges(&filter, cursor.as_deref()).await?;
            if page.items.is_empty() {
                break;
            }
            let mut progressed = false;
            for mut edge in page.items {
                if let Some(max) = options.limit {
                    if promoted + rejected + ambiguous + data_errors >= max {
                        break 'pages;
                    }
                }
                if !seen.insert(edge.external_id.clone()) {
                    continue;
                }
                progressed = true;

                let scope = match scopes.get(&edge.diagram_ref) {
                    Some(cached) => cached.clone(),
                    None => {
                        let looked_up = match graph.get_diagram(&edge.diagram_ref).await {
                            Ok(diagram) => diagram.scope(),
                            Err(err) if err.is_not_found() => None,
                            Err(err) => return Err(err.into()),
                        };
                        scopes.insert(edge.diagram_ref.clone(), looked_up.clone());
                        looked_up
                    }
                };
                let Some(scope) = scope else {
                    warn!(
                        diagram = %edge.diagram_ref,
                        "edge without a usable diagram scope, rejecting"
                    );
                    data_errors += 1;
                    summary.add_failure(format!("{}: no usable diagram scope", edge.diagram_ref));
                    if !dry_run {
                        edge.status = EdgeStatus::Rejected;
                        edge.tags.insert(EdgeTag::PromoteAttempted);
                        edge.updated_at = Utc::now();
                        graph.update_edge(&edge).await?;
                    }
                    let _ = event_tx
                        .send(PromoteEvent::EdgeRejected {
                            diagram_ref: edge.diagram_ref.clone(),
                            text: edge.text.clone(),
                        })
                        .await;
                    continue;
                };

                match resolver.resolve(&scope, &edge.text).await {
                    Ok(PromotionOutcome::Resolved(asset)) => {
                        promoted += 1;
                        debug!(
                            diagram = %edge.diagram_ref,
                            text = %edge.text,
                            asset = %asset,
                            "promoting edge"
                        );
                        let asset_name = asset.to_string();
                        if !dry_run {
                            edge.target = asset;
                            edge.status = EdgeStatus::Approved;
                            edge.tags.insert(EdgeTag::PromotedAuto);
                            edge.updated_at = Utc::now();
                            graph.update_edge(&edge).await?;
                        }
                        let _ = event_tx
                            .send(PromoteEvent::EdgePromoted {
                                diagram_ref: edge.diagram_ref.clone(),
                                text: edge.text.clone(),
                                asset: asset_name,
                            })
                            .await;
                    }
                    Ok(PromotionOutcome::Ambiguous(candidates)) => {
                        ambiguous += 1;
                        if !dry_run {
                            edge.tags.insert(EdgeTag::PromoteAttempted);
                            edge.tags.insert(EdgeTag::AmbiguousMatch);
                            edge.updated_at = Utc::now();
                            graph.update_edge(&edge).await?;
                        }
                        let _ = event_tx
                            .send(PromoteEvent::EdgeAmbiguous {
                                diagram_ref: edge.diagram_ref.clone(),
                                text: edge.text.clone(),
                                candidates: candidates.len(),
                            })
                            .await;
                    }
                    Ok(PromotionOutcome::NotFound) => {
                        rejected += 1;
                        if !dry_run {
                            edge.status = EdgeStatus::Rejected;
                            edge.tags.insert(EdgeTag::PromoteAttempted);
                            edge.updated_at = Utc::now();
                            graph.update_edge(&edge).await?;
                        }
                        let _ = event_tx
                            .send(PromoteEvent::EdgeRejected {
                                diagram_ref: edge.diagram_ref.clone(),
                                text: edge.text.clone(),
                            })
                            .await;
                    }
                    Err(err) => {
                        warn!(
                            diagram = %edge.diagram_ref,
                            text = %edge.text,
                            "promotion lookup failed: {}",
                            err
                        );
                        summary.add_failure(format!("{} '{}': {err}", edge.diagram_ref, edge.text));
                    }
                }
            }

            if dry_run {
                // Nothing changes underneath a dry run; walk the pages.
                match page.next_cursor {
                    Some(next) => cursor = Some(next),
                    None => break,
                }
            } else {
                // Every settled edge left the filter, so the first page
                // always shows fresh work until there is none.
                if !progressed {
                    break;
                }
                cursor = None;
            }
        }

        let counts = resolver.counts();
        summary.processed = promoted + rejected + ambiguous + data_errors;
        summary.count("promoted", promoted);
        summary.count("rejected", rejected);
        summary.count("ambiguous", ambiguous);
        summary.count("data_errors", data_errors);
        summary.count("alias_lookups", counts.lookups);
        summary.count("promotion_memory_hits", counts.memory_hits);
        summary.count("promotion_kv_hits", counts.kv_hits);

        let _ = event_tx
            .send(PromoteEvent::Complete {
                promoted,
                rejected,
                ambiguous,
            })
            .await;
        info!(
            pipeline = %pipeline,
            promoted,
            rejected,
            ambiguous,
            dry_run,
            "promote pass finished"
        );
        let mut message = format!("{promoted} promoted, {rejected} rejected, {ambiguous} left ambiguous");
        if dry_run {
            message.push_str(" (dry run, nothing written)");
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        AnnotationEdge, AssetKey, BoundingBox, CandidateAsset, Detection, DetectionMode,
        DiagramNode,
    };
    use crate::store::{tables, KvTable, MemoryStore};

    fn test_settings() -> Settings {
        let mut settings = Settings::default();
        settings.annotation.pipeline = "pipe-std".to_string();
        settings
    }

    fn diagram(external_id: &str) -> DiagramNode {
        DiagramNode {
            external_id: external_id.to_string(),
            name: external_id.to_string(),
            site: Some("site-a".to_string()),
            unit: None,
            page_count: 1,
            labels: vec![],
        }
    }

    fn asset(external_id: &str, name: &str) -> CandidateAsset {
        CandidateAsset {
            key: AssetKey::new("assets", external_id),
            name: name.to_string(),
            aliases: vec![],
            scope: ScopeKey::new("site-a", None),
        }
    }

    fn suggested_edge(diagram_ref: &str, text: &str) -> AnnotationEdge {
        let detection = Detection {
            diagram_ref: diagram_ref.to_string(),
            text: text.to_string(),
            page: 1,
            region: BoundingBox::new(1.0, 1.0, 2.0, 2.0),
            confidence: None,
            target: None,
            mode: DetectionMode::Pattern,
        };
        AnnotationEdge::from_detection(
            &detection,
            AssetKey::new("assets", "annotation-review"),
            EdgeStatus::Suggested,
            "pipe-std",
        )
    }

    fn service(store: Arc<MemoryStore>) -> PromoteService {
        PromoteService::new(StoreContext::from_memory(store), Arc::new(test_settings()))
    }

    async fn stored_edge(store: &Arc<MemoryStore>, diagram_ref: &str) -> AnnotationEdge {
        let filter = EdgeFilter {
            diagram_ref: Some(diagram_ref.to_string()),
            ..EdgeFilter::default()
        };
        let page = store.list_edges(&filter, None).await.unwrap();
        assert_eq!(page.items.len(), 1);
        page.items.into_iter().next().unwrap()
    }

    #[tokio::test]
    async fn test_unique_match_promotes_and_stays_settled() {
        let store = Arc::new(MemoryStore::new());
        store.seed_diagram(diagram("diagrams/d-1")).await;
        store.seed_assets([asset("a-1", "P-42")]).await;
        store
            .update_edge(&suggested_edge("diagrams/d-1", "P-42"))
            .await
            .unwrap();
        let service = service(store.clone());

        let (tx, _rx) = mpsc::channel(64);
        let summary = service.run(&PromoteOptions::default(), tx).await;
        assert_eq!(summary.counts["promoted"], 1);
        assert_eq!(summary.processed, 1);

        let edge = stored_edge(&store, "diagrams/d-1").await;
        assert_eq!(edge.status, EdgeStatus::Approved);
        assert_eq!(edge.target, AssetKey::new("assets", "a-1"));
        assert!(edge.has_tag(EdgeTag::PromotedAuto));

        // A second pass finds nothing left to do.
        let (tx, _rx) = mpsc::channel(64);
        let summary = service.run(&PromoteOptions::default(), tx).await;
        assert_eq!(summary.processed, 0);
    }

    #[tokio::test]
    async fn test_ambiguous_edge_is_tagged_and_left_for_review() {
        let store = Arc::new(MemoryStore::new());
        store.seed_diagram(diagram("diagrams/d-1")).await;
        store
            .seed_assets([asset("a-1", "P-100"), asset("a-2", "P-100")])
            .await;
        store
            .update_edge(&suggested_edge("diagrams/d-1", "P-100"))
            .await
            .unwrap();
        let service = service(store.clone());

        let (tx, _rx) = mpsc::channel(64);
        let summary = service.run(&PromoteOptions::default(), tx).await;
        assert_eq!(summary.counts["ambiguous"], 1);

        let edge = stored_edge(&store, "diagrams/d-1").await;
        assert_eq!(edge.status, EdgeStatus::Suggested);
        assert_eq!(edge.target, AssetKey::new("assets", "annotation-review"));
        assert!(edge.has_tag(EdgeTag::PromoteAttempted));
        assert!(edge.has_tag(EdgeTag::AmbiguousMatch));

        let (tx, _rx) = mpsc::channel(64);
        let summary = service.run(&PromoteOptions::default(), tx).await;
        assert_eq!(summary.processed, 0);
    }

    #[tokio::test]
    async fn test_unresolvable_edge_is_rejected_and_miss_remembered() {
        let store = Arc::new(MemoryStore::new());
        store.seed_diagram(diagram("diagrams/d-1")).await;
        store
            .update_edge(&suggested_edge("diagrams/d-1", "GHOST-9"))
            .await
            .unwrap();
        let service = service(store.clone());

        let (tx, _rx) = mpsc::channel(64);
        let summary = service.run(&PromoteOptions::default(), tx).await;
        assert_eq!(summary.counts["rejected"], 1);

        let edge = stored_edge(&store, "diagrams/d-1").await;
        assert_eq!(edge.status, EdgeStatus::Rejected);
        assert!(edge.has_tag(EdgeTag::PromoteAttempted));

        // The dead end went into the promotion table as negative rows.
        let page = KvTable::scan(store.as_ref(), tables::PROMOTION_MAP, "", None)
            .await
            .unwrap();
        assert_eq!(page.items.len(), 2);
    }

    #[tokio::test]
    async fn test_dry_run_reports_without_writing() {
        let store = Arc::new(MemoryStore::new());
        store.seed_diagram(diagram("diagrams/d-1")).await;
        store.seed_assets([asset("a-1", "P-42")]).await;
        store
            .update_edge(&suggested_edge("diagrams/d-1", "P-42"))
            .await
            .unwrap();
        let service = service(store.clone());

        let options = PromoteOptions {
            dry_run: true,
            limit: None,
        };
        let (tx, _rx) = mpsc::channel(64);
        let summary = service.run(&options, tx).await;
        assert_eq!(summary.counts["promoted"], 1);

        let edge = stored_edge(&store, "diagrams/d-1").await;
        assert_eq!(edge.status, EdgeStatus::Suggested);
        assert!(edge.tags.is_empty());
        let page = KvTable::scan(store.as_ref(), tables::PROMOTION_MAP, "", None)
            .await
            .unwrap();
        assert!(page.items.is_empty());

        // The real pass afterwards does the work.
        let (tx, _rx) = mpsc::channel(64);
        let summary = service.run(&PromoteOptions::default(), tx).await;
        assert_eq!(summary.counts["promoted"], 1);
        let edge = stored_edge(&store, "diagrams/d-1").await;
        assert_eq!(edge.status, EdgeStatus::Approved);
    }

    #[tokio::test]
    async fn test_edge_without_diagram_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        store
            .update_edge(&suggested_edge("diagrams/ghost", "P-42"))
            .await
            .unwrap();
        let service = service(store.clone());

        let (tx, _rx) = mpsc::channel(64);
        let summary = service.run(&PromoteOptions::default(), tx).await;
        assert_eq!(summary.counts["data_errors"], 1);
        assert_eq!(summary.failures.len(), 1);

        let edge = stored_edge(&store, "diagrams/ghost").await;
        assert_eq!(edge.status, EdgeStatus::Rejected);
        assert!(edge.has_tag(EdgeTag::PromoteAttempted));
    }
}
