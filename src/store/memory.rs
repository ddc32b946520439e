//! In-memory store backend.
//!
//! Backs tests and local single-process runs. Same contract as the
//! HTTP backend, including version checks and atomic batch commits;
//! atomicity falls out of holding the lock for the whole batch.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::models::{
    AnnotationEdge, AnnotationState, CandidateAsset, DiagramNode, ScopeKey,
};
use crate::text;

use super::{
    BatchCommit, DiagramFilter, EdgeFilter, GraphStore, KvTable, Page, StateFilter, StoreError,
    StoreResult,
};

const DEFAULT_PAGE_SIZE: usize = 100;

/// Separator for compound cursor keys. Does not occur in refs.
const KEY_SEP: char = '\u{1f}';

#[derive(Default)]
struct MemoryInner {
    diagrams: BTreeMap<String, DiagramNode>,
    /// Keyed by (diagram_ref, pipeline).
    states: BTreeMap<(String, String), AnnotationState>,
    /// Keyed by external id.
    edges: BTreeMap<String, AnnotationEdge>,
    /// Keyed by "space:external_id".
    assets: BTreeMap<String, CandidateAsset>,
    /// Keyed by (table, key).
    kv: BTreeMap<(String, String), String>,
}

pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    page_size: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryInner::default()),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Seeding and inspection helpers for tests; the binary reaches this
/// store only through the trait objects in [`super::context`].
#[allow(dead_code)]
impl MemoryStore {
    /// Smaller pages exercise cursor handling in tests.
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            inner: Mutex::new(MemoryInner::default()),
            page_size: page_size.max(1),
        }
    }

    pub async fn seed_diagram(&self, diagram: DiagramNode) {
        let mut inner = self.inner.lock().await;
        inner.diagrams.insert(diagram.external_id.clone(), diagram);
    }

    pub async fn seed_assets(&self, assets: impl IntoIterator<Item = CandidateAsset>) {
        let mut inner = self.inner.lock().await;
        for asset in assets {
            inner.assets.insert(asset.key.to_string(), asset);
        }
    }

    pub async fn get_edge(&self, external_id: &str) -> Option<AnnotationEdge> {
        let inner = self.inner.lock().await;
        inner.edges.get(external_id).cloned()
    }

    pub async fn edge_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.edges.len()
    }
}

fn state_key(diagram_ref: &str, pipeline: &str) -> (String, String) {
    (diagram_ref.to_string(), pipeline.to_string())
}

fn state_cursor_key(diagram_ref: &str, pipeline: &str) -> String {
    format!("{diagram_ref}{KEY_SEP}{pipeline}")
}

/// Does `scope` admit an asset registered under `asset_scope`?
/// Sites must match exactly; a unit-scoped lookup also admits
/// site-wide assets that carry no unit of their own.
fn scope_admits(scope: &ScopeKey, asset_scope: &ScopeKey) -> bool {
    if scope.site != asset_scope.site {
        return false;
    }
    match &scope.unit {
        None => true,
        Some(unit) => match &asset_scope.unit {
            None => true,
            Some(asset_unit) => asset_unit == unit,
        },
    }
}

/// Page through pre-sorted (cursor key, value) pairs, resuming strictly
/// after the cursor. The next cursor is the last included key.
fn take_page<T>(sorted: Vec<(String, T)>, cursor: Option<&str>, page_size: usize) -> Page<T> {
    let mut items = Vec::with_capacity(page_size.min(sorted.len()));
    let mut last_key: Option<String> = None;
    for (key, value) in sorted {
        if let Some(cur) = cursor {
            if key.as_str() <= cur {
                continue;
            }
        }
        if items.len() == page_size {
            return Page {
                items,
                next_cursor: last_key,
            };
        }
        last_key = Some(key);
        items.push(value);
    }
    Page {
        items,
        next_cursor: None,
    }
}

#[async_trait]
impl GraphStore for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn get_diagram(&self, diagram_ref: &str) -> StoreResult<DiagramNode> {
        let inner = self.inner.lock().await;
        inner
            .diagrams
            .get(diagram_ref)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                reference: diagram_ref.to_string(),
            })
    }

    async fn list_diagrams(
        &self,
        filter: &DiagramFilter,
        cursor: Option<&str>,
    ) -> StoreResult<Page<DiagramNode>> {
        let inner = self.inner.lock().await;
        let sorted: Vec<(String, DiagramNode)> = inner
            .diagrams
            .iter()
            .filter(|(_, d)| {
                filter
                    .site
                    .as_ref()
                    .map(|site| d.site.as_deref() == Some(site.as_str()))
                    .unwrap_or(true)
                    && filter
                        .label
                        .as_ref()
                        .map(|label| d.labels.iter().any(|l| l == label))
                        .unwrap_or(true)
            })
            .map(|(k, d)| (k.clone(), d.clone()))
            .collect();
        Ok(take_page(sorted, cursor, self.page_size))
    }

    async fn get_state(
        &self,
        diagram_ref: &str,
        pipeline: &str,
    ) -> StoreResult<Option<AnnotationState>> {
        let inner = self.inner.lock().await;
        Ok(inner.states.get(&state_key(diagram_ref, pipeline)).cloned())
    }

    async fn list_states(
        &self,
        filter: &StateFilter,
        cursor: Option<&str>,
    ) -> StoreResult<Page<AnnotationState>> {
        let inner = self.inner.lock().await;
        let sorted: Vec<(String, AnnotationState)> = inner
            .states
            .iter()
            .filter(|(_, s)| {
                filter
                    .pipeline
                    .as_ref()
                    .map(|p| &s.pipeline == p)
                    .unwrap_or(true)
                    && (filter.statuses.is_empty() || filter.statuses.contains(&s.status))
                    && filter
                        .diagram_ref
                        .as_ref()
                        .map(|d| &s.diagram_ref == d)
                        .unwrap_or(true)
            })
            .map(|((diagram, pipeline), s)| (state_cursor_key(diagram, pipeline), s.clone()))
            .collect();
        Ok(take_page(sorted, cursor, self.page_size))
    }

    async fn put_state(
        &self,
        state: &AnnotationState,
        expected_version: Option<u64>,
    ) -> StoreResult<AnnotationState> {
        let mut inner = self.inner.lock().await;
        let key = state_key(&state.diagram_ref, &state.pipeline);
        let reference = format!("{}@{}", state.diagram_ref, state.pipeline);
        let next_version = match (inner.states.get(&key), expected_version) {
            (None, None) => 1,
            (Some(existing), Some(expected)) if existing.version == expected => expected + 1,
            (existing, _) => {
                return Err(StoreError::Conflict {
                    reference,
                    expected: expected_version
                        .or_else(|| existing.map(|s| s.version))
                        .unwrap_or(0),
                })
            }
        };
        let mut stored = state.clone();
        stored.version = next_version;
        inner.states.insert(key, stored.clone());
        Ok(stored)
    }

    async fn commit_batch(&self, commit: BatchCommit) -> StoreResult<Vec<AnnotationState>> {
        let mut inner = self.inner.lock().await;

        // Validate the whole batch before touching anything.
        for item in &commit.items {
            let key = state_key(&item.state.diagram_ref, &item.state.pipeline);
            match inner.states.get(&key) {
                Some(existing) if existing.version == item.expected_version => {}
                Some(_) | None => {
                    return Err(StoreError::Conflict {
                        reference: format!("{}@{}", item.state.diagram_ref, item.state.pipeline),
                        expected: item.expected_version,
                    });
                }
            }
            if let Some(swap) = &item.label_swap {
                if !inner.diagrams.contains_key(&swap.diagram_ref) {
                    return Err(StoreError::NotFound {
                        reference: swap.diagram_ref.clone(),
                    });
                }
            }
        }

        let mut stored_states = Vec::with_capacity(commit.items.len());
        for item in commit.items {
            for edge in item.edges {
                upsert_edge(&mut inner.edges, edge);
            }
            if let Some(swap) = item.label_swap {
                if let Some(diagram) = inner.diagrams.get_mut(&swap.diagram_ref) {
                    diagram.labels.retain(|l| !swap.remove.contains(l));
                    for label in swap.add {
                        if !diagram.labels.contains(&label) {
                            diagram.labels.push(label);
                        }
                    }
                }
            }
            let key = state_key(&item.state.diagram_ref, &item.state.pipeline);
            let mut stored = item.state;
            stored.version = item.expected_version + 1;
            inner.states.insert(key, stored.clone());
            stored_states.push(stored);
        }
        Ok(stored_states)
    }

    async fn list_edges(
        &self,
        filter: &EdgeFilter,
        cursor: Option<&str>,
    ) -> StoreResult<Page<AnnotationEdge>> {
        let inner = self.inner.lock().await;
        let sorted: Vec<(String, AnnotationEdge)> = inner
            .edges
            .iter()
            .filter(|(_, e)| edge_matches(filter, e))
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect();
        Ok(take_page(sorted, cursor, self.page_size))
    }

    async fn update_edge(&self, edge: &AnnotationEdge) -> StoreResult<AnnotationEdge> {
        let mut inner = self.inner.lock().await;
        Ok(upsert_edge(&mut inner.edges, edge.clone()))
    }

    async fn delete_edges(&self, filter: &EdgeFilter) -> StoreResult<u64> {
        let mut inner = self.inner.lock().await;
        let before = inner.edges.len();
        inner.edges.retain(|_, e| !edge_matches(filter, e));
        Ok((before - inner.edges.len()) as u64)
    }

    async fn list_assets(
        &self,
        scope: &ScopeKey,
        cursor: Option<&str>,
    ) -> StoreResult<Page<CandidateAsset>> {
        let inner = self.inner.lock().await;
        let sorted: Vec<(String, CandidateAsset)> = inner
            .assets
            .iter()
            .filter(|(_, a)| scope_admits(scope, &a.scope))
            .map(|(k, a)| (k.clone(), a.clone()))
            .collect();
        Ok(take_page(sorted, cursor, self.page_size))
    }

    async fn find_assets_by_alias(
        &self,
        scope: &ScopeKey,
        alias: &str,
    ) -> StoreResult<Vec<CandidateAsset>> {
        let needle = text::normalize(alias);
        let inner = self.inner.lock().await;
        Ok(inner
            .assets
            .values()
            .filter(|a| scope_admits(scope, &a.scope))
            .filter(|a| a.match_strings().any(|s| text::normalize(s) == needle))
            .cloned()
            .collect())
    }
}

/// Replace-by-id upsert that keeps the original creation time.
fn upsert_edge(
    edges: &mut BTreeMap<String, AnnotationEdge>,
    mut edge: AnnotationEdge,
) -> AnnotationEdge {
    if let Some(existing) = edges.get(&edge.external_id) {
        edge.created_at = existing.created_at;
    }
    edges.insert(edge.external_id.clone(), edge.clone());
    edge
}

fn edge_matches(filter: &EdgeFilter, edge: &AnnotationEdge) -> bool {
    filter
        .pipeline
        .as_ref()
        .map(|p| &edge.pipeline == p)
        .unwrap_or(true)
        && filter
            .diagram_ref
            .as_ref()
            .map(|d| &edge.diagram_ref == d)
            .unwrap_or(true)
        && filter.status.map(|s| edge.status == s).unwrap_or(true)
        && filter
            .target
            .as_ref()
            .map(|t| &edge.target == t)
            .unwrap_or(true)
        && filter.without_tag.map(|t| !edge.has_tag(t)).unwrap_or(true)
}

#[async_trait]
impl KvTable for MemoryStore {
    async fn get(&self, table: &str, key: &str) -> StoreResult<Option<String>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .kv
            .get(&(table.to_string(), key.to_string()))
            .cloned())
    }

    async fn put(&self, table: &str, key: &str, value: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .kv
            .insert((table.to_string(), key.to_string()), value.to_string());
        Ok(())
    }

    async fn delete(&self, table: &str, key: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.kv.remove(&(table.to_string(), key.to_string()));
        Ok(())
    }

    async fn scan(
        &self,
        table: &str,
        prefix: &str,
        cursor: Option<&str>,
    ) -> StoreResult<Page<(String, String)>> {
        let inner = self.inner.lock().await;
        let sorted: Vec<(String, (String, String))> = inner
            .kv
            .iter()
            .filter(|((t, k), _)| t == table && k.starts_with(prefix))
            .map(|((_, k), v)| (k.clone(), (k.clone(), v.clone())))
            .collect();
        Ok(take_page(sorted, cursor, self.page_size))
    }
}

#[cfg(test)]
mod tests {
    use super::super::CommitItem;
    use super::*;
    use crate::models::{
        AnnotationStatus, AssetKey, BoundingBox, Detection, DetectionMode, EdgeStatus,
    };

    fn diagram(external_id: &str, site: &str) -> DiagramNode {
        DiagramNode {
            external_id: external_id.to_string(),
            name: external_id.to_string(),
            site: Some(site.to_string()),
            unit: None,
            page_count: 3,
            labels: vec!["needs-annotation".to_string()],
        }
    }

    fn asset(external_id: &str, name: &str, site: &str, unit: Option<&str>) -> CandidateAsset {
        CandidateAsset {
            key: AssetKey::new("assets", external_id),
            name: name.to_string(),
            aliases: vec![],
            scope: ScopeKey {
                site: site.to_string(),
                unit: unit.map(|u| u.to_string()),
            },
        }
    }

    fn edge_for(diagram_ref: &str, text: &str, page: u32) -> AnnotationEdge {
        let target = AssetKey::new("assets", "a-1");
        let det = Detection {
            diagram_ref: diagram_ref.to_string(),
            text: text.to_string(),
            page,
            region: BoundingBox::new(1.0, 1.0, 2.0, 2.0),
            confidence: Some(0.9),
            target: Some(target.clone()),
            mode: DetectionMode::Standard,
        };
        AnnotationEdge::from_detection(&det, target, EdgeStatus::Approved, "pipe-std")
    }

    #[tokio::test]
    async fn test_put_state_versions_and_conflicts() {
        let store = MemoryStore::new();
        let state = AnnotationState::new("diagrams/d-1", "pipe-std");

        let stored = store.put_state(&state, None).await.unwrap();
        assert_eq!(stored.version, 1);

        // Double create loses.
        assert!(store.put_state(&state, None).await.unwrap_err().is_conflict());

        let mut next = stored.clone();
        next.mark_processing("j-1".into(), "j-2".into());
        let stored = store.put_state(&next, Some(1)).await.unwrap();
        assert_eq!(stored.version, 2);

        // Stale writer loses.
        assert!(store
            .put_state(&next, Some(1))
            .await
            .unwrap_err()
            .is_conflict());
    }

    #[tokio::test]
    async fn test_commit_batch_is_all_or_nothing() {
        let store = MemoryStore::new();
        store.seed_diagram(diagram("diagrams/d-1", "site-a")).await;
        store.seed_diagram(diagram("diagrams/d-2", "site-a")).await;
        let mut items = Vec::new();
        for diagram_ref in ["diagrams/d-1", "diagrams/d-2"] {
            let state = AnnotationState::new(diagram_ref, "pipe-std");
            let stored = store.put_state(&state, None).await.unwrap();
            let mut done = stored.clone();
            done.mark_processing("j-1".into(), "j-2".into());
            done.mark_finalizing();
            done.mark_annotated(3);
            items.push(CommitItem {
                state: done,
                expected_version: stored.version,
                edges: vec![edge_for(diagram_ref, "P-100", 1)],
                label_swap: Some(super::super::LabelSwap {
                    diagram_ref: diagram_ref.to_string(),
                    remove: vec!["needs-annotation".to_string()],
                    add: vec!["annotated".to_string()],
                }),
            });
        }

        // One stale item rejects the whole batch.
        let mut stale = BatchCommit {
            items: items.clone(),
        };
        stale.items[1].expected_version = 99;
        assert!(store.commit_batch(stale).await.unwrap_err().is_conflict());
        assert_eq!(store.edge_count().await, 0);
        let d = store.get_diagram("diagrams/d-1").await.unwrap();
        assert_eq!(d.labels, vec!["needs-annotation".to_string()]);

        let stored = store.commit_batch(BatchCommit { items }).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|s| s.version == 2));
        assert_eq!(store.edge_count().await, 2);
        let d = store.get_diagram("diagrams/d-2").await.unwrap();
        assert_eq!(d.labels, vec!["annotated".to_string()]);
    }

    #[tokio::test]
    async fn test_paging_walks_every_diagram() {
        let store = MemoryStore::with_page_size(2);
        for i in 0..5 {
            store
                .seed_diagram(diagram(&format!("diagrams/d-{i}"), "site-a"))
                .await;
        }
        let filter = DiagramFilter::default();
        let mut seen = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = store
                .list_diagrams(&filter, cursor.as_deref())
                .await
                .unwrap();
            seen.extend(page.items.into_iter().map(|d| d.external_id));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        assert_eq!(seen.len(), 5);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_alias_lookup_respects_scope() {
        let store = MemoryStore::new();
        let mut pump = asset("a-1", "120-P-001A", "site-a", Some("unit-1"));
        pump.aliases.push("P-001A".to_string());
        store
            .seed_assets([
                pump,
                asset("a-2", "120-P-001A", "site-b", None),
                asset("a-3", "site wide", "site-a", None),
            ])
            .await;

        let scope = ScopeKey {
            site: "site-a".to_string(),
            unit: Some("unit-1".to_string()),
        };
        let hits = store.find_assets_by_alias(&scope, "p-001a").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key.external_id, "a-1");

        // Site-wide assets are visible from unit scope.
        let hits = store
            .find_assets_by_alias(&scope, "SITE WIDE")
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key.external_id, "a-3");

        let elsewhere = ScopeKey {
            site: "site-b".to_string(),
            unit: None,
        };
        let hits = store
            .find_assets_by_alias(&elsewhere, "120-P-001A")
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key.external_id, "a-2");
    }

    #[tokio::test]
    async fn test_kv_scan_prefix_and_paging() {
        let store = MemoryStore::with_page_size(2);
        for i in 0..3 {
            KvTable::put(&store, "annotation_cache", &format!("site-a/u{i}"), "{}")
                .await
                .unwrap();
        }
        KvTable::put(&store, "annotation_cache", "site-b/u0", "{}")
            .await
            .unwrap();
        KvTable::put(&store, "promotion_map", "site-a/u0", "{}")
            .await
            .unwrap();

        let mut keys = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = KvTable::scan(&store, "annotation_cache", "site-a/", cursor.as_deref())
                .await
                .unwrap();
            keys.extend(page.items.into_iter().map(|(k, _)| k));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        assert_eq!(keys, vec!["site-a/u0", "site-a/u1", "site-a/u2"]);
    }

    #[tokio::test]
    async fn test_state_filter_by_status() {
        let store = MemoryStore::new();
        let a = AnnotationState::new("diagrams/d-1", "pipe-std");
        store.put_state(&a, None).await.unwrap();
        let mut b = AnnotationState::new("diagrams/d-2", "pipe-std");
        b.mark_processing("j-1".into(), "j-2".into());
        store.put_state(&b, None).await.unwrap();

        let filter = StateFilter {
            pipeline: Some("pipe-std".to_string()),
            statuses: vec![AnnotationStatus::Processing],
            diagram_ref: None,
        };
        let page = store.list_states(&filter, None).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].diagram_ref, "diagrams/d-2");
    }
}
