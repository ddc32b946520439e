//! Graph store access layer.
//!
//! The engine keeps no database of its own. Diagrams, assets,
//! annotation edges and per-diagram state live in an external
//! graph-shaped store, reached through the [`GraphStore`] trait;
//! small key-value tables (caches, promotion map, pattern overrides,
//! pipeline epochs) go through [`KvTable`]. An HTTP backend talks to
//! the real service and an in-memory backend backs tests and local
//! runs.
//!
//! State writes are conditional on a version counter. A mismatch
//! surfaces as [`StoreError::Conflict`], which callers treat as
//! "another worker got here first" rather than a failure.

pub mod context;
pub mod http;
pub mod memory;

use async_trait::async_trait;

pub use context::StoreContext;
pub use http::HttpStore;
pub use memory::MemoryStore;

use crate::models::{
    AnnotationEdge, AnnotationState, AnnotationStatus, AssetKey, CandidateAsset, DiagramNode,
    EdgeStatus, EdgeTag, ScopeKey,
};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Conditional write lost: the record's version moved underneath us.
    #[error("version conflict on {reference}: expected {expected}")]
    Conflict { reference: String, expected: u64 },
    #[error("not found: {reference}")]
    NotFound { reference: String },
    #[error("store connection error: {0}")]
    Connection(String),
    #[error("store API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },
    #[error("failed to parse store response: {0}")]
    Parse(String),
    #[error("invalid record {reference}: {reason}")]
    InvalidRecord { reference: String, reason: String },
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// One page of a cursor-driven listing. An absent cursor means the
/// listing is exhausted.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            next_cursor: None,
        }
    }
}

/// Selection for diagram listings.
#[derive(Debug, Clone, Default)]
pub struct DiagramFilter {
    pub site: Option<String>,
    /// Only diagrams carrying this label.
    pub label: Option<String>,
}

/// Selection for annotation state listings.
#[derive(Debug, Clone, Default)]
pub struct StateFilter {
    pub pipeline: Option<String>,
    /// Empty means any status.
    pub statuses: Vec<AnnotationStatus>,
    pub diagram_ref: Option<String>,
}

/// Selection for edge listings.
#[derive(Debug, Clone, Default)]
pub struct EdgeFilter {
    pub pipeline: Option<String>,
    pub diagram_ref: Option<String>,
    pub status: Option<EdgeStatus>,
    /// Only edges pointing at this node. Promotion passes the review
    /// placeholder here.
    pub target: Option<AssetKey>,
    /// Only edges not carrying this tag.
    pub without_tag: Option<EdgeTag>,
}

/// Label change applied to a diagram when a pass commits.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LabelSwap {
    pub diagram_ref: String,
    pub remove: Vec<String>,
    pub add: Vec<String>,
}

/// One diagram's share of a conditional batch write.
#[derive(Debug, Clone)]
pub struct CommitItem {
    pub state: AnnotationState,
    pub expected_version: u64,
    pub edges: Vec<AnnotationEdge>,
    pub label_swap: Option<LabelSwap>,
}

impl CommitItem {
    /// A bare state transition with no edges or label change. Launch
    /// claims whole batches this way.
    pub fn state_only(state: AnnotationState, expected_version: u64) -> Self {
        Self {
            state,
            expected_version,
            edges: Vec::new(),
            label_swap: None,
        }
    }
}

/// A conditional multi-state write: state transitions guarded by their
/// versions, plus any edge upserts and diagram label swaps. Either the
/// whole batch lands or none of it does; a stale version on any state
/// rejects everything. Launch uses it to claim a batch of diagrams,
/// finalize to commit results.
#[derive(Debug, Clone, Default)]
pub struct BatchCommit {
    pub items: Vec<CommitItem>,
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Cheap reachability probe used at startup.
    async fn ping(&self) -> StoreResult<()>;

    async fn get_diagram(&self, diagram_ref: &str) -> StoreResult<DiagramNode>;

    async fn list_diagrams(
        &self,
        filter: &DiagramFilter,
        cursor: Option<&str>,
    ) -> StoreResult<Page<DiagramNode>>;

    async fn get_state(
        &self,
        diagram_ref: &str,
        pipeline: &str,
    ) -> StoreResult<Option<AnnotationState>>;

    async fn list_states(
        &self,
        filter: &StateFilter,
        cursor: Option<&str>,
    ) -> StoreResult<Page<AnnotationState>>;

    /// Conditional state write. `expected_version` of None means the
    /// record must not exist yet; Some(v) means it must still be at v.
    /// On success the stored copy comes back with its new version.
    async fn put_state(
        &self,
        state: &AnnotationState,
        expected_version: Option<u64>,
    ) -> StoreResult<AnnotationState>;

    /// Apply a conditional batch atomically, guarded by every state's
    /// version. Returns the stored states in item order.
    async fn commit_batch(&self, commit: BatchCommit) -> StoreResult<Vec<AnnotationState>>;

    async fn list_edges(
        &self,
        filter: &EdgeFilter,
        cursor: Option<&str>,
    ) -> StoreResult<Page<AnnotationEdge>>;

    /// Unconditional edge upsert, keyed by external id.
    async fn update_edge(&self, edge: &AnnotationEdge) -> StoreResult<AnnotationEdge>;

    /// Delete every edge the filter matches; returns how many went.
    async fn delete_edges(&self, filter: &EdgeFilter) -> StoreResult<u64>;

    async fn list_assets(
        &self,
        scope: &ScopeKey,
        cursor: Option<&str>,
    ) -> StoreResult<Page<CandidateAsset>>;

    /// Server-side alias lookup, the promotion resolver's last tier.
    /// Returns every asset in scope whose name or alias matches.
    async fn find_assets_by_alias(
        &self,
        scope: &ScopeKey,
        alias: &str,
    ) -> StoreResult<Vec<CandidateAsset>>;
}

/// Named key-value tables on the store side. Values are opaque strings;
/// callers serialize what they need (JSON throughout this crate).
#[async_trait]
pub trait KvTable: Send + Sync {
    async fn get(&self, table: &str, key: &str) -> StoreResult<Option<String>>;

    async fn put(&self, table: &str, key: &str, value: &str) -> StoreResult<()>;

    async fn delete(&self, table: &str, key: &str) -> StoreResult<()>;

    async fn scan(
        &self,
        table: &str,
        prefix: &str,
        cursor: Option<&str>,
    ) -> StoreResult<Page<(String, String)>>;
}

/// Table names used by this crate.
pub mod tables {
    pub const ANNOTATION_CACHE: &str = "annotation_cache";
    pub const PROMOTION_MAP: &str = "promotion_map";
    pub const PATTERN_OVERRIDES: &str = "pattern_overrides";
    pub const PIPELINE_EPOCH: &str = "pipeline_epoch";
}
