//! Promotion resolution.
//!
//! Pattern detections arrive as bare text. Promotion tries to find the
//! one asset that text names, walking the normalization variants in
//! order and, for each, three tiers: the run's memory map, the
//! persistent promotion table, and finally a server-side alias lookup.
//! Unique hits and confirmed misses are both written back, so the next
//! run answers from the table either way without touching the server.
//! The table also takes rows from manually confirmed reviews; a
//! positive row overwrites a cached miss. An ambiguous hit is surfaced
//! and deliberately never cached; alias data changes, and a cached
//! ambiguity would hide the fix.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::models::{AssetKey, ScopeKey};
use crate::store::{tables, GraphStore, KvTable, StoreResult};
use crate::text;

/// What resolution concluded for one piece of text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromotionOutcome {
    /// Exactly one asset matches.
    Resolved(AssetKey),
    /// More than one asset matches; left for a reviewer.
    Ambiguous(Vec<AssetKey>),
    NotFound,
}

/// Persisted resolution record in the promotion table. `asset: None`
/// records that the variant resolved to nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PromotionRecord {
    asset: Option<AssetKey>,
    resolved_at: DateTime<Utc>,
}

/// Counters reported in promote run summaries.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromotionCounts {
    pub resolved: usize,
    pub ambiguous: usize,
    pub not_found: usize,
    pub memory_hits: usize,
    pub kv_hits: usize,
    pub lookups: usize,
}

#[derive(Default)]
struct PromotionStats {
    resolved: AtomicUsize,
    ambiguous: AtomicUsize,
    not_found: AtomicUsize,
    memory_hits: AtomicUsize,
    kv_hits: AtomicUsize,
    lookups: AtomicUsize,
}

/// Three-tier resolver. Construct one per run; the memory tier lives
/// as long as the resolver does.
pub struct PromotionResolver {
    graph: Arc<dyn GraphStore>,
    kv: Arc<dyn KvTable>,
    memory: Mutex<HashMap<String, Option<AssetKey>>>,
    stats: PromotionStats,
    /// Whether resolutions are written back to the promotion table.
    learn: bool,
}

fn promotion_key(scope: &ScopeKey, variant: &str) -> String {
    format!("{}/{}", scope.token(), variant)
}

impl PromotionResolver {
    pub fn new(graph: Arc<dyn GraphStore>, kv: Arc<dyn KvTable>) -> Self {
        Self {
            graph,
            kv,
            memory: Mutex::new(HashMap::new()),
            stats: PromotionStats::default(),
            learn: true,
        }
    }

    /// Resolver for dry runs: reads every tier, writes nothing back.
    /// Resolutions still land in the run's memory map so repeated text
    /// is only looked up once.
    pub fn read_only(graph: Arc<dyn GraphStore>, kv: Arc<dyn KvTable>) -> Self {
        Self {
            learn: false,
            ..Self::new(graph, kv)
        }
    }

    pub fn counts(&self) -> PromotionCounts {
        PromotionCounts {
            resolved: self.stats.resolved.load(Ordering::Relaxed),
            ambiguous: self.stats.ambiguous.load(Ordering::Relaxed),
            not_found: self.stats.not_found.load(Ordering::Relaxed),
            memory_hits: self.stats.memory_hits.load(Ordering::Relaxed),
            kv_hits: self.stats.kv_hits.load(Ordering::Relaxed),
            lookups: self.stats.lookups.load(Ordering::Relaxed),
        }
    }

    /// Resolve detected text to an asset within a scope.
    pub async fn resolve(&self, scope: &ScopeKey, raw_text: &str) -> StoreResult<PromotionOutcome> {
        let variants = text::variants(raw_text);
        // Variants the server answered "nothing" for in this call; they
        // become negative rows only if the whole walk comes up empty.
        let mut server_misses: Vec<String> = Vec::new();

        for (index, variant) in variants.iter().enumerate() {
            let key = promotion_key(scope, variant);

            {
                let memory = self.memory.lock().await;
                if let Some(cached) = memory.get(&key) {
                    self.stats.memory_hits.fetch_add(1, Ordering::Relaxed);
                    match cached {
                        Some(asset) => {
                            self.stats.resolved.fetch_add(1, Ordering::Relaxed);
                            return Ok(PromotionOutcome::Resolved(asset.clone()));
                        }
                        None => continue,
                    }
                }
            }

            if let Some(raw) = self.kv.get(tables::PROMOTION_MAP, &key).await? {
                match serde_json::from_str::<PromotionRecord>(&raw) {
                    Ok(record) => {
                        self.stats.kv_hits.fetch_add(1, Ordering::Relaxed);
                        let mut memory = self.memory.lock().await;
                        memory.insert(key, record.asset.clone());
                        drop(memory);
                        match record.asset {
                            Some(asset) => {
                                self.stats.resolved.fetch_add(1, Ordering::Relaxed);
                                return Ok(PromotionOutcome::Resolved(asset));
                            }
                            None => continue,
                        }
                    }
                    Err(err) => {
                        warn!(key = %key, "dropping unreadable promotion record: {}", err);
                        if self.learn {
                            self.kv.delete(tables::PROMOTION_MAP, &key).await?;
                        }
                    }
                }
            }

            self.stats.lookups.fetch_add(1, Ordering::Relaxed);
            let hits = self.graph.find_assets_by_alias(scope, variant).await?;
            let distinct: BTreeSet<AssetKey> = hits.into_iter().map(|a| a.key).collect();
            match distinct.len() {
                0 => {
                    server_misses.push(key);
                }
                1 => {
                    let asset = distinct
                        .into_iter()
                        .next()
                        .ok_or_else(|| crate::store::StoreError::Parse(
                            "asset set emptied unexpectedly".to_string(),
                        ))?;
                    debug!(
                        scope = %scope.token(),
                        variant = %variant,
                        asset = %asset,
                        "resolved promotion"
                    );
                    self.remember(scope, &variants[..=index], Some(&asset))
                        .await?;
                    self.stats.resolved.fetch_add(1, Ordering::Relaxed);
                    return Ok(PromotionOutcome::Resolved(asset));
                }
                _ => {
                    self.stats.ambiguous.fetch_add(1, Ordering::Relaxed);
                    return Ok(PromotionOutcome::Ambiguous(distinct.into_iter().collect()));
                }
            }
        }

        self.remember_keys(&server_misses, None).await?;
        self.stats.not_found.fetch_add(1, Ordering::Relaxed);
        Ok(PromotionOutcome::NotFound)
    }

    /// Record a resolution under every variant that was tried, so the
    /// most literal form of the text hits the table next time. A
    /// positive result replaces any cached misses along the way.
    async fn remember(
        &self,
        scope: &ScopeKey,
        variants: &[String],
        asset: Option<&AssetKey>,
    ) -> StoreResult<()> {
        let keys: Vec<String> = variants
            .iter()
            .map(|variant| promotion_key(scope, variant))
            .collect();
        self.remember_keys(&keys, asset).await
    }

    async fn remember_keys(&self, keys: &[String], asset: Option<&AssetKey>) -> StoreResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let record = PromotionRecord {
            asset: asset.cloned(),
            resolved_at: Utc::now(),
        };
        let raw = serde_json::to_string(&record)
            .map_err(|e| crate::store::StoreError::Parse(e.to_string()))?;
        let mut memory = self.memory.lock().await;
        for key in keys {
            if self.learn {
                self.kv.put(tables::PROMOTION_MAP, key, &raw).await?;
            }
            memory.insert(key.clone(), asset.cloned());
        }
        Ok(())
    }
}
