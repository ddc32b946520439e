//! Scoped reference-data caching.
//!
//! Launch needs two lists per site/unit scope on every diagram it
//! touches: the candidate assets and the generated match patterns.
//! Building either means paging through the store, so both are cached
//! twice over: an in-process map for the current run and a persistent
//! key-value table that survives restarts. An entry is only trusted
//! while all three guards hold: it is younger than the TTL, it was
//! built under the current config version, and its pipeline epoch
//! still matches. A reset bumps the epoch, which kills every cached
//! list for that pipeline at once.

pub mod promotion;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::models::{CandidateAsset, ScopeKey};
use crate::store::{tables, KvTable, StoreResult};

pub use promotion::{PromotionCounts, PromotionOutcome, PromotionResolver};

/// What a cache entry holds for a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Assets,
    Patterns,
}

impl CacheKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheKind::Assets => "assets",
            CacheKind::Patterns => "patterns",
        }
    }
}

/// One cached list with everything needed to judge it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub payload: T,
    pub created_at: DateTime<Utc>,
    pub config_version: String,
    pub epoch: u64,
}

impl<T> CacheEntry<T> {
    pub fn new(payload: T, config_version: &str, epoch: u64) -> Self {
        Self {
            payload,
            created_at: Utc::now(),
            config_version: config_version.to_string(),
            epoch,
        }
    }

    fn is_valid(&self, ttl_secs: u64, config_version: &str, epoch: u64) -> bool {
        if self.config_version != config_version || self.epoch != epoch {
            return false;
        }
        let age = Utc::now().signed_duration_since(self.created_at);
        age <= Duration::seconds(ttl_secs as i64) && age >= Duration::zero()
    }
}

/// Cache hit/miss counters for run summaries.
#[derive(Debug, Default)]
pub struct CacheStats {
    memory_hits: AtomicUsize,
    kv_hits: AtomicUsize,
    misses: AtomicUsize,
}

impl CacheStats {
    pub fn snapshot(&self) -> (usize, usize, usize) {
        (
            self.memory_hits.load(Ordering::Relaxed),
            self.kv_hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

/// Two-layer cache of per-scope reference lists, keyed by pipeline,
/// scope and kind.
pub struct ScopedCache {
    kv: Arc<dyn KvTable>,
    assets: Mutex<HashMap<String, CacheEntry<Vec<CandidateAsset>>>>,
    patterns: Mutex<HashMap<String, CacheEntry<Vec<String>>>>,
    ttl_secs: u64,
    capacity: usize,
    config_version: String,
    stats: CacheStats,
}

fn cache_key(pipeline: &str, scope: &ScopeKey, kind: CacheKind) -> String {
    format!("{pipeline}/{}/{}", scope.token(), kind.as_str())
}

impl ScopedCache {
    pub fn new(kv: Arc<dyn KvTable>, settings: &Settings) -> Self {
        Self {
            kv,
            assets: Mutex::new(HashMap::new()),
            patterns: Mutex::new(HashMap::new()),
            ttl_secs: settings.annotation.cache_ttl_secs,
            capacity: settings.annotation.memory_cache_capacity.max(1),
            config_version: settings.config_version.clone(),
            stats: CacheStats::default(),
        }
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Candidate assets for a scope, or None when nothing valid is
    /// cached.
    pub async fn get_assets(
        &self,
        pipeline: &str,
        scope: &ScopeKey,
        epoch: u64,
    ) -> StoreResult<Option<Vec<CandidateAsset>>> {
        let key = cache_key(pipeline, scope, CacheKind::Assets);
        self.get_entry(&self.assets, key, epoch).await
    }

    /// Store a freshly listed candidate set in both layers.
    pub async fn put_assets(
        &self,
        pipeline: &str,
        scope: &ScopeKey,
        epoch: u64,
        payload: Vec<CandidateAsset>,
    ) -> StoreResult<()> {
        let key = cache_key(pipeline, scope, CacheKind::Assets);
        self.put_entry(&self.assets, key, epoch, payload).await
    }

    /// Merged pattern list for a scope, or None when nothing valid is
    /// cached.
    pub async fn get_patterns(
        &self,
        pipeline: &str,
        scope: &ScopeKey,
        epoch: u64,
    ) -> StoreResult<Option<Vec<String>>> {
        let key = cache_key(pipeline, scope, CacheKind::Patterns);
        self.get_entry(&self.patterns, key, epoch).await
    }

    pub async fn put_patterns(
        &self,
        pipeline: &str,
        scope: &ScopeKey,
        epoch: u64,
        payload: Vec<String>,
    ) -> StoreResult<()> {
        let key = cache_key(pipeline, scope, CacheKind::Patterns);
        self.put_entry(&self.patterns, key, epoch, payload).await
    }

    /// Shared lookup path. Invalid copies are dropped from whichever
    /// layer held them so the next run rebuilds cleanly.
    async fn get_entry<T>(
        &self,
        memory: &Mutex<HashMap<String, CacheEntry<T>>>,
        key: String,
        epoch: u64,
    ) -> StoreResult<Option<T>>
    where
        T: Clone + Serialize + DeserializeOwned,
    {
        {
            let mut memory = memory.lock().await;
            match memory.get(&key) {
                Some(entry) if entry.is_valid(self.ttl_secs, &self.config_version, epoch) => {
                    self.stats.memory_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some(entry.payload.clone()));
                }
                Some(_) => {
                    memory.remove(&key);
                }
                None => {}
            }
        }

        if let Some(raw) = self.kv.get(tables::ANNOTATION_CACHE, &key).await? {
            match serde_json::from_str::<CacheEntry<T>>(&raw) {
                Ok(entry) if entry.is_valid(self.ttl_secs, &self.config_version, epoch) => {
                    self.stats.kv_hits.fetch_add(1, Ordering::Relaxed);
                    let payload = entry.payload.clone();
                    self.insert_memory(memory, key, entry).await;
                    return Ok(Some(payload));
                }
                Ok(_) => {
                    debug!(key = %key, "dropping stale cache entry");
                    self.kv.delete(tables::ANNOTATION_CACHE, &key).await?;
                }
                Err(err) => {
                    warn!(key = %key, "dropping unreadable cache entry: {}", err);
                    self.kv.delete(tables::ANNOTATION_CACHE, &key).await?;
                }
            }
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }

    async fn put_entry<T>(
        &self,
        memory: &Mutex<HashMap<String, CacheEntry<T>>>,
        key: String,
        epoch: u64,
        payload: T,
    ) -> StoreResult<()>
    where
        T: Serialize,
    {
        let entry = CacheEntry::new(payload, &self.config_version, epoch);
        let raw = serde_json::to_string(&entry)
            .map_err(|e| crate::store::StoreError::Parse(e.to_string()))?;
        self.kv.put(tables::ANNOTATION_CACHE, &key, &raw).await?;
        self.insert_memory(memory, key, entry).await;
        Ok(())
    }

    async fn insert_memory<T>(
        &self,
        memory: &Mutex<HashMap<String, CacheEntry<T>>>,
        key: String,
        entry: CacheEntry<T>,
    ) {
        let mut memory = memory.lock().await;
        if memory.len() >= self.capacity && !memory.contains_key(&key) {
            // Evict the oldest entry to stay within capacity.
            if let Some(oldest) = memory
                .iter()
                .min_by_key(|(_, e)| e.created_at)
                .map(|(k, _)| k.clone())
            {
                memory.remove(&oldest);
            }
        }
        memory.insert(key, entry);
    }
}

/// Current pipeline epoch, zero when none was ever recorded.
pub async fn current_epoch(kv: &Arc<dyn KvTable>, pipeline: &str) -> StoreResult<u64> {
    match kv.get(tables::PIPELINE_EPOCH, pipeline).await? {
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(epoch) => Ok(epoch),
            Err(_) => {
                warn!(pipeline = %pipeline, "unreadable epoch '{}', treating as 0", raw);
                Ok(0)
            }
        },
        None => Ok(0),
    }
}

/// Advance the pipeline epoch, invalidating every scoped cache entry
/// for that pipeline. Returns the new epoch.
pub async fn bump_epoch(kv: &Arc<dyn KvTable>, pipeline: &str) -> StoreResult<u64> {
    let next = current_epoch(kv, pipeline).await? + 1;
    kv.put(tables::PIPELINE_EPOCH, pipeline, &next.to_string())
        .await?;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AssetKey;
    use crate::store::MemoryStore;

    fn scope(site: &str, unit: Option<&str>) -> ScopeKey {
        ScopeKey {
            site: site.to_string(),
            unit: unit.map(|u| u.to_string()),
        }
    }

    fn assets(n: usize) -> Vec<CandidateAsset> {
        (0..n)
            .map(|i| CandidateAsset {
                key: AssetKey::new("assets", format!("a-{i}")),
                name: format!("P-{i:03}"),
                aliases: vec![],
                scope: scope("site-a", None),
            })
            .collect()
    }

    fn test_settings() -> Settings {
        let mut settings = Settings::default();
        settings.config_version = "cfg-1".to_string();
        settings
    }

    fn cache_over(kv: Arc<MemoryStore>, settings: &Settings) -> ScopedCache {
        ScopedCache::new(kv as Arc<dyn KvTable>, settings)
    }

    #[tokio::test]
    async fn test_miss_then_hit_both_layers() {
        let kv = Arc::new(MemoryStore::new());
        let settings = test_settings();
        let cache = cache_over(kv.clone(), &settings);
        let scope = scope("site-a", Some("unit-1"));

        assert!(cache
            .get_assets("pipe", &scope, 0)
            .await
            .unwrap()
            .is_none());

        cache
            .put_assets("pipe", &scope, 0, assets(3))
            .await
            .unwrap();
        let hit = cache.get_assets("pipe", &scope, 0).await.unwrap().unwrap();
        assert_eq!(hit.len(), 3);

        // A second cache instance sees only the persistent layer.
        let cache2 = cache_over(kv, &settings);
        let hit = cache2.get_assets("pipe", &scope, 0).await.unwrap().unwrap();
        assert_eq!(hit.len(), 3);
        let (mem, kv_hits, misses) = cache2.stats().snapshot();
        assert_eq!((mem, kv_hits, misses), (0, 1, 0));
    }

    #[tokio::test]
    async fn test_asset_and_pattern_entries_are_independent() {
        let kv = Arc::new(MemoryStore::new());
        let settings = test_settings();
        let cache = cache_over(kv, &settings);
        let scope = scope("site-a", None);

        cache
            .put_patterns("pipe", &scope, 0, vec!["###-P-###".to_string()])
            .await
            .unwrap();
        assert!(cache
            .get_assets("pipe", &scope, 0)
            .await
            .unwrap()
            .is_none());
        let patterns = cache
            .get_patterns("pipe", &scope, 0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(patterns, vec!["###-P-###".to_string()]);
    }

    #[tokio::test]
    async fn test_config_version_change_invalidates() {
        let kv = Arc::new(MemoryStore::new());
        let settings = test_settings();
        let cache = cache_over(kv.clone(), &settings);
        let scope = scope("site-a", None);
        cache
            .put_assets("pipe", &scope, 0, assets(2))
            .await
            .unwrap();

        let mut changed = settings.clone();
        changed.config_version = "cfg-2".to_string();
        let cache2 = cache_over(kv.clone(), &changed);
        assert!(cache2
            .get_assets("pipe", &scope, 0)
            .await
            .unwrap()
            .is_none());
        // The stale persistent copy is gone too.
        assert!(KvTable::get(
            kv.as_ref(),
            tables::ANNOTATION_CACHE,
            "pipe/site-a/-/assets"
        )
        .await
        .unwrap()
        .is_none());
    }

    #[tokio::test]
    async fn test_epoch_change_invalidates() {
        let kv = Arc::new(MemoryStore::new());
        let settings = test_settings();
        let cache = cache_over(kv, &settings);
        let scope = scope("site-a", None);
        cache
            .put_assets("pipe", &scope, 3, assets(2))
            .await
            .unwrap();
        assert!(cache.get_assets("pipe", &scope, 3).await.unwrap().is_some());
        assert!(cache.get_assets("pipe", &scope, 4).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let kv = Arc::new(MemoryStore::new());
        let mut settings = test_settings();
        settings.annotation.cache_ttl_secs = 60;
        let cache = cache_over(kv.clone(), &settings);
        let scope = scope("site-a", None);

        let mut entry = CacheEntry::new(assets(1), "cfg-1", 0);
        entry.created_at = Utc::now() - Duration::seconds(120);
        KvTable::put(
            kv.as_ref(),
            tables::ANNOTATION_CACHE,
            "pipe/site-a/-/assets",
            &serde_json::to_string(&entry).unwrap(),
        )
        .await
        .unwrap();

        assert!(cache
            .get_assets("pipe", &scope, 0)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_memory_capacity_eviction() {
        let kv = Arc::new(MemoryStore::new());
        let mut settings = test_settings();
        settings.annotation.memory_cache_capacity = 2;
        let cache = cache_over(kv, &settings);

        for site in ["s1", "s2", "s3"] {
            cache
                .put_assets("pipe", &scope(site, None), 0, assets(1))
                .await
                .unwrap();
        }
        let memory = cache.assets.lock().await;
        assert_eq!(memory.len(), 2);
    }

    #[tokio::test]
    async fn test_epoch_bump_round_trip() {
        let kv: Arc<dyn KvTable> = Arc::new(MemoryStore::new());
        assert_eq!(current_epoch(&kv, "pipe").await.unwrap(), 0);
        assert_eq!(bump_epoch(&kv, "pipe").await.unwrap(), 1);
        assert_eq!(bump_epoch(&kv, "pipe").await.unwrap(), 2);
        assert_eq!(current_epoch(&kv, "pipe").await.unwrap(), 2);
        // Other pipelines are untouched.
        assert_eq!(current_epoch(&kv, "other").await.unwrap(), 0);
    }
}
