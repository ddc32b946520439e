//! Store context bundling graph and key-value access.
//!
//! The context is the entry point services hold. It hides which
//! backend is in play; both halves usually point at the same place.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{BackendKind, Settings};

use super::http::HttpStore;
use super::memory::MemoryStore;
use super::{GraphStore, KvTable, StoreResult};

#[derive(Clone)]
pub struct StoreContext {
    graph: Arc<dyn GraphStore>,
    kv: Arc<dyn KvTable>,
}

impl StoreContext {
    /// Build the backend the settings ask for.
    pub fn from_settings(settings: &Settings) -> StoreResult<Self> {
        match settings.store.backend {
            BackendKind::Memory => Ok(Self::in_memory().0),
            BackendKind::Http => {
                let store = Arc::new(HttpStore::new(
                    &settings.store.base_url,
                    settings.store.api_token.clone(),
                    Duration::from_secs(settings.store.timeout_secs),
                )?);
                Ok(Self {
                    graph: store.clone(),
                    kv: store,
                })
            }
        }
    }

    /// Fresh in-memory context. The raw store comes back too so tests
    /// and local tools can seed diagrams and assets directly.
    pub fn in_memory() -> (Self, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (
            Self {
                graph: store.clone(),
                kv: store.clone(),
            },
            store,
        )
    }

    /// Wrap an existing store (used by tests with custom page sizes).
    #[allow(dead_code)]
    pub fn from_memory(store: Arc<MemoryStore>) -> Self {
        Self {
            graph: store.clone(),
            kv: store,
        }
    }

    pub fn graph(&self) -> &Arc<dyn GraphStore> {
        &self.graph
    }

    pub fn kv(&self) -> &Arc<dyn KvTable> {
        &self.kv
    }

    /// Verify the store is reachable. Used to fail fast at startup.
    pub async fn test_connection(&self) -> StoreResult<()> {
        self.graph.ping().await
    }
}
