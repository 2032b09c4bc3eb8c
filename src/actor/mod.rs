//! Actor machinery
//!
//! Every engine component is a small finite-state machine: transitions
//! happen only when an event is handled, long-running work awaits inline,
//! and an event landing in a state that does not expect it is a no-op
//! (logged at trace level). All actors share one [`EngineContext`].

pub mod collection;
pub mod item;
pub mod property;
pub mod publish;

use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::content::{ContentClient, FileStore};
use crate::error::Result;
use crate::events::EventBus;
use crate::ready::Readiness;
use crate::registry::{RegistryClient, SeedQueryCache};
use crate::schema::{SchemaSet, SchemaUidCache};
use crate::store::Store;

/// Process-wide cache of storage-transaction ids, keyed by
/// `{seed_local_id}.{property}`. Injected, cleared explicitly.
#[derive(Debug, Default)]
pub struct StorageTxCache {
    inner: DashMap<String, String>,
}

impl StorageTxCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(seed_local_id: &str, property: &str) -> String {
        format!("{}.{}", seed_local_id, property)
    }

    pub fn get(&self, seed_local_id: &str, property: &str) -> Option<String> {
        self.inner
            .get(&Self::key(seed_local_id, property))
            .map(|v| v.clone())
    }

    pub fn put(&self, seed_local_id: &str, property: &str, tx_id: impl Into<String>) {
        self.inner.insert(Self::key(seed_local_id, property), tx_id.into());
    }

    pub fn clear(&self) {
        self.inner.clear();
    }
}

/// Shared dependencies handed to every actor
pub struct EngineContext {
    pub config: EngineConfig,
    pub store: Arc<Store>,
    pub registry: Arc<dyn RegistryClient>,
    pub content: Arc<dyn ContentClient>,
    pub files: Arc<FileStore>,
    pub schemas: Arc<SchemaSet>,
    pub schema_uids: Arc<SchemaUidCache>,
    pub storage_tx_ids: Arc<StorageTxCache>,
    pub seed_queries: Arc<SeedQueryCache>,
    pub bus: EventBus,
    pub db_ready: Readiness,
    pub http: reqwest::Client,
}

impl EngineContext {
    pub fn new(
        config: EngineConfig,
        store: Arc<Store>,
        schemas: SchemaSet,
        registry: Arc<dyn RegistryClient>,
        content: Arc<dyn ContentClient>,
    ) -> Result<Self> {
        let files = Arc::new(FileStore::new(
            config.data_dir.clone(),
            config.content_base_url.clone(),
        ));
        let seed_queries = Arc::new(SeedQueryCache::new(Duration::from_millis(
            config.seed_query_ttl_ms,
        )));
        let bus = EventBus::new(config.event_capacity);

        Ok(Self {
            store,
            registry,
            content,
            files,
            schemas: Arc::new(schemas),
            schema_uids: Arc::new(SchemaUidCache::new()),
            storage_tx_ids: Arc::new(StorageTxCache::new()),
            seed_queries,
            bus,
            db_ready: Readiness::new("store"),
            http: reqwest::Client::new(),
            config,
        })
    }

    /// Clear every process-wide cache, e.g. on reconnect
    pub fn clear_caches(&self) {
        self.schema_uids.clear();
        self.storage_tx_ids.clear();
        self.seed_queries.clear();
    }
}

/// Text rendering of a property value as persisted in metadata rows.
/// Strings are stored raw; everything else as its JSON rendering.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Cache key for one item actor: `{seed_local_id}_{seed_uid}`
pub fn item_cache_key(seed_local_id: &str, seed_uid: Option<&str>) -> String {
    format!("{}_{}", seed_local_id, seed_uid.unwrap_or_default())
}
