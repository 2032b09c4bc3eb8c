//! loam - local-first item synchronization and publishing
//!
//! An embeddable engine that keeps a local SQLite mirror of a remote
//! attestation registry and lets applications edit optimistically while
//! offline. Entities are modeled as seeds (stable identity), versions
//! (immutable snapshots), and metadata rows (one per property value), each
//! of which may or may not have been attested remotely yet.
//!
//! The moving parts:
//! - [`store`]: the relational cache (seeds, versions, metadata, app state)
//! - [`schema`]: model schemas and property-kind classification
//! - [`registry`]: remote attestation registry client and query types
//! - [`content`]: managed files, image resolution, and content uploads
//! - [`actor`]: the property, item, collection, and publish state machines
//!
//! [`Engine`] wires these together: one store, one event bus, one set of
//! process-wide caches, and a per-model collection registry.

pub mod actor;
pub mod config;
pub mod content;
pub mod error;
pub mod events;
pub mod ready;
pub mod registry;
pub mod schema;
pub mod store;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

pub use actor::collection::{CollectionActor, CollectionState};
pub use actor::item::{ItemActor, ItemInit, ItemSnapshot, ItemState};
pub use actor::property::{PropertyActor, PropertyState};
pub use actor::publish::{AttestationDraft, PublishActor, PublishPayload, PublishState};
pub use actor::EngineContext;
pub use config::EngineConfig;
pub use content::ContentClient;
pub use error::{EngineError, ErrorKind, Result};
pub use events::{EngineEvent, EventBus};
pub use registry::{AttestationRecord, RegistryClient, RegistryQuery};
pub use schema::{RawPropertyDescriptor, SchemaSet};
pub use store::Store;

/// Top-level handle: one store, one bus, one collection actor per model
pub struct Engine {
    ctx: Arc<EngineContext>,
    collections: DashMap<String, Arc<Mutex<CollectionActor>>>,
}

impl Engine {
    /// Open the store under the configured data directory and wire up the
    /// shared context. The readiness gate opens once the store is usable.
    pub fn new(
        config: EngineConfig,
        schemas: SchemaSet,
        registry: Arc<dyn RegistryClient>,
        content: Arc<dyn ContentClient>,
    ) -> Result<Self> {
        let store = Arc::new(Store::open(config.db_path())?);
        let ctx = EngineContext::new(config, store, schemas, registry, content)?;
        ctx.db_ready.signal();
        info!("engine started");
        Ok(Self {
            ctx: Arc::new(ctx),
            collections: DashMap::new(),
        })
    }

    /// Shared context handed to every actor
    pub fn context(&self) -> Arc<EngineContext> {
        self.ctx.clone()
    }

    /// Subscribe to the process-wide event bus
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.ctx.bus.subscribe()
    }

    /// The collection actor for a model, created on first use. Unknown
    /// models are a schema error. The entry lock makes concurrent callers
    /// for one model agree on a single actor.
    pub fn collection(&self, model: &str) -> Result<Arc<Mutex<CollectionActor>>> {
        let key = model.to_lowercase();
        match self.collections.entry(key.clone()) {
            Entry::Occupied(existing) => Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                let actor = Arc::new(Mutex::new(CollectionActor::new(self.ctx.clone(), &key)?));
                slot.insert(actor.clone());
                Ok(actor)
            }
        }
    }

    /// Create a brand new item from initial property values and drive it
    /// to `Ready`
    pub async fn new_item(&self, model: &str, values: Map<String, Value>) -> Result<ItemActor> {
        let mut item = ItemActor::new(self.ctx.clone(), model)?;
        item.hydrate(ItemInit::New { values }).await?;
        Ok(item)
    }

    /// Load an existing item by its identity pair, pulling remote
    /// properties down when `remote_version_uid` has no local mirror yet
    pub async fn load_item(
        &self,
        model: &str,
        seed_local_id: Option<String>,
        seed_uid: Option<String>,
        remote_version_uid: Option<String>,
    ) -> Result<ItemActor> {
        let mut item = ItemActor::new(self.ctx.clone(), model)?;
        item.hydrate(ItemInit::Existing {
            seed_local_id,
            seed_uid,
            remote_version_uid,
        })
        .await?;
        Ok(item)
    }

    /// A fresh publish actor over the shared context
    pub fn publisher(&self) -> PublishActor {
        PublishActor::new(self.ctx.clone())
    }

    /// Clear every process-wide cache, e.g. after a registry reconnect
    pub fn clear_caches(&self) {
        self.ctx.clear_caches();
    }

    /// Unload every collection and drop the actor registry
    pub async fn shutdown(&self) {
        for entry in self.collections.iter() {
            entry.value().lock().await.unload().await;
        }
        self.collections.clear();
        info!("engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::tests_support::{test_schemas, MockContent, MockRegistry};
    use serde_json::json;

    fn engine() -> Engine {
        let data_dir = tempfile::TempDir::new().unwrap().into_path();
        Engine::new(
            EngineConfig::with_data_dir(data_dir),
            test_schemas(),
            Arc::new(MockRegistry::default()),
            Arc::new(MockContent::default()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_collection_is_created_once_per_model() {
        let engine = engine();
        let first = engine.collection("book").unwrap();
        let second = engine.collection("Book").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_concurrent_collection_calls_share_one_actor() {
        let engine = Arc::new(engine());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move { engine.collection("book") }));
        }

        let mut actors = Vec::new();
        for handle in handles {
            actors.push(handle.await.unwrap().unwrap());
        }
        for actor in &actors[1..] {
            assert!(Arc::ptr_eq(&actors[0], actor));
        }
    }

    #[tokio::test]
    async fn test_unknown_model_is_a_schema_error() {
        let engine = engine();
        let err = engine.collection("spaceship").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Schema);
    }

    #[tokio::test]
    async fn test_new_item_roundtrips_through_load() {
        let engine = engine();
        let mut values = Map::new();
        values.insert("title".to_string(), json!("Dune"));
        let item = engine.new_item("book", values).await.unwrap();
        let seed_local_id = item.seed_local_id().unwrap().to_string();

        let loaded = engine
            .load_item("book", Some(seed_local_id.clone()), None, None)
            .await
            .unwrap();
        assert_eq!(loaded.seed_local_id(), Some(seed_local_id.as_str()));
        assert_eq!(loaded.snapshot().values.get("title"), Some(&json!("Dune")));
    }
}
