//! Collection actor
//!
//! Converges an in-memory ordered map of item actors (key =
//! `{seed_local_id}_{seed_uid}`) with the remote registry's current state
//! for one model. Refreshes walk seeds, versions, and one eager hop of
//! related-model data, then instantiate or merge item actors. Keys absent
//! from the latest fetch are evicted. Concurrent refreshes for the same
//! model are not deduplicated; an in-flight refresh and a newly triggered
//! one may interleave writes to the cache map.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, trace};

use super::item::{ItemActor, ItemInit, ItemSnapshot};
use super::{item_cache_key, EngineContext};
use crate::error::Result;
use crate::events::EngineEvent;
use crate::registry::{latest_by_schema, most_recent, AttestationRecord, RegistryQuery};
use crate::schema::ModelSchema;
use crate::store::{now_millis, new_local_id, MetadataRow, SeedRow, VersionRow};

/// Lifecycle states of a collection actor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionState {
    Uninitialized,
    Initializing,
    FetchingSeeds,
    FetchingVersions,
    FetchingRelatedItems,
    ProcessingItems,
    Idle,
}

/// Per-model cache of item actors kept in sync with the registry
pub struct CollectionActor {
    ctx: Arc<EngineContext>,
    model: String,
    schema: Arc<ModelSchema>,
    state: CollectionState,
    items: HashMap<String, Arc<Mutex<ItemActor>>>,
    /// Insertion order of cache keys, rebuilt on every refresh
    order: Vec<String>,
}

impl std::fmt::Debug for CollectionActor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionActor")
            .field("model", &self.model)
            .field("state", &self.state)
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}

impl CollectionActor {
    pub fn new(ctx: Arc<EngineContext>, model: &str) -> Result<Self> {
        let schema = ctx.schemas.model(model)?;
        Ok(Self {
            ctx,
            model: model.to_lowercase(),
            schema,
            state: CollectionState::Uninitialized,
            items: HashMap::new(),
            order: Vec::new(),
        })
    }

    pub fn state(&self) -> CollectionState {
        self.state
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Cache keys in insertion order
    pub fn keys(&self) -> &[String] {
        &self.order
    }

    pub fn get(&self, key: &str) -> Option<Arc<Mutex<ItemActor>>> {
        self.items.get(key).cloned()
    }

    /// Converge the cache with the registry's current state for this model
    pub async fn refresh(&mut self) -> Result<()> {
        self.state = CollectionState::Initializing;
        self.ctx.db_ready.wait().await;
        let seed_schema_uid = self
            .ctx
            .schema_uids
            .resolve(&self.model, &self.model, self.ctx.registry.as_ref())
            .await?;

        self.state = CollectionState::FetchingSeeds;
        let seeds = self
            .ctx
            .seed_queries
            .fetch(&self.model, &seed_schema_uid, self.ctx.registry.as_ref())
            .await?;

        self.state = CollectionState::FetchingVersions;
        let versions = if seeds.is_empty() {
            Vec::new()
        } else {
            let version_schema_uid = self
                .ctx
                .schema_uids
                .resolve("version", "version", self.ctx.registry.as_ref())
                .await?;
            self.ctx
                .registry
                .query(
                    RegistryQuery::by_schema(&version_schema_uid)
                        .referencing_any(seeds.iter().map(|s| s.id.clone()).collect()),
                )
                .await?
        };

        self.state = CollectionState::FetchingRelatedItems;
        self.fetch_related_items().await?;

        self.state = CollectionState::ProcessingItems;
        self.process_items(&seeds, &versions).await?;

        self.persist_snapshot().await?;
        self.ctx.bus.emit(EngineEvent::CollectionRefreshed {
            model: self.model.clone(),
        });

        self.state = CollectionState::Idle;
        info!(model = self.model, items = self.items.len(), "collection refreshed");
        Ok(())
    }

    /// One eager hop: mirror every related model's current seeds, latest
    /// versions, and latest property sets into the local store, so item
    /// actors don't each independently re-query the registry
    async fn fetch_related_items(&mut self) -> Result<()> {
        for (descriptor, target_model) in self.schema.relation_properties() {
            if !self.ctx.schemas.contains(&target_model) {
                trace!(
                    property = descriptor.name,
                    target_model,
                    "relation target has no schema, skipping eager fetch"
                );
                continue;
            }

            let target_schema_uid = self
                .ctx
                .schema_uids
                .resolve(&target_model, &target_model, self.ctx.registry.as_ref())
                .await?;
            let target_seeds = self
                .ctx
                .seed_queries
                .fetch(&target_model, &target_schema_uid, self.ctx.registry.as_ref())
                .await?;
            if target_seeds.is_empty() {
                continue;
            }

            let version_schema_uid = self
                .ctx
                .schema_uids
                .resolve("version", "version", self.ctx.registry.as_ref())
                .await?;
            let target_versions = self
                .ctx
                .registry
                .query(
                    RegistryQuery::by_schema(&version_schema_uid)
                        .referencing_any(target_seeds.iter().map(|s| s.id.clone()).collect()),
                )
                .await?;

            for seed in &target_seeds {
                let seed_versions: Vec<_> = target_versions
                    .iter()
                    .filter(|v| v.ref_uid == seed.id)
                    .cloned()
                    .collect();
                let Some(latest) = most_recent(&seed_versions) else {
                    continue;
                };
                let properties = self
                    .ctx
                    .registry
                    .query(RegistryQuery::default().referencing(&latest.id))
                    .await?;
                self.mirror_remote_item(&target_model, &seed.id, latest, properties)
                    .await?;
            }
        }
        Ok(())
    }

    /// Mirror a remote item's seed, latest version, and latest property set
    /// into the local store without instantiating an actor
    async fn mirror_remote_item(
        &self,
        model: &str,
        seed_uid: &str,
        version: &AttestationRecord,
        properties: Vec<AttestationRecord>,
    ) -> Result<()> {
        let store = &self.ctx.store;

        let (seed_local_id, version_local_id) = match store.find_seed(Some(seed_uid), None).await? {
            Some(seed) => {
                let version_local_id = match store.find_version_by_uid(&version.id).await? {
                    Some(v) => v.version_local_id,
                    None => {
                        let row = VersionRow {
                            version_local_id: new_local_id(),
                            version_uid: Some(version.id.clone()),
                            seed_local_id: seed.seed_local_id.clone(),
                            seed_uid: Some(seed_uid.to_string()),
                            created_at: version.time_created,
                        };
                        store.insert_version(&row).await?;
                        row.version_local_id
                    }
                };
                (seed.seed_local_id, version_local_id)
            }
            None => {
                // New mirror: the pair lands in one transaction so an
                // interrupted refresh never leaves a seed without a version
                let seed = SeedRow {
                    seed_local_id: new_local_id(),
                    seed_uid: Some(seed_uid.to_string()),
                    model: model.to_lowercase(),
                    marked_for_deletion: false,
                    created_at: now_millis(),
                };
                let row = VersionRow {
                    version_local_id: new_local_id(),
                    version_uid: Some(version.id.clone()),
                    seed_local_id: seed.seed_local_id.clone(),
                    seed_uid: Some(seed_uid.to_string()),
                    created_at: version.time_created,
                };
                store.insert_seed_and_version(&seed, &row).await?;
                (seed.seed_local_id, row.version_local_id)
            }
        };

        // The degenerate empty-relation marker never reaches the mirror
        let properties: Vec<_> = properties
            .into_iter()
            .filter(|r| {
                r.field("value")
                    .map(|v| !crate::registry::is_empty_relation(&v))
                    .unwrap_or(true)
            })
            .collect();
        for record in latest_by_schema(properties).values() {
            let mut row = MetadataRow::new(
                &seed_local_id,
                &version_local_id,
                &record.field("name").unwrap_or_else(|| record.schema_id.clone()),
            );
            row.uid = Some(record.id.clone());
            row.property_value = record.field("value");
            row.schema_uid = Some(record.schema_id.clone());
            row.seed_uid = Some(seed_uid.to_string());
            row.version_uid = Some(version.id.clone());
            row.model = Some(model.to_lowercase());
            row.attestation_created_at = Some(record.time_created);
            store.upsert_metadata(&row).await?;
        }

        Ok(())
    }

    async fn process_items(
        &mut self,
        seeds: &[AttestationRecord],
        versions: &[AttestationRecord],
    ) -> Result<()> {
        let mut fresh_keys = Vec::new();

        for seed in seeds {
            let seed_uid = seed.id.clone();
            let seed_versions: Vec<_> = versions
                .iter()
                .filter(|v| v.ref_uid == seed_uid)
                .cloned()
                .collect();
            // The most recently created version is the one shown. Its
            // latest property set is mirrored before the item hydrates, so
            // re-refreshes pick up attestations newer than the local mirror.
            let latest_version = most_recent(&seed_versions).cloned();
            let remote_version_uid = latest_version.as_ref().map(|v| v.id.clone());
            if let Some(version) = &latest_version {
                let properties = self
                    .ctx
                    .registry
                    .query(RegistryQuery::default().referencing(&version.id))
                    .await?;
                self.mirror_remote_item(&self.model, &seed_uid, version, properties)
                    .await?;
            }

            // Build the fresh item; its hydration resolves or creates
            // the local mirror rows
            let mut fresh = ItemActor::new(self.ctx.clone(), &self.model)?;
            fresh
                .hydrate(ItemInit::Existing {
                    seed_local_id: None,
                    seed_uid: Some(seed_uid.clone()),
                    remote_version_uid,
                })
                .await?;
            let seed_local_id = fresh
                .seed_local_id()
                .unwrap_or_default()
                .to_string();
            let key = item_cache_key(&seed_local_id, Some(&seed_uid));
            fresh_keys.push(key.clone());

            match self.items.get(&key) {
                Some(existing) => {
                    // Merge onto the existing actor so subscribers keep
                    // their object identity; identity fields stay put
                    let snapshot = fresh.snapshot();
                    fresh.unload();
                    existing.lock().await.merge_context(&snapshot.values);
                    trace!(key, "item merged into cache");
                }
                None => {
                    self.items.insert(key.clone(), Arc::new(Mutex::new(fresh)));
                    trace!(key, "item added to cache");
                }
            }
        }

        // Keys missing from the latest fetch represent remote deletion
        let evicted: Vec<String> = self
            .items
            .keys()
            .filter(|k| !fresh_keys.contains(k))
            .cloned()
            .collect();
        for key in &evicted {
            if let Some(item) = self.items.remove(key) {
                item.lock().await.unload();
            }
        }
        if !evicted.is_empty() {
            debug!(model = self.model, count = evicted.len(), "items evicted");
        }

        self.order = fresh_keys;
        Ok(())
    }

    /// Persist the serialized snapshot for crash recovery
    async fn persist_snapshot(&self) -> Result<()> {
        let mut snapshots = Vec::with_capacity(self.order.len());
        for key in &self.order {
            if let Some(item) = self.items.get(key) {
                snapshots.push(item.lock().await.snapshot());
            }
        }
        let serialized = serde_json::to_string(&snapshots)?;
        self.ctx
            .store
            .put_app_state(&snapshot_key(&self.model), &serialized)
            .await
    }

    /// Warm-start the cache from the persisted snapshot, without a remote
    /// refresh
    pub async fn restore_snapshot(&mut self) -> Result<usize> {
        let Some(serialized) = self
            .ctx
            .store
            .get_app_state(&snapshot_key(&self.model))
            .await?
        else {
            return Ok(0);
        };
        let snapshots: Vec<ItemSnapshot> = serde_json::from_str(&serialized)?;

        let mut restored = 0;
        for snapshot in snapshots {
            let mut item = ItemActor::new(self.ctx.clone(), &self.model)?;
            item.hydrate(ItemInit::Existing {
                seed_local_id: Some(snapshot.seed_local_id.clone()),
                seed_uid: snapshot.seed_uid.clone(),
                remote_version_uid: None,
            })
            .await?;
            item.merge_context(&snapshot.values);

            let key = item_cache_key(
                item.seed_local_id().unwrap_or_default(),
                snapshot.seed_uid.as_deref(),
            );
            if !self.items.contains_key(&key) {
                self.order.push(key.clone());
                self.items.insert(key, Arc::new(Mutex::new(item)));
                restored += 1;
            }
        }

        self.state = CollectionState::Idle;
        info!(model = self.model, restored, "collection warm-started from snapshot");
        Ok(restored)
    }

    /// Unload every cached item and clear the map
    pub async fn unload(&mut self) {
        for item in self.items.values() {
            item.lock().await.unload();
        }
        self.items.clear();
        self.order.clear();
        self.state = CollectionState::Uninitialized;
    }
}

/// App-state key holding a model's serialized collection snapshot
pub fn snapshot_key(model: &str) -> String {
    format!("snapshot__{}", model)
}
