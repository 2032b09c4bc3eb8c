//! Item actor
//!
//! Owns one entity: resolves whether it already exists locally or remotely,
//! hydrates or creates it, and owns one property actor per declared (or ad
//! hoc) property. Subscribers receive the full context snapshot on every
//! property update; `unload` stops the children and removes the bus
//! listener so nothing leaks.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::property::PropertyActor;
use super::EngineContext;
use crate::error::{EngineError, Result};
use crate::events::{property_update_topic, EngineEvent};
use crate::registry::{is_empty_relation, latest_by_schema, RegistryQuery};
use crate::schema::ModelSchema;
use crate::store::{is_empty_id, MetadataRow, now_millis, new_local_id, VersionRow};

/// Lifecycle states of an item actor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Uninitialized,
    WaitingForDb,
    Initializing,
    HydratingExistingItem,
    HydratingNewItem,
    FetchingDataFromRemote,
    SavingDataToDb,
    Ready,
}

/// How an item actor is constructed
#[derive(Debug, Clone)]
pub enum ItemInit {
    /// Brand new item from a full set of initial property values
    New { values: Map<String, Value> },
    /// Existing item identified by its id pair; `remote_version_uid` is set
    /// when the caller already knows the latest published version
    Existing {
        seed_local_id: Option<String>,
        seed_uid: Option<String>,
        remote_version_uid: Option<String>,
    },
}

/// Full context snapshot delivered to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemSnapshot {
    pub model: String,
    pub seed_local_id: String,
    pub seed_uid: Option<String>,
    pub values: Map<String, Value>,
}

/// One entity's identity, hydration, and property set
pub struct ItemActor {
    ctx: Arc<EngineContext>,
    model: String,
    schema: Arc<ModelSchema>,
    state: ItemState,
    seed_local_id: Option<String>,
    seed_uid: Option<String>,
    version_local_id: Option<String>,
    version_uid: Option<String>,
    properties: HashMap<String, PropertyActor>,
    snapshot_tx: Option<watch::Sender<ItemSnapshot>>,
    forwarder: Option<JoinHandle<()>>,
}

impl ItemActor {
    pub fn new(ctx: Arc<EngineContext>, model: &str) -> Result<Self> {
        let schema = ctx.schemas.model(model)?;
        Ok(Self {
            ctx,
            model: model.to_lowercase(),
            schema,
            state: ItemState::Uninitialized,
            seed_local_id: None,
            seed_uid: None,
            version_local_id: None,
            version_uid: None,
            properties: HashMap::new(),
            snapshot_tx: None,
            forwarder: None,
        })
    }

    pub fn state(&self) -> ItemState {
        self.state
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn seed_local_id(&self) -> Option<&str> {
        self.seed_local_id.as_deref()
    }

    pub fn seed_uid(&self) -> Option<&str> {
        self.seed_uid.as_deref()
    }

    pub fn version_local_id(&self) -> Option<&str> {
        self.version_local_id.as_deref()
    }

    /// Name → property actor map
    pub fn properties(&self) -> &HashMap<String, PropertyActor> {
        &self.properties
    }

    /// Drive the actor from `Uninitialized` to `Ready`
    pub async fn hydrate(&mut self, init: ItemInit) -> Result<()> {
        if self.state != ItemState::Uninitialized {
            trace!(model = self.model, state = ?self.state, "hydrate ignored");
            return Ok(());
        }

        self.state = ItemState::WaitingForDb;
        self.ctx.db_ready.wait().await;

        self.state = ItemState::Initializing;
        let (initial_values, is_new) = match init {
            ItemInit::New { values } => {
                self.state = ItemState::HydratingNewItem;
                self.hydrate_new().await?;
                (values, true)
            }
            ItemInit::Existing {
                seed_local_id,
                seed_uid,
                remote_version_uid,
            } => {
                self.state = ItemState::HydratingExistingItem;
                let loaded = self
                    .hydrate_existing(seed_local_id, seed_uid, remote_version_uid)
                    .await?;
                (loaded, false)
            }
        };

        // New-item values must flow through the persistence path below, so
        // the actors start empty; loaded values seed the actors directly
        self.build_property_actors(&initial_values, is_new).await?;

        let snapshot = self.current_snapshot();
        let (tx, _rx) = watch::channel(snapshot);
        self.spawn_forwarder(&tx);
        self.snapshot_tx = Some(tx);

        // Initial values of a new item are real edits and must persist
        if is_new {
            for (name, value) in initial_values {
                if let Some(actor) = self.properties.get_mut(&name) {
                    actor.set_value(value).await?;
                }
            }
        }

        self.state = ItemState::Ready;
        debug!(
            model = self.model,
            seed_local_id = self.seed_local_id.as_deref().unwrap_or(""),
            "item ready"
        );
        Ok(())
    }

    async fn hydrate_new(&mut self) -> Result<()> {
        let (seed, version) = self
            .ctx
            .store
            .create_seed_with_version(&self.model, None)
            .await?;
        self.seed_local_id = Some(seed.seed_local_id);
        self.seed_uid = seed.seed_uid;
        self.version_local_id = Some(version.version_local_id);
        Ok(())
    }

    async fn hydrate_existing(
        &mut self,
        seed_local_id: Option<String>,
        seed_uid: Option<String>,
        remote_version_uid: Option<String>,
    ) -> Result<Map<String, Value>> {
        if is_empty_id(seed_uid.as_deref()) && is_empty_id(seed_local_id.as_deref()) {
            return Err(EngineError::NotFound(
                "existing item needs a seed uid or local id".into(),
            ));
        }

        // Identity resolution: uid hit preferred over local-id hit
        let seed = self
            .ctx
            .store
            .find_seed(seed_uid.as_deref(), seed_local_id.as_deref())
            .await?;

        match seed {
            Some(seed) => {
                self.seed_local_id = Some(seed.seed_local_id.clone());
                self.seed_uid = seed.seed_uid.or(seed_uid);
                match self
                    .ctx
                    .store
                    .latest_version_for_seed(&seed.seed_local_id)
                    .await?
                {
                    Some(version) => {
                        self.version_local_id = Some(version.version_local_id);
                        self.version_uid = version.version_uid;
                    }
                    None => {
                        // A seed without a version should not exist; repair
                        // in place rather than failing hydration
                        let version = VersionRow {
                            version_local_id: new_local_id(),
                            version_uid: None,
                            seed_local_id: seed.seed_local_id.clone(),
                            seed_uid: self.seed_uid.clone(),
                            created_at: now_millis(),
                        };
                        self.ctx.store.insert_version(&version).await?;
                        self.version_local_id = Some(version.version_local_id);
                    }
                }
            }
            None => {
                // Remote discovery with no local mirror yet
                let (seed, version) = self
                    .ctx
                    .store
                    .create_seed_with_version(&self.model, seed_uid.as_deref())
                    .await?;
                self.seed_local_id = Some(seed.seed_local_id);
                self.seed_uid = seed.seed_uid;
                self.version_local_id = Some(version.version_local_id);
            }
        }

        // A known remote version with no local mirror means the property
        // attestations have to be pulled down before the item is usable
        if let Some(remote_uid) = remote_version_uid {
            let mirrored = self.ctx.store.find_version_by_uid(&remote_uid).await?;
            if mirrored.is_none() {
                self.fetch_remote_properties(&remote_uid).await?;
            } else if let Some(version) = mirrored {
                self.version_local_id = Some(version.version_local_id);
                self.version_uid = version.version_uid;
            }
        }

        // Loaded values seed the property actors
        let mut values = Map::new();
        if let Some(version_local_id) = &self.version_local_id {
            for row in self.ctx.store.metadata_for_version(version_local_id).await? {
                if let Some(value) = &row.property_value {
                    values.insert(row.property_name.clone(), Value::String(value.clone()));
                }
            }
        }
        Ok(values)
    }

    async fn fetch_remote_properties(&mut self, remote_version_uid: &str) -> Result<()> {
        self.state = ItemState::FetchingDataFromRemote;
        let records = self
            .ctx
            .registry
            .query(RegistryQuery::default().referencing(remote_version_uid))
            .await?;

        // The degenerate empty-relation marker is noise, not data
        let records: Vec<_> = records
            .into_iter()
            .filter(|r| {
                r.field("value")
                    .map(|v| !is_empty_relation(&v))
                    .unwrap_or(true)
            })
            .collect();

        // Within each schema group the newest attestation is authoritative
        let latest = latest_by_schema(records);

        self.state = ItemState::SavingDataToDb;
        let seed_local_id = self
            .seed_local_id
            .clone()
            .ok_or_else(|| EngineError::NotFound("seed not hydrated".into()))?;

        // Mirror the remote version locally
        let version_local_id = match self.ctx.store.find_version_by_uid(remote_version_uid).await? {
            Some(v) => v.version_local_id,
            None => {
                let version = VersionRow {
                    version_local_id: new_local_id(),
                    version_uid: Some(remote_version_uid.to_string()),
                    seed_local_id: seed_local_id.clone(),
                    seed_uid: self.seed_uid.clone(),
                    created_at: now_millis(),
                };
                self.ctx.store.insert_version(&version).await?;
                version.version_local_id
            }
        };

        for record in latest.values() {
            let mut row = MetadataRow::new(
                &seed_local_id,
                &version_local_id,
                &record.field("name").unwrap_or_else(|| record.schema_id.clone()),
            );
            row.uid = Some(record.id.clone());
            row.property_value = record.field("value");
            row.schema_uid = Some(record.schema_id.clone());
            row.seed_uid = self.seed_uid.clone();
            row.version_uid = Some(remote_version_uid.to_string());
            row.model = Some(self.model.clone());
            row.attestation_created_at = Some(record.time_created);
            self.ctx.store.upsert_metadata(&row).await?;
        }

        self.version_local_id = Some(version_local_id);
        self.version_uid = Some(remote_version_uid.to_string());
        debug!(
            model = self.model,
            version_uid = remote_version_uid,
            count = latest.len(),
            "remote properties mirrored"
        );
        Ok(())
    }

    async fn build_property_actors(
        &mut self,
        initial: &Map<String, Value>,
        defer_initial: bool,
    ) -> Result<()> {
        let seed_local_id = self
            .seed_local_id
            .clone()
            .ok_or_else(|| EngineError::NotFound("seed not hydrated".into()))?;
        let version_local_id = self
            .version_local_id
            .clone()
            .ok_or_else(|| EngineError::NotFound("version not hydrated".into()))?;

        // Every declared property gets a typed actor
        let declared: Vec<_> = self.schema.properties.values().cloned().collect();
        for descriptor in declared {
            let loaded = self
                .ctx
                .store
                .latest_metadata(
                    &seed_local_id,
                    self.seed_uid.as_deref(),
                    descriptor.remote_name(),
                )
                .await?;

            let mut actor = PropertyActor::new(
                self.ctx.clone(),
                self.model.clone(),
                seed_local_id.clone(),
                self.seed_uid.clone(),
                version_local_id.clone(),
                descriptor.name.clone(),
                Some(descriptor.clone()),
                if defer_initial {
                    None
                } else {
                    initial.get(&descriptor.name).cloned()
                },
            );
            if let Some(row) = &loaded {
                actor.set_loaded_row(row);
            }
            actor.init().await?;
            self.properties.insert(descriptor.name.clone(), actor);
        }

        // Ad hoc keys on the payload get untyped actors. Remote aliases of
        // declared list relations are not ad hoc.
        let remote_aliases: Vec<String> = self
            .schema
            .properties
            .values()
            .map(|d| d.remote_name().to_string())
            .collect();
        for (name, value) in initial {
            if self.properties.contains_key(name)
                || is_identity_key(name)
                || remote_aliases.contains(name)
            {
                continue;
            }
            let mut actor = PropertyActor::new(
                self.ctx.clone(),
                self.model.clone(),
                seed_local_id.clone(),
                self.seed_uid.clone(),
                version_local_id.clone(),
                name.clone(),
                None,
                if defer_initial {
                    None
                } else {
                    Some(value.clone())
                },
            );
            actor.init().await?;
            self.properties.insert(name.clone(), actor);
        }

        Ok(())
    }

    fn spawn_forwarder(&mut self, tx: &watch::Sender<ItemSnapshot>) {
        let topic = property_update_topic(
            &self.model,
            self.seed_local_id.as_deref().unwrap_or_default(),
        );
        let mut rx = self.ctx.bus.subscribe();
        let tx = tx.clone();
        self.forwarder = Some(tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                if let EngineEvent::PropertyUpdated {
                    topic: event_topic,
                    property,
                    value,
                    ..
                } = event
                {
                    if event_topic == topic {
                        tx.send_modify(|snapshot| {
                            snapshot.values.insert(property, value);
                        });
                    }
                }
            }
        }));
    }

    fn current_snapshot(&self) -> ItemSnapshot {
        let mut values = Map::new();
        for (name, actor) in &self.properties {
            if let Some(value) = actor.value() {
                values.insert(name.clone(), value);
            }
        }
        ItemSnapshot {
            model: self.model.clone(),
            seed_local_id: self.seed_local_id.clone().unwrap_or_default(),
            seed_uid: self.seed_uid.clone(),
            values,
        }
    }

    /// Subscribe to full context snapshots; one is delivered immediately
    /// and on every property update thereafter
    pub fn subscribe(&self) -> Option<watch::Receiver<ItemSnapshot>> {
        self.snapshot_tx.as_ref().map(|tx| tx.subscribe())
    }

    /// Current context snapshot
    pub fn snapshot(&self) -> ItemSnapshot {
        match &self.snapshot_tx {
            Some(tx) => tx.borrow().clone(),
            None => self.current_snapshot(),
        }
    }

    /// Write one property. Unknown names are a schema error.
    pub async fn set_property(&mut self, name: &str, value: Value) -> Result<()> {
        let model = self.model.clone();
        let actor = self
            .properties
            .get_mut(name)
            .ok_or_else(|| EngineError::MissingDescriptor {
                model,
                property: name.to_string(),
            })?;
        actor.set_value(value.clone()).await?;

        if let Some(tx) = &self.snapshot_tx {
            tx.send_modify(|snapshot| {
                snapshot.values.insert(name.to_string(), value);
            });
        }
        Ok(())
    }

    /// Metadata rows with no registry uid: unpublished or dirty
    pub async fn get_edited_properties(&self) -> Result<Vec<MetadataRow>> {
        match &self.seed_local_id {
            Some(seed_local_id) => self.ctx.store.edited_properties(seed_local_id).await,
            None => Ok(Vec::new()),
        }
    }

    /// Merge fields from a freshly fetched item onto this actor's context.
    /// Identity fields are immutable once set; object identity is preserved
    /// for subscribers.
    pub fn merge_context(&mut self, values: &Map<String, Value>) {
        for (name, value) in values {
            if is_identity_key(name) {
                continue;
            }
            if let Some(actor) = self.properties.get_mut(name) {
                actor.set_loaded_value(value.clone());
            }
            if let Some(tx) = &self.snapshot_tx {
                tx.send_modify(|snapshot| {
                    snapshot.values.insert(name.clone(), value.clone());
                });
            }
        }
    }

    /// Soft-mark the underlying seed; the item stays recoverable
    pub async fn mark_for_deletion(&self) -> Result<()> {
        match &self.seed_local_id {
            Some(seed_local_id) => self.ctx.store.mark_seed_for_deletion(seed_local_id).await,
            None => Ok(()),
        }
    }

    /// Stop every child property actor and remove the update listener
    pub fn unload(&mut self) {
        for actor in self.properties.values_mut() {
            actor.stop();
        }
        if let Some(handle) = self.forwarder.take() {
            handle.abort();
        }
        self.state = ItemState::Uninitialized;
    }
}

impl Drop for ItemActor {
    fn drop(&mut self) {
        if let Some(handle) = self.forwarder.take() {
            handle.abort();
        }
    }
}

fn is_identity_key(name: &str) -> bool {
    name == "seedLocalId" || name == "seedUid"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::tests_support::{test_context, test_context_with, MockRegistry};
    use crate::registry::{AttestationRecord, EMPTY_RELATION_SENTINEL};
    use serde_json::json;

    fn values(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_new_item_reaches_ready_with_fresh_identity() {
        let ctx = test_context().await;
        let mut item = ItemActor::new(ctx.clone(), "book").unwrap();
        item.hydrate(ItemInit::New {
            values: values(&[("title", json!("Dune"))]),
        })
        .await
        .unwrap();

        assert_eq!(item.state(), ItemState::Ready);
        let seed_local_id = item.seed_local_id().unwrap().to_string();
        assert!(item.seed_uid().is_none());

        // Exactly one version row exists for the fresh seed
        let version = ctx
            .store
            .latest_version_for_seed(&seed_local_id)
            .await
            .unwrap();
        assert!(version.is_some());

        // The initial value was persisted as an edit
        let edited = item.get_edited_properties().await.unwrap();
        assert!(edited.iter().any(|r| r.property_name == "title"));
    }

    #[tokio::test]
    async fn test_existing_item_resolves_identity_by_uid_first() {
        let ctx = test_context().await;

        let (seed, _) = ctx.store.create_seed_with_version("book", Some("0xseed")).await.unwrap();

        let mut item = ItemActor::new(ctx.clone(), "book").unwrap();
        item.hydrate(ItemInit::Existing {
            seed_local_id: Some("bogus-local".into()),
            seed_uid: Some("0xseed".into()),
            remote_version_uid: None,
        })
        .await
        .unwrap();

        assert_eq!(item.seed_local_id(), Some(seed.seed_local_id.as_str()));
        assert_eq!(item.seed_uid(), Some("0xseed"));
    }

    #[tokio::test]
    async fn test_seed_without_version_is_repaired_on_hydration() {
        use crate::store::SeedRow;

        let ctx = test_context().await;
        // A seed row with no version, as an interrupted write could leave
        let seed = SeedRow {
            seed_local_id: "orphan-1".into(),
            seed_uid: None,
            model: "book".into(),
            marked_for_deletion: false,
            created_at: now_millis(),
        };
        ctx.store.insert_seed(&seed).await.unwrap();

        let mut item = ItemActor::new(ctx.clone(), "book").unwrap();
        item.hydrate(ItemInit::Existing {
            seed_local_id: Some("orphan-1".into()),
            seed_uid: None,
            remote_version_uid: None,
        })
        .await
        .unwrap();

        assert_eq!(item.state(), ItemState::Ready);
        assert!(item.version_local_id().is_some());
        let version = ctx
            .store
            .latest_version_for_seed("orphan-1")
            .await
            .unwrap()
            .expect("repair created a version");
        assert!(version.version_uid.is_none());
    }

    #[tokio::test]
    async fn test_remote_fetch_keeps_latest_attestation_per_schema() {
        let registry = Arc::new(MockRegistry::default());
        registry
            .push(AttestationRecord {
                id: "0xold".into(),
                schema_id: "0xschema-string".into(),
                ref_uid: "0xversion".into(),
                time_created: 100,
                decoded_data_json: r#"{"name":"title","value":"old"}"#.into(),
                revoked: false,
            })
            .await;
        registry
            .push(AttestationRecord {
                id: "0xnew".into(),
                schema_id: "0xschema-string".into(),
                ref_uid: "0xversion".into(),
                time_created: 200,
                decoded_data_json: r#"{"name":"title","value":"new"}"#.into(),
                revoked: false,
            })
            .await;
        let ctx = test_context_with(registry).await;

        let mut item = ItemActor::new(ctx.clone(), "book").unwrap();
        item.hydrate(ItemInit::Existing {
            seed_local_id: None,
            seed_uid: Some("0xseed".into()),
            remote_version_uid: Some("0xversion".into()),
        })
        .await
        .unwrap();

        let row = ctx
            .store
            .latest_metadata(item.seed_local_id().unwrap(), Some("0xseed"), "title")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.property_value.as_deref(), Some("new"));
        assert_eq!(row.uid.as_deref(), Some("0xnew"));
        assert_eq!(row.attestation_created_at, Some(200));
    }

    #[tokio::test]
    async fn test_remote_fetch_skips_empty_relation_sentinel() {
        let registry = Arc::new(MockRegistry::default());
        registry
            .push(AttestationRecord {
                id: "0xrel".into(),
                schema_id: "0xschema-relation".into(),
                ref_uid: "0xversion".into(),
                time_created: 100,
                decoded_data_json: format!(
                    r#"{{"name":"author","value":"{}"}}"#,
                    EMPTY_RELATION_SENTINEL
                ),
                revoked: false,
            })
            .await;
        let ctx = test_context_with(registry).await;

        let mut item = ItemActor::new(ctx.clone(), "book").unwrap();
        item.hydrate(ItemInit::Existing {
            seed_local_id: None,
            seed_uid: Some("0xseed".into()),
            remote_version_uid: Some("0xversion".into()),
        })
        .await
        .unwrap();

        let row = ctx
            .store
            .latest_metadata(item.seed_local_id().unwrap(), Some("0xseed"), "author")
            .await
            .unwrap();
        assert!(row.is_none(), "sentinel relation must not be mirrored");
    }

    #[tokio::test]
    async fn test_ad_hoc_property_gets_untyped_actor() {
        let ctx = test_context().await;
        let mut item = ItemActor::new(ctx, "book").unwrap();
        item.hydrate(ItemInit::New {
            values: values(&[("title", json!("Dune")), ("customNote", json!("mine"))]),
        })
        .await
        .unwrap();

        assert!(item.properties().contains_key("customNote"));
        assert!(item.properties().contains_key("title"));
        // Declared but unset properties exist too
        assert!(item.properties().contains_key("pages"));
    }

    #[tokio::test]
    async fn test_subscribe_sees_property_updates() {
        let ctx = test_context().await;
        let mut item = ItemActor::new(ctx, "book").unwrap();
        item.hydrate(ItemInit::New {
            values: Map::new(),
        })
        .await
        .unwrap();

        let rx = item.subscribe().unwrap();
        item.set_property("title", json!("Heretics of Dune"))
            .await
            .unwrap();

        assert_eq!(
            rx.borrow().values.get("title"),
            Some(&json!("Heretics of Dune"))
        );
    }

    #[tokio::test]
    async fn test_merge_context_preserves_identity_fields() {
        let ctx = test_context().await;
        let mut item = ItemActor::new(ctx, "book").unwrap();
        item.hydrate(ItemInit::New {
            values: values(&[("title", json!("Dune"))]),
        })
        .await
        .unwrap();
        let original_id = item.seed_local_id().unwrap().to_string();

        let mut incoming = Map::new();
        incoming.insert("seedLocalId".to_string(), json!("other-id"));
        incoming.insert("seedUid".to_string(), json!("0xother"));
        incoming.insert("title".to_string(), json!("Dune (revised)"));
        item.merge_context(&incoming);

        assert_eq!(item.seed_local_id(), Some(original_id.as_str()));
        assert!(item.seed_uid().is_none());
        assert_eq!(
            item.snapshot().values.get("title"),
            Some(&json!("Dune (revised)"))
        );
    }

    #[tokio::test]
    async fn test_unload_stops_children_and_listener() {
        let ctx = test_context().await;
        let mut item = ItemActor::new(ctx.clone(), "book").unwrap();
        item.hydrate(ItemInit::New { values: Map::new() }).await.unwrap();

        let receivers_before = ctx.bus.receiver_count();
        assert!(receivers_before >= 1);

        item.unload();
        assert_eq!(item.state(), ItemState::Uninitialized);

        // Writes after unload are ignored by the stopped children
        let err = item.set_property("title", json!("late")).await;
        assert!(err.is_ok());
        assert!(item
            .get_edited_properties()
            .await
            .unwrap()
            .iter()
            .all(|r| r.property_name != "title"));
    }
}
