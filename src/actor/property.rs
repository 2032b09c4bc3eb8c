//! Property actor
//!
//! Owns one property's value lifecycle: resolving the display value,
//! analyzing writes, and persisting them through the storage strategy the
//! schema classified the property into (scalar, relation, list relation,
//! image, managed blob). Every successful persistence emits a process-wide
//! `item.{model}.{seed_local_id}.property.update` event so the owning item
//! reflects the latest value without polling.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::{value_to_text, EngineContext};
use crate::content::{extension_for_mime, resolve_image_bytes, ImageInput};
use crate::error::{EngineError, Result};
use crate::events::{property_update_topic, EngineEvent};
use crate::schema::{PropertyDescriptor, PropertyKind, ScalarType};
use crate::store::{MetadataRow, now_millis};

/// Bounded attempts when waiting for a not-yet-downloaded storage file
const MAX_REMOTE_STORAGE_CHECKS: u32 = 3;

/// Lifecycle states of a property actor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyState {
    Uninitialized,
    Initializing,
    /// Only entered for managed html/json blobs with a known storage
    /// transaction id
    WaitingForRemoteStorageResolution,
    Idle,
    AnalyzingInput,
    SavingRelation,
    SavingImage,
    SavingItemStorage,
    SavingScalar,
}

/// Events a property actor reacts to
#[derive(Debug, Clone)]
pub enum PropertyEvent {
    Initialize,
    ValueSet(Value),
}

/// One property's value lifecycle and persistence strategy
pub struct PropertyActor {
    ctx: Arc<EngineContext>,
    model: String,
    seed_local_id: String,
    seed_uid: Option<String>,
    version_local_id: String,
    name: String,
    /// None for ad hoc keys absent from the model schema (untyped scalar)
    descriptor: Option<Arc<PropertyDescriptor>>,
    state: PropertyState,
    value: Option<Value>,
    resolved_value: Option<String>,
    resolved_display_value: Option<String>,
    /// Content loaded from a managed local file (html/json documents)
    render_value: Option<String>,
    /// Local id of the metadata row last written or loaded
    metadata_local_id: Option<String>,
}

impl PropertyActor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: Arc<EngineContext>,
        model: impl Into<String>,
        seed_local_id: impl Into<String>,
        seed_uid: Option<String>,
        version_local_id: impl Into<String>,
        name: impl Into<String>,
        descriptor: Option<Arc<PropertyDescriptor>>,
        initial: Option<Value>,
    ) -> Self {
        Self {
            ctx,
            model: model.into(),
            seed_local_id: seed_local_id.into(),
            seed_uid,
            version_local_id: version_local_id.into(),
            name: name.into(),
            descriptor,
            state: PropertyState::Uninitialized,
            value: initial,
            resolved_value: None,
            resolved_display_value: None,
            render_value: None,
            metadata_local_id: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> PropertyState {
        self.state
    }

    /// Resolved display value: render value, then resolved display string,
    /// then resolved value, then the raw stored value
    pub fn value(&self) -> Option<Value> {
        if let Some(render) = &self.render_value {
            return Some(Value::String(render.clone()));
        }
        if let Some(display) = &self.resolved_display_value {
            return Some(Value::String(display.clone()));
        }
        if let Some(resolved) = &self.resolved_value {
            return Some(Value::String(resolved.clone()));
        }
        self.value.clone()
    }

    /// Raw stored value, without display resolution
    pub fn raw_value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    /// Handle one event. Events arriving in a state that does not expect
    /// them are no-ops.
    pub async fn handle(&mut self, event: PropertyEvent) -> Result<()> {
        match (self.state, event) {
            (PropertyState::Uninitialized, PropertyEvent::Initialize) => self.initialize().await,
            (PropertyState::Idle, PropertyEvent::ValueSet(v)) => self.on_value_set(v).await,
            (state, event) => {
                trace!(
                    property = self.name,
                    ?state,
                    ?event,
                    "event ignored in current state"
                );
                Ok(())
            }
        }
    }

    /// Set a new value. No-op when equal to the current value; otherwise
    /// the value is persisted through the property's storage strategy.
    pub async fn set_value(&mut self, value: Value) -> Result<()> {
        self.handle(PropertyEvent::ValueSet(value)).await
    }

    pub async fn init(&mut self) -> Result<()> {
        self.handle(PropertyEvent::Initialize).await
    }

    /// Adopt a value loaded from the store or merged from a refresh,
    /// without persisting or emitting
    pub fn set_loaded_value(&mut self, value: Value) {
        self.value = Some(value);
    }

    /// Adopt resolution metadata from a loaded row
    pub fn set_loaded_row(&mut self, row: &MetadataRow) {
        self.metadata_local_id = Some(row.local_id.clone());
        self.resolved_value = row.ref_resolved_value.clone();
        self.resolved_display_value = row.ref_resolved_display_value.clone();
        if let Some(value) = &row.property_value {
            self.value = Some(Value::String(value.clone()));
        }
    }

    /// Stop reacting to events
    pub fn stop(&mut self) {
        self.state = PropertyState::Uninitialized;
    }

    async fn initialize(&mut self) -> Result<()> {
        self.state = PropertyState::Initializing;

        // Remote-storage resolution applies only to managed html/json
        // documents whose storage transaction is already known
        if let Some(PropertyKind::ManagedBlob {
            data_type,
            storage_dir,
            filename_suffix,
        }) = self.descriptor.as_ref().map(|d| d.kind.clone())
        {
            if data_type.is_document() {
                if let Some(tx_id) = self.ctx.storage_tx_ids.get(&self.seed_local_id, &self.name)
                {
                    self.state = PropertyState::WaitingForRemoteStorageResolution;
                    let filename = format!("{}{}", tx_id, filename_suffix);
                    let mut checks = 0;
                    loop {
                        if let Some(bytes) = self
                            .ctx
                            .files
                            .read_if_present(&storage_dir, &filename)
                            .await?
                        {
                            self.render_value =
                                Some(String::from_utf8_lossy(&bytes).into_owned());
                            debug!(
                                property = self.name,
                                filename, "render value resolved from local file"
                            );
                            break;
                        }
                        checks += 1;
                        if checks >= MAX_REMOTE_STORAGE_CHECKS {
                            debug!(property = self.name, filename, "remote storage file absent");
                            break;
                        }
                        tokio::time::sleep(std::time::Duration::from_millis(
                            self.ctx.config.remote_storage_poll_ms,
                        ))
                        .await;
                    }
                }
            }
        }

        self.state = PropertyState::Idle;
        Ok(())
    }

    async fn on_value_set(&mut self, value: Value) -> Result<()> {
        if self.value.as_ref() == Some(&value) {
            trace!(property = self.name, "value unchanged, skipping persistence");
            return Ok(());
        }

        self.state = PropertyState::AnalyzingInput;
        let kind = self.descriptor.as_ref().map(|d| d.kind.clone());

        let result = match kind {
            Some(PropertyKind::Relation { target_model }) => {
                self.state = PropertyState::SavingRelation;
                self.save_relation(&value, &target_model, None).await
            }
            Some(PropertyKind::ListRelation {
                target_model,
                remote_name,
            }) => {
                self.state = PropertyState::SavingRelation;
                self.save_relation(&value, &target_model, Some(remote_name))
                    .await
            }
            Some(PropertyKind::Image) => {
                self.state = PropertyState::SavingImage;
                self.save_image(&value).await
            }
            Some(PropertyKind::ManagedBlob {
                storage_dir,
                filename_suffix,
                ..
            }) => {
                self.state = PropertyState::SavingItemStorage;
                self.save_item_storage(&value, &storage_dir, &filename_suffix)
                    .await
            }
            Some(PropertyKind::Scalar { data_type }) => {
                self.state = PropertyState::SavingScalar;
                self.save_scalar(&value, data_type).await
            }
            // Ad hoc keys persist as untyped text scalars
            None => {
                self.state = PropertyState::SavingScalar;
                self.save_scalar(&value, ScalarType::Text).await
            }
        };

        match result {
            Ok(()) => {
                self.value = Some(value.clone());
                self.ctx.bus.emit(EngineEvent::PropertyUpdated {
                    topic: property_update_topic(&self.model, &self.seed_local_id),
                    model: self.model.clone(),
                    seed_local_id: self.seed_local_id.clone(),
                    property: self.name.clone(),
                    value,
                });
                self.state = PropertyState::Idle;
                Ok(())
            }
            Err(e) => {
                warn!(property = self.name, error = %e, "property persistence failed");
                self.state = PropertyState::Idle;
                Err(e)
            }
        }
    }

    /// Base row for this property under the current version, reusing the
    /// authoritative row's identity when one exists
    async fn base_row(&self, property_name: &str) -> Result<MetadataRow> {
        let existing = self
            .ctx
            .store
            .latest_metadata(&self.seed_local_id, self.seed_uid.as_deref(), property_name)
            .await?;

        let mut row = match existing {
            Some(row) if row.version_local_id == self.version_local_id => row,
            _ => MetadataRow::new(&self.seed_local_id, &self.version_local_id, property_name),
        };
        row.seed_uid = self.seed_uid.clone();
        row.model = Some(self.model.clone());
        row.eas_data_type = self
            .descriptor
            .as_ref()
            .map(|d| d.eas_data_type.clone())
            .or(row.eas_data_type);
        // A local write dirties the row until the next publish
        row.uid = None;
        row.created_at = now_millis();
        Ok(row)
    }

    async fn save_scalar(&mut self, value: &Value, data_type: ScalarType) -> Result<()> {
        let schema_uid = self
            .ctx
            .schema_uids
            .resolve(&self.name, data_type.declaration(), self.ctx.registry.as_ref())
            .await?;

        let mut row = self.base_row(&self.name.clone()).await?;
        row.property_value = Some(value_to_text(value));
        row.schema_uid = Some(schema_uid);
        self.ctx.store.upsert_metadata(&row).await?;
        self.metadata_local_id = Some(row.local_id);
        Ok(())
    }

    async fn save_relation(
        &mut self,
        value: &Value,
        target_model: &str,
        remote_name: Option<String>,
    ) -> Result<()> {
        let schema_uid = self
            .ctx
            .schema_uids
            .resolve("relation", "relation", self.ctx.registry.as_ref())
            .await?;

        // List relations persist under their remote name; the plural schema
        // key stays the local alias
        let property_name = remote_name.unwrap_or_else(|| self.name.clone());
        let mut row = self.base_row(&property_name).await?;
        row.property_value = Some(value_to_text(value));
        row.schema_uid = Some(schema_uid);
        row.ref_seed_type = Some(target_model.to_string());
        self.ctx.store.upsert_metadata(&row).await?;
        self.metadata_local_id = Some(row.local_id);
        Ok(())
    }

    async fn save_image(&mut self, value: &Value) -> Result<()> {
        let input = parse_image_value(value)?;
        let image = resolve_image_bytes(input, &self.ctx.http).await?;

        // A managed image is its own seed with its own version
        let (image_seed, _image_version) = self
            .ctx
            .store
            .create_seed_with_version("image", None)
            .await?;

        let filename = match image.mime.as_deref().and_then(extension_for_mime) {
            Some(ext) => format!("{}.{}", image_seed.seed_local_id, ext),
            None => image_seed.seed_local_id.clone(),
        };
        self.ctx
            .files
            .write("images", &filename, &image.bytes)
            .await?;
        let url = self.ctx.files.content_url("images", &filename);

        let mut row = self.base_row(&self.name.clone()).await?;
        row.property_value = Some(image_seed.seed_local_id.clone());
        row.ref_seed_type = Some("image".to_string());
        row.ref_value_type = Some("image".to_string());
        row.ref_resolved_value = Some(filename.clone());
        row.ref_resolved_display_value = Some(url.clone());
        row.local_storage_dir = Some("images".to_string());
        self.ctx.store.upsert_metadata(&row).await?;

        self.metadata_local_id = Some(row.local_id);
        self.resolved_value = Some(filename);
        self.resolved_display_value = Some(url);
        debug!(
            property = self.name,
            image_seed = image_seed.seed_local_id,
            "image persisted as related seed"
        );
        Ok(())
    }

    async fn save_item_storage(
        &mut self,
        value: &Value,
        storage_dir: &str,
        filename_suffix: &str,
    ) -> Result<()> {
        if storage_dir.is_empty() {
            return Err(EngineError::NoStorageTarget(self.name.clone()));
        }

        // Resolve the owning row: by local id when known, else by seed and
        // latest version, creating it on first use
        let known = match &self.metadata_local_id {
            Some(local_id) => self.ctx.store.metadata_by_local_id(local_id).await?,
            None => None,
        };
        let mut row = match known {
            Some(row) => row,
            None => {
                let version_local_id = self
                    .ctx
                    .store
                    .latest_version_for_seed(&self.seed_local_id)
                    .await?
                    .map(|v| v.version_local_id)
                    .unwrap_or_else(|| self.version_local_id.clone());
                self.ctx
                    .store
                    .latest_metadata(&self.seed_local_id, self.seed_uid.as_deref(), &self.name)
                    .await?
                    .filter(|r| r.version_local_id == version_local_id)
                    .unwrap_or_else(|| {
                        MetadataRow::new(&self.seed_local_id, &version_local_id, &self.name)
                    })
            }
        };

        let filename = match &row.ref_resolved_value {
            Some(resolved) if !resolved.is_empty() => resolved.clone(),
            _ => {
                let stem = self
                    .seed_uid
                    .clone()
                    .filter(|uid| !uid.is_empty())
                    .unwrap_or_else(|| self.seed_local_id.clone());
                format!("{}{}", stem, filename_suffix)
            }
        };

        let text = value_to_text(value);
        self.ctx
            .files
            .write(storage_dir, &filename, text.as_bytes())
            .await?;

        row.seed_uid = self.seed_uid.clone();
        row.model = Some(self.model.clone());
        row.ref_resolved_value = Some(filename.clone());
        row.local_storage_dir = Some(storage_dir.to_string());
        row.uid = None;
        self.ctx.store.upsert_metadata(&row).await?;

        self.metadata_local_id = Some(row.local_id);
        self.resolved_value = Some(filename);
        self.render_value = Some(text);
        Ok(())
    }
}

/// Interpret a property value as an image byte source: a data URL, a
/// remote URL, or a raw handle `{ "bytes": base64, "mime": ... }`
fn parse_image_value(value: &Value) -> Result<ImageInput> {
    match value {
        Value::String(s) => ImageInput::from_value(s)
            .ok_or_else(|| EngineError::NoImageSource(s.clone())),
        Value::Object(map) => {
            let encoded = map
                .get("bytes")
                .and_then(|v| v.as_str())
                .ok_or_else(|| EngineError::NoImageSource("raw handle without bytes".into()))?;
            use base64::Engine as _;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| EngineError::NoImageSource(format!("base64 decode: {}", e)))?;
            Ok(ImageInput::Raw {
                bytes: bytes.into(),
                mime: map
                    .get("mime")
                    .and_then(|v| v.as_str())
                    .map(String::from),
            })
        }
        other => Err(EngineError::NoImageSource(other.to_string())),
    }
}
