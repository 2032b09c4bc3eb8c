//! Publish actor
//!
//! Walks an item's edited properties, uploads pending binary content, and
//! assembles the registry payloads needed to publish the item. Related
//! items that have not been published yet are assembled first, depth-first:
//! a relation attestation referencing a not-yet-existing target is
//! meaningless to registry consumers, so dependency payloads always precede
//! their dependents. Submission itself belongs to the external collaborator.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::EngineContext;
use crate::content::{UploadHandle, FILE_SEPARATOR};
use crate::error::{EngineError, Result};
use crate::schema::PropertyKind;
use crate::store::MetadataRow;

/// Lifecycle states of a publish pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishState {
    Idle,
    ValidatingItemData,
    CreatingPublishAttempt,
    Uploading,
    PreparingPublishRequestData,
    Publishing,
}

/// One property attestation awaiting submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationDraft {
    pub metadata_local_id: String,
    pub property_name: String,
    pub schema_uid: Option<String>,
    pub value: Option<String>,
    pub ref_seed_type: Option<String>,
}

/// Registry payload for one item, dependencies excluded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishPayload {
    pub local_id: String,
    pub seed_uid: Option<String>,
    pub seed_is_revocable: bool,
    pub seed_schema_uid: String,
    pub version_schema_uid: String,
    pub version_uid: Option<String>,
    pub attestations: Vec<AttestationDraft>,
}

/// Assembles publish payloads for an item and its unpublished dependencies
pub struct PublishActor {
    ctx: Arc<EngineContext>,
    state: PublishState,
    uploads: Vec<UploadHandle>,
}

impl PublishActor {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            ctx,
            state: PublishState::Idle,
            uploads: Vec::new(),
        }
    }

    pub fn state(&self) -> PublishState {
        self.state
    }

    /// Signed-but-unsubmitted content transactions from the last pass
    pub fn uploads(&self) -> &[UploadHandle] {
        &self.uploads
    }

    /// Produce the ordered payload list for an item: every unpublished
    /// dependency first, the item itself last
    pub async fn publish(&mut self, seed_local_id: &str) -> Result<Vec<PublishPayload>> {
        self.uploads.clear();
        let attempt_id = Uuid::new_v4().to_string();
        info!(attempt_id, seed_local_id, "publish attempt started");

        let mut payloads = Vec::new();
        let mut visited = HashSet::new();
        self.assemble(seed_local_id.to_string(), &mut payloads, &mut visited)
            .await?;

        self.state = PublishState::Publishing;
        info!(
            attempt_id,
            payloads = payloads.len(),
            uploads = self.uploads.len(),
            "publish payloads assembled"
        );
        Ok(payloads)
    }

    fn assemble<'a>(
        &'a mut self,
        seed_local_id: String,
        payloads: &'a mut Vec<PublishPayload>,
        visited: &'a mut HashSet<String>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if !visited.insert(seed_local_id.clone()) {
                return Ok(());
            }

            self.state = PublishState::ValidatingItemData;
            let seed = self
                .ctx
                .store
                .find_seed(None, Some(&seed_local_id))
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("seed {}", seed_local_id)))?;
            let schema = self.ctx.schemas.model(&seed.model)?;

            self.state = PublishState::CreatingPublishAttempt;
            let version = self
                .ctx
                .store
                .latest_version_for_seed(&seed_local_id)
                .await?
                .ok_or_else(|| {
                    EngineError::NotFound(format!("version for seed {}", seed_local_id))
                })?;

            self.state = PublishState::Uploading;
            let rows = self
                .ctx
                .store
                .metadata_for_version(&version.version_local_id)
                .await?;
            self.upload_pending_content(&schema.name, &rows).await?;

            self.state = PublishState::PreparingPublishRequestData;
            let seed_schema_uid = self
                .ctx
                .schema_uids
                .resolve(&seed.model, &seed.model, self.ctx.registry.as_ref())
                .await?;
            let version_schema_uid = self
                .ctx
                .schema_uids
                .resolve("version", "version", self.ctx.registry.as_ref())
                .await?;

            let edited = self.ctx.store.edited_properties(&seed_local_id).await?;

            // Unpublished relation targets are assembled first
            for row in &edited {
                let Some(_target_model) = relation_target(row) else {
                    continue;
                };
                for target_id in relation_ids(row) {
                    let target = self
                        .ctx
                        .store
                        .find_seed(Some(&target_id), Some(&target_id))
                        .await?
                        .ok_or_else(|| EngineError::NoRelatedItem {
                            property: row.property_name.clone(),
                            value: target_id.clone(),
                        })?;
                    if target.seed_uid.is_none() {
                        debug!(
                            property = row.property_name,
                            target = target.seed_local_id,
                            "descending into unpublished relation target"
                        );
                        self.assemble(target.seed_local_id.clone(), payloads, visited)
                            .await?;
                    }
                }
            }

            let attestations = edited
                .iter()
                .map(|row| AttestationDraft {
                    metadata_local_id: row.local_id.clone(),
                    property_name: row.property_name.clone(),
                    schema_uid: row.schema_uid.clone(),
                    value: row.property_value.clone(),
                    ref_seed_type: row.ref_seed_type.clone(),
                })
                .collect();

            payloads.push(PublishPayload {
                local_id: seed_local_id,
                seed_uid: seed.seed_uid,
                seed_is_revocable: false,
                seed_schema_uid,
                version_schema_uid,
                version_uid: version.version_uid,
                attestations,
            });
            Ok(())
        })
    }

    /// Upload pending binary content: one composite transaction for the
    /// item-storage group, one transaction per managed image
    async fn upload_pending_content(&mut self, model: &str, rows: &[MetadataRow]) -> Result<()> {
        let schema = self.ctx.schemas.model(model)?;

        // Item-storage children concatenate into one composite upload,
        // each chunk prefixed by its property name
        let mut composite_chunks: Vec<(String, Vec<u8>)> = Vec::new();
        for row in rows {
            let Some(descriptor) = schema.property(&row.property_name) else {
                continue;
            };
            if !matches!(descriptor.kind, PropertyKind::ManagedBlob { .. }) {
                continue;
            }
            let (Some(dir), Some(filename)) =
                (row.local_storage_dir.as_deref(), row.ref_resolved_value.as_deref())
            else {
                continue;
            };
            if let Some(bytes) = self.ctx.files.read_if_present(dir, filename).await? {
                composite_chunks.push((row.property_name.clone(), bytes));
            }
        }

        if !composite_chunks.is_empty() {
            let mut composite = Vec::new();
            for (i, (name, bytes)) in composite_chunks.iter().enumerate() {
                if i > 0 {
                    composite.extend_from_slice(FILE_SEPARATOR.as_bytes());
                }
                composite.extend_from_slice(name.as_bytes());
                composite.push(b'\n');
                composite.extend_from_slice(bytes);
            }
            let handle = self.create_tagged_upload(composite).await?;
            // Children share the composite's storage transaction
            for row in rows {
                if composite_chunks.iter().any(|(name, _)| *name == row.property_name) {
                    self.ctx
                        .storage_tx_ids
                        .put(&row.seed_local_id, &row.property_name, handle.id.clone());
                }
            }
            self.uploads.push(handle);
        }

        // Managed images upload individually
        for row in rows {
            let is_image = row.ref_value_type.as_deref() == Some("image");
            if !is_image {
                continue;
            }
            let (Some(dir), Some(filename)) =
                (row.local_storage_dir.as_deref(), row.ref_resolved_value.as_deref())
            else {
                continue;
            };
            if let Some(bytes) = self.ctx.files.read_if_present(dir, filename).await? {
                let handle = self.create_tagged_upload(bytes).await?;
                self.ctx
                    .storage_tx_ids
                    .put(&row.seed_local_id, &row.property_name, handle.id.clone());
                self.uploads.push(handle);
            }
        }

        Ok(())
    }

    /// Create and sign a content transaction tagged with the SHA-256 of
    /// its final bytes, for later deduplication. Not submitted.
    async fn create_tagged_upload(&mut self, bytes: Vec<u8>) -> Result<UploadHandle> {
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let content_hash = hex::encode(hasher.finalize());

        let mut handle = self.ctx.content.create_transaction(bytes.into()).await?;
        self.ctx
            .content
            .add_tag(&mut handle, "Content-SHA-256", &content_hash)
            .await?;
        self.ctx.content.sign(&mut handle).await?;
        debug!(tx = handle.id, hash = content_hash, "content transaction prepared");
        Ok(handle)
    }
}

/// Relation target model of a metadata row, if it represents a relation
fn relation_target(row: &MetadataRow) -> Option<&str> {
    match row.ref_seed_type.as_deref() {
        Some("image") | None => None,
        Some(target) => Some(target),
    }
}

/// Related ids stored in a relation row: one id, or a JSON array for lists
fn relation_ids(row: &MetadataRow) -> Vec<String> {
    let Some(raw) = row.property_value.as_deref() else {
        return Vec::new();
    };
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Array(items)) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        _ => vec![raw.to_string()],
    }
}
