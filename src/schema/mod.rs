//! Model schemas and property classification
//!
//! Schemas are static input: per model, a map from property name to a raw
//! type descriptor produced by external tooling. Each descriptor is
//! classified ONCE at load time into a closed [`PropertyKind`], so actors
//! dispatch on a tagged variant instead of re-deriving the storage strategy
//! from descriptor shape on every write.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::registry::RegistryClient;

/// Marker value in `ref_value_type`/`data_type` identifying image-backed
/// properties
pub const IMAGE_SENTINEL: &str = "image";

/// Storage-type marker for blobs co-versioned with the owning item
pub const ITEM_STORAGE: &str = "ItemStorage";

/// Declared primitive type of a scalar property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarType {
    Text,
    Number,
    Boolean,
    Html,
    Json,
}

impl ScalarType {
    fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "number" => ScalarType::Number,
            "boolean" | "bool" => ScalarType::Boolean,
            "html" => ScalarType::Html,
            "json" => ScalarType::Json,
            _ => ScalarType::Text,
        }
    }

    /// Registry-side primitive declaration for this scalar type
    pub fn declaration(&self) -> &'static str {
        match self {
            ScalarType::Text | ScalarType::Html | ScalarType::Json => "string",
            ScalarType::Number => "uint256",
            ScalarType::Boolean => "bool",
        }
    }

    /// Whether values of this type are rendered from a managed file
    pub fn is_document(&self) -> bool {
        matches!(self, ScalarType::Html | ScalarType::Json)
    }
}

/// Storage strategy of one property, resolved at schema load
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyKind {
    /// Plain value persisted as a metadata row
    Scalar { data_type: ScalarType },

    /// Single reference to another model's item
    Relation { target_model: String },

    /// Collection of references; the remote property name follows the
    /// `{singular}{TargetModel}Ids` convention while the local alias stays
    /// the plural schema key
    ListRelation {
        target_model: String,
        remote_name: String,
    },

    /// Binary content managed as a related image seed
    Image,

    /// Blob owned and versioned alongside the item itself
    ManagedBlob {
        data_type: ScalarType,
        storage_dir: String,
        filename_suffix: String,
    },
}

/// Raw descriptor shape as produced by the schema tooling
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPropertyDescriptor {
    #[serde(default)]
    pub data_type: Option<String>,
    #[serde(default)]
    pub ref_value_type: Option<String>,
    #[serde(default)]
    pub storage_type: Option<String>,
    /// Target model for relation properties
    #[serde(default)]
    pub relation_model: Option<String>,
    /// Marks a relation collection
    #[serde(default)]
    pub list: bool,
    #[serde(default)]
    pub local_storage_dir: Option<String>,
    #[serde(default)]
    pub filename_suffix: Option<String>,
}

/// One classified property of a model schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyDescriptor {
    pub name: String,
    pub kind: PropertyKind,
    /// Declared primitive type string carried into metadata rows
    pub eas_data_type: String,
}

impl PropertyDescriptor {
    /// Property name used on the remote side (differs for list relations)
    pub fn remote_name(&self) -> &str {
        match &self.kind {
            PropertyKind::ListRelation { remote_name, .. } => remote_name,
            _ => &self.name,
        }
    }
}

fn is_image_marker(value: &Option<String>) -> bool {
    value
        .as_deref()
        .map(|v| v.eq_ignore_ascii_case(IMAGE_SENTINEL) || v.eq_ignore_ascii_case("imagesrc"))
        .unwrap_or(false)
}

/// Trim one trailing `s` from a plural property name
pub fn singularize(name: &str) -> &str {
    name.strip_suffix('s').unwrap_or(name)
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Remote property name for a list relation: `{singular}{TargetModel}Ids`
pub fn list_remote_name(property: &str, target_model: &str) -> String {
    format!("{}{}Ids", singularize(property), capitalize(target_model))
}

/// Classify one raw descriptor. Dispatch priority mirrors how writes are
/// routed: relation before image before item-storage before scalar.
pub fn classify(name: &str, raw: &RawPropertyDescriptor) -> Result<PropertyKind> {
    // (1) plain relation, unless the ref value type is the image marker
    if let Some(target) = &raw.relation_model {
        if !is_image_marker(&raw.ref_value_type) {
            let target_model = target.to_lowercase();
            return Ok(if raw.list {
                PropertyKind::ListRelation {
                    remote_name: list_remote_name(name, &target_model),
                    target_model,
                }
            } else {
                PropertyKind::Relation { target_model }
            });
        }
    }

    // (2) image marker in either position
    if is_image_marker(&raw.ref_value_type) || is_image_marker(&raw.data_type) {
        return Ok(PropertyKind::Image);
    }

    // (3) blob co-versioned with the item
    if raw.storage_type.as_deref() == Some(ITEM_STORAGE) {
        let data_type = ScalarType::parse(raw.data_type.as_deref().unwrap_or("text"));
        let storage_dir = raw
            .local_storage_dir
            .clone()
            .ok_or_else(|| EngineError::NoStorageTarget(name.to_string()))?;
        return Ok(PropertyKind::ManagedBlob {
            data_type,
            storage_dir,
            filename_suffix: raw.filename_suffix.clone().unwrap_or_default(),
        });
    }

    // (4) scalar
    let data_type = raw
        .data_type
        .as_deref()
        .map(ScalarType::parse)
        .unwrap_or(ScalarType::Text);
    Ok(PropertyKind::Scalar { data_type })
}

/// Static schema of one model
#[derive(Debug, Clone)]
pub struct ModelSchema {
    /// Model name, lowercase
    pub name: String,
    pub properties: BTreeMap<String, Arc<PropertyDescriptor>>,
}

impl ModelSchema {
    /// Build a model schema from raw descriptors, classifying each property
    pub fn from_raw(
        name: &str,
        raw: &HashMap<String, RawPropertyDescriptor>,
    ) -> Result<Self> {
        let mut properties = BTreeMap::new();
        for (prop_name, descriptor) in raw {
            let kind = classify(prop_name, descriptor)?;
            let eas_data_type = descriptor
                .data_type
                .clone()
                .unwrap_or_else(|| "text".to_string());
            properties.insert(
                prop_name.clone(),
                Arc::new(PropertyDescriptor {
                    name: prop_name.clone(),
                    kind,
                    eas_data_type,
                }),
            );
        }

        debug!(model = name, count = properties.len(), "model schema loaded");
        Ok(Self {
            name: name.to_lowercase(),
            properties,
        })
    }

    pub fn property(&self, name: &str) -> Option<Arc<PropertyDescriptor>> {
        self.properties.get(name).cloned()
    }

    /// Relation and list-relation properties with their target models
    pub fn relation_properties(&self) -> Vec<(Arc<PropertyDescriptor>, String)> {
        self.properties
            .values()
            .filter_map(|d| match &d.kind {
                PropertyKind::Relation { target_model }
                | PropertyKind::ListRelation { target_model, .. } => {
                    Some((d.clone(), target_model.clone()))
                }
                _ => None,
            })
            .collect()
    }
}

/// All model schemas known to the process, loaded once
#[derive(Debug, Default, Clone)]
pub struct SchemaSet {
    models: HashMap<String, Arc<ModelSchema>>,
}

impl SchemaSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_raw(raw: &HashMap<String, HashMap<String, RawPropertyDescriptor>>) -> Result<Self> {
        let mut set = Self::new();
        for (model, properties) in raw {
            set.insert(ModelSchema::from_raw(model, properties)?);
        }
        Ok(set)
    }

    pub fn insert(&mut self, schema: ModelSchema) {
        self.models.insert(schema.name.clone(), Arc::new(schema));
    }

    pub fn model(&self, name: &str) -> Result<Arc<ModelSchema>> {
        self.models
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| EngineError::MissingDescriptor {
                model: name.to_string(),
                property: "*".to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(&name.to_lowercase())
    }
}

/// Process-wide cache of resolved remote schema uids.
///
/// Keyed by declaration (or property name for scalars). Injected rather
/// than module-level so tests and reconnects can scope and clear it.
#[derive(Debug, Default)]
pub struct SchemaUidCache {
    inner: DashMap<String, String>,
}

impl SchemaUidCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a declaration's schema uid, consulting the registry on miss
    pub async fn resolve(
        &self,
        cache_key: &str,
        declaration: &str,
        registry: &dyn RegistryClient,
    ) -> Result<String> {
        if let Some(uid) = self.inner.get(cache_key) {
            return Ok(uid.clone());
        }

        let uid = registry
            .resolve_schema_uid(declaration)
            .await?
            .ok_or_else(|| EngineError::SchemaUidNotFound(declaration.to_string()))?;
        self.inner.insert(cache_key.to_string(), uid.clone());
        Ok(uid)
    }

    pub fn put(&self, key: impl Into<String>, uid: impl Into<String>) {
        self.inner.insert(key.into(), uid.into());
    }

    pub fn clear(&self) {
        self.inner.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(
        data_type: Option<&str>,
        ref_value_type: Option<&str>,
        storage_type: Option<&str>,
    ) -> RawPropertyDescriptor {
        RawPropertyDescriptor {
            data_type: data_type.map(String::from),
            ref_value_type: ref_value_type.map(String::from),
            storage_type: storage_type.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn test_classify_scalar() {
        let kind = classify("title", &raw(Some("text"), None, None)).unwrap();
        assert_eq!(
            kind,
            PropertyKind::Scalar {
                data_type: ScalarType::Text
            }
        );
    }

    #[test]
    fn test_classify_relation_beats_storage_type() {
        // A relation with a storage type must still dispatch as a relation
        let mut descriptor = raw(Some("text"), None, Some(ITEM_STORAGE));
        descriptor.relation_model = Some("Author".to_string());
        let kind = classify("author", &descriptor).unwrap();
        assert_eq!(
            kind,
            PropertyKind::Relation {
                target_model: "author".to_string()
            }
        );
    }

    #[test]
    fn test_classify_image_from_ref_value_type() {
        let mut descriptor = raw(Some("text"), Some("image"), None);
        descriptor.relation_model = Some("Image".to_string());
        let kind = classify("cover", &descriptor).unwrap();
        assert_eq!(kind, PropertyKind::Image);
    }

    #[test]
    fn test_classify_managed_blob() {
        let mut descriptor = raw(Some("html"), None, Some(ITEM_STORAGE));
        descriptor.local_storage_dir = Some("documents".to_string());
        descriptor.filename_suffix = Some(".html".to_string());
        let kind = classify("body", &descriptor).unwrap();
        assert_eq!(
            kind,
            PropertyKind::ManagedBlob {
                data_type: ScalarType::Html,
                storage_dir: "documents".to_string(),
                filename_suffix: ".html".to_string(),
            }
        );
    }

    #[test]
    fn test_managed_blob_without_dir_is_schema_error() {
        let descriptor = raw(Some("html"), None, Some(ITEM_STORAGE));
        assert!(classify("body", &descriptor).is_err());
    }

    #[test]
    fn test_list_remote_name_convention() {
        assert_eq!(list_remote_name("authors", "user"), "authorUserIds");
        assert_eq!(list_remote_name("tags", "tag"), "tagTagIds");
    }

    #[test]
    fn test_list_relation_keeps_plural_alias() {
        let mut descriptor = raw(None, None, None);
        descriptor.relation_model = Some("user".to_string());
        descriptor.list = true;
        let kind = classify("authors", &descriptor).unwrap();
        match kind {
            PropertyKind::ListRelation {
                target_model,
                remote_name,
            } => {
                assert_eq!(target_model, "user");
                assert_eq!(remote_name, "authorUserIds");
            }
            other => panic!("expected list relation, got {:?}", other),
        }
    }

    #[test]
    fn test_schema_set_lookup_is_case_insensitive() {
        let mut properties = HashMap::new();
        properties.insert("title".to_string(), raw(Some("text"), None, None));
        let schema = ModelSchema::from_raw("Book", &properties).unwrap();
        let mut set = SchemaSet::new();
        set.insert(schema);

        assert!(set.contains("book"));
        assert!(set.model("Book").is_ok());
        assert!(set.model("missing").is_err());
    }
}
