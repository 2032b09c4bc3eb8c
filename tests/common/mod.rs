//! Shared fixtures for the integration suite: an in-process registry, a
//! fake content network, and a small article/author/tag model set.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use loam::content::{ContentClient, UploadHandle};
use loam::error::Result;
use loam::registry::{AttestationRecord, RegistryClient, RegistryQuery};
use loam::schema::RawPropertyDescriptor;
use loam::{Engine, EngineConfig, SchemaSet};

/// In-process registry: an append-only record list with canned schema uids
#[derive(Default)]
pub struct FakeRegistry {
    pub records: Mutex<Vec<AttestationRecord>>,
}

impl FakeRegistry {
    pub async fn push(&self, record: AttestationRecord) {
        self.records.lock().await.push(record);
    }

    pub async fn push_seed(&self, model: &str, uid: &str, time: i64) {
        self.push(AttestationRecord {
            id: uid.to_string(),
            schema_id: format!("0xschema-{}", model),
            ref_uid: String::new(),
            time_created: time,
            decoded_data_json: format!(r#"{{"type":"{}"}}"#, model),
            revoked: false,
        })
        .await;
    }

    pub async fn push_version(&self, uid: &str, seed_uid: &str, time: i64) {
        self.push(AttestationRecord {
            id: uid.to_string(),
            schema_id: "0xschema-version".to_string(),
            ref_uid: seed_uid.to_string(),
            time_created: time,
            decoded_data_json: "{}".to_string(),
            revoked: false,
        })
        .await;
    }

    pub async fn push_property(
        &self,
        uid: &str,
        version_uid: &str,
        name: &str,
        value: &str,
        time: i64,
    ) {
        self.push(AttestationRecord {
            id: uid.to_string(),
            schema_id: "0xschema-string".to_string(),
            ref_uid: version_uid.to_string(),
            time_created: time,
            decoded_data_json: format!(r#"{{"name":"{}","value":"{}"}}"#, name, value),
            revoked: false,
        })
        .await;
    }

    pub async fn clear(&self) {
        self.records.lock().await.clear();
    }
}

#[async_trait]
impl RegistryClient for FakeRegistry {
    async fn query(&self, query: RegistryQuery) -> Result<Vec<AttestationRecord>> {
        let records = self.records.lock().await;
        Ok(records
            .iter()
            .filter(|r| {
                query
                    .schema_id
                    .as_deref()
                    .map(|s| r.schema_id == s)
                    .unwrap_or(true)
                    && query
                        .ref_uid
                        .as_deref()
                        .map(|u| r.ref_uid == u)
                        .unwrap_or(true)
                    && (query.ref_uids.is_empty() || query.ref_uids.iter().any(|u| *u == r.ref_uid))
                    && (query.include_revoked || !r.revoked)
            })
            .cloned()
            .collect())
    }

    async fn resolve_schema_uid(&self, declaration: &str) -> Result<Option<String>> {
        Ok(Some(format!("0xschema-{}", declaration)))
    }
}

/// Fake content network: numbered handles, nothing ever submitted
#[derive(Default)]
pub struct FakeContent {
    counter: AtomicU64,
}

#[async_trait]
impl ContentClient for FakeContent {
    async fn create_transaction(&self, bytes: Bytes) -> Result<UploadHandle> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(UploadHandle {
            id: format!("tx-{}", n),
            tags: Vec::new(),
            signed: false,
            byte_len: bytes.len(),
        })
    }

    async fn add_tag(&self, handle: &mut UploadHandle, key: &str, value: &str) -> Result<()> {
        handle.tags.push((key.to_string(), value.to_string()));
        Ok(())
    }

    async fn sign(&self, handle: &mut UploadHandle) -> Result<()> {
        handle.signed = true;
        Ok(())
    }
}

fn scalar(data_type: &str) -> RawPropertyDescriptor {
    RawPropertyDescriptor {
        data_type: Some(data_type.to_string()),
        ..Default::default()
    }
}

/// Article/author/tag models covering every property kind
pub fn schemas() -> SchemaSet {
    let mut raw: HashMap<String, HashMap<String, RawPropertyDescriptor>> = HashMap::new();

    let mut article = HashMap::new();
    article.insert("title".to_string(), scalar("text"));
    article.insert("wordCount".to_string(), scalar("number"));
    article.insert(
        "author".to_string(),
        RawPropertyDescriptor {
            relation_model: Some("author".to_string()),
            ..Default::default()
        },
    );
    article.insert(
        "tags".to_string(),
        RawPropertyDescriptor {
            relation_model: Some("tag".to_string()),
            list: true,
            ..Default::default()
        },
    );
    article.insert(
        "heroImage".to_string(),
        RawPropertyDescriptor {
            data_type: Some("text".to_string()),
            ref_value_type: Some("image".to_string()),
            ..Default::default()
        },
    );
    article.insert(
        "content".to_string(),
        RawPropertyDescriptor {
            data_type: Some("html".to_string()),
            storage_type: Some("ItemStorage".to_string()),
            local_storage_dir: Some("documents".to_string()),
            filename_suffix: Some(".html".to_string()),
            ..Default::default()
        },
    );
    article.insert(
        "contentMeta".to_string(),
        RawPropertyDescriptor {
            data_type: Some("json".to_string()),
            storage_type: Some("ItemStorage".to_string()),
            local_storage_dir: Some("documents".to_string()),
            filename_suffix: Some(".json".to_string()),
            ..Default::default()
        },
    );
    raw.insert("article".to_string(), article);

    let mut author = HashMap::new();
    author.insert("name".to_string(), scalar("text"));
    raw.insert("author".to_string(), author);

    let mut tag = HashMap::new();
    tag.insert("label".to_string(), scalar("text"));
    raw.insert("tag".to_string(), tag);

    let mut image = HashMap::new();
    image.insert("filename".to_string(), scalar("text"));
    raw.insert("image".to_string(), image);

    SchemaSet::from_raw(&raw).unwrap()
}

/// Engine over a temp data directory and the fake collaborators. Test
/// output honors `RUST_LOG` through the standard subscriber.
pub fn engine_with(registry: Arc<FakeRegistry>) -> Engine {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let data_dir = tempfile::TempDir::new().unwrap().into_path();
    Engine::new(
        EngineConfig::with_data_dir(data_dir),
        schemas(),
        registry,
        Arc::new(FakeContent::default()),
    )
    .unwrap()
}

pub fn engine() -> Engine {
    engine_with(Arc::new(FakeRegistry::default()))
}
