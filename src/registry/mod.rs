//! Remote registry boundary
//!
//! The remote registry is an append-only, content-addressed claim log.
//! The engine consumes it through [`RegistryClient`]: filtered queries over
//! timestamped attestation records, plus schema-uid resolution for declared
//! claim shapes. Nothing here knows the wire format beyond the record shape.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{EngineError, Result};

/// Degenerate empty-relation marker some writers emit instead of omitting
/// the attestation. Always filtered out of property fetches.
pub const EMPTY_RELATION_SENTINEL: &str =
    "0x0000000000000000000000000000000000000000000000000000000000000020";

/// One attestation record as the registry returns it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationRecord {
    /// Registry-assigned record id (uid)
    pub id: String,
    /// Schema uid this record was attested under
    pub schema_id: String,
    /// Record this one references (e.g. a property's version)
    pub ref_uid: String,
    /// Registry timestamp, unix millis
    pub time_created: i64,
    /// Decoded claim body, JSON object
    pub decoded_data_json: String,
    pub revoked: bool,
}

impl AttestationRecord {
    /// Parse the decoded claim body
    pub fn decoded(&self) -> Result<Value> {
        Ok(serde_json::from_str(&self.decoded_data_json)?)
    }

    /// Extract a string field from the decoded body, if present
    pub fn field(&self, name: &str) -> Option<String> {
        let value = self.decoded().ok()?;
        match value.get(name)? {
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

/// Filter for a registry query
#[derive(Debug, Clone, Default)]
pub struct RegistryQuery {
    /// Restrict to one schema uid
    pub schema_id: Option<String>,
    /// Restrict to records referencing this uid
    pub ref_uid: Option<String>,
    /// Restrict to records referencing any of these uids
    pub ref_uids: Vec<String>,
    /// Include revoked records (default: excluded)
    pub include_revoked: bool,
}

impl RegistryQuery {
    pub fn by_schema(schema_id: impl Into<String>) -> Self {
        Self {
            schema_id: Some(schema_id.into()),
            ..Self::default()
        }
    }

    pub fn referencing(mut self, ref_uid: impl Into<String>) -> Self {
        self.ref_uid = Some(ref_uid.into());
        self
    }

    pub fn referencing_any(mut self, ref_uids: Vec<String>) -> Self {
        self.ref_uids = ref_uids;
        self
    }
}

/// Read-only query access to the remote registry
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Run a filtered query; results are orderable by `time_created`
    async fn query(&self, query: RegistryQuery) -> Result<Vec<AttestationRecord>>;

    /// Resolve the registry's schema uid for a claim-shape declaration
    /// (model name, `"version"`, or a scalar primitive declaration)
    async fn resolve_schema_uid(&self, declaration: &str) -> Result<Option<String>>;
}

/// Collapse records to the authoritative one per schema id.
///
/// Greatest `time_created` wins; equal timestamps fall back to the
/// lexicographically greater record id, which keeps the outcome
/// deterministic regardless of fetch order.
pub fn latest_by_schema(records: Vec<AttestationRecord>) -> HashMap<String, AttestationRecord> {
    let mut latest: HashMap<String, AttestationRecord> = HashMap::new();
    for record in records {
        match latest.get(&record.schema_id) {
            Some(current)
                if (current.time_created, current.id.as_str())
                    >= (record.time_created, record.id.as_str()) => {}
            _ => {
                latest.insert(record.schema_id.clone(), record);
            }
        }
    }
    latest
}

/// Pick the most recent record out of a slice, same tie-break as
/// [`latest_by_schema`]
pub fn most_recent<'a>(records: &'a [AttestationRecord]) -> Option<&'a AttestationRecord> {
    records
        .iter()
        .max_by(|a, b| (a.time_created, a.id.as_str()).cmp(&(b.time_created, b.id.as_str())))
}

/// Per-model cache of seed-attestation fetches.
///
/// Avoids duplicate round trips when several refreshes for the same model
/// land inside one burst. Injected, process-wide, cleared explicitly.
#[derive(Debug)]
pub struct SeedQueryCache {
    inner: DashMap<String, (Instant, Vec<AttestationRecord>)>,
    ttl: Duration,
}

impl SeedQueryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: DashMap::new(),
            ttl,
        }
    }

    /// Fetch seed attestations for a model's schema, reusing a fresh
    /// cached result when available
    pub async fn fetch(
        &self,
        model: &str,
        schema_id: &str,
        registry: &dyn RegistryClient,
    ) -> Result<Vec<AttestationRecord>> {
        if let Some(entry) = self.inner.get(model) {
            let (at, records) = entry.value();
            if at.elapsed() < self.ttl {
                debug!(model, count = records.len(), "seed query served from cache");
                return Ok(records.clone());
            }
        }

        let records = registry.query(RegistryQuery::by_schema(schema_id)).await?;
        self.inner
            .insert(model.to_string(), (Instant::now(), records.clone()));
        Ok(records)
    }

    pub fn clear(&self) {
        self.inner.clear();
    }
}

/// Whether a stored relation value is the degenerate empty marker
pub fn is_empty_relation(value: &str) -> bool {
    value == EMPTY_RELATION_SENTINEL
}

impl EngineError {
    /// Convenience constructor for registry-side failures
    pub fn registry(msg: impl Into<String>) -> Self {
        EngineError::Registry(msg.into())
    }
}
