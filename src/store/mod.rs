//! Local relational cache
//!
//! SQLite-backed mirror of the remote registry plus all optimistic local
//! state: seeds, versions, metadata (property) rows, and serialized actor
//! snapshots. Rows are never physically deleted; seeds are soft-marked and
//! metadata accumulates history, with the authoritative row selected by
//! `COALESCE(attestation_created_at, created_at)`.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::Result;

/// Identity values treated as absent when resolving seeds
pub const EMPTY_ID_SENTINELS: &[&str] = &["", "undefined", "null", "false", "0"];

/// Whether an id value is one of the documented empty sentinels
pub fn is_empty_id(value: Option<&str>) -> bool {
    match value {
        None => true,
        Some(v) => EMPTY_ID_SENTINELS.contains(&v),
    }
}

/// Generate a fresh local id
pub fn new_local_id() -> String {
    Uuid::new_v4().to_string()
}

/// Current time as unix millis
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// One logical entity instance
#[derive(Debug, Clone, PartialEq)]
pub struct SeedRow {
    pub seed_local_id: String,
    /// Assigned once the seed is attested remotely
    pub seed_uid: Option<String>,
    /// Model name, lowercase
    pub model: String,
    pub marked_for_deletion: bool,
    pub created_at: i64,
}

/// Immutable snapshot pointer for a seed
#[derive(Debug, Clone, PartialEq)]
pub struct VersionRow {
    pub version_local_id: String,
    pub version_uid: Option<String>,
    pub seed_local_id: String,
    pub seed_uid: Option<String>,
    pub created_at: i64,
}

/// One property-value assignment plus its resolution metadata
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataRow {
    pub local_id: String,
    /// Registry uid; absent until published
    pub uid: Option<String>,
    pub property_name: String,
    pub property_value: Option<String>,
    pub schema_uid: Option<String>,
    pub seed_local_id: String,
    pub seed_uid: Option<String>,
    pub version_local_id: String,
    pub version_uid: Option<String>,
    pub model: Option<String>,
    pub eas_data_type: Option<String>,
    pub ref_seed_type: Option<String>,
    pub ref_value_type: Option<String>,
    /// Resolved indirect value, e.g. a filename
    pub ref_resolved_value: Option<String>,
    /// Resolved display value, e.g. a content URL
    pub ref_resolved_display_value: Option<String>,
    pub local_storage_dir: Option<String>,
    pub attestation_created_at: Option<i64>,
    pub created_at: i64,
}

impl MetadataRow {
    /// Fresh unpublished row for a property of one item version
    pub fn new(
        seed_local_id: &str,
        version_local_id: &str,
        property_name: &str,
    ) -> Self {
        Self {
            local_id: new_local_id(),
            property_name: property_name.to_string(),
            seed_local_id: seed_local_id.to_string(),
            version_local_id: version_local_id.to_string(),
            created_at: now_millis(),
            ..Default::default()
        }
    }
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS seeds (
    seed_local_id TEXT PRIMARY KEY,
    seed_uid TEXT,
    model TEXT NOT NULL,
    marked_for_deletion INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_seeds_uid ON seeds(seed_uid);
CREATE INDEX IF NOT EXISTS idx_seeds_model ON seeds(model);

CREATE TABLE IF NOT EXISTS versions (
    version_local_id TEXT PRIMARY KEY,
    version_uid TEXT,
    seed_local_id TEXT NOT NULL,
    seed_uid TEXT,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_versions_seed ON versions(seed_local_id);
CREATE INDEX IF NOT EXISTS idx_versions_uid ON versions(version_uid);

CREATE TABLE IF NOT EXISTS metadata (
    local_id TEXT PRIMARY KEY,
    uid TEXT,
    property_name TEXT NOT NULL,
    property_value TEXT,
    schema_uid TEXT,
    seed_local_id TEXT NOT NULL,
    seed_uid TEXT,
    version_local_id TEXT NOT NULL,
    version_uid TEXT,
    model TEXT,
    eas_data_type TEXT,
    ref_seed_type TEXT,
    ref_value_type TEXT,
    ref_resolved_value TEXT,
    ref_resolved_display_value TEXT,
    local_storage_dir TEXT,
    attestation_created_at INTEGER,
    created_at INTEGER NOT NULL,
    UNIQUE(seed_local_id, property_name, version_local_id)
);
CREATE INDEX IF NOT EXISTS idx_metadata_seed ON metadata(seed_local_id);
CREATE INDEX IF NOT EXISTS idx_metadata_version ON metadata(version_local_id);

CREATE TABLE IF NOT EXISTS app_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

/// Process-wide handle to the relational cache
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the store at a path, WAL mode
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA_SQL)?;
        info!(path = %path.as_ref().display(), "store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests and ephemeral sessions
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ------------------------------------------------------------------
    // Seeds
    // ------------------------------------------------------------------

    /// Resolve a seed by identity pair. A uid hit takes priority over a
    /// local-id hit; sentinel "empty" values never match.
    pub async fn find_seed(
        &self,
        seed_uid: Option<&str>,
        seed_local_id: Option<&str>,
    ) -> Result<Option<SeedRow>> {
        let conn = self.conn.lock().await;

        if !is_empty_id(seed_uid) {
            let hit = conn
                .query_row(
                    "SELECT seed_local_id, seed_uid, model, marked_for_deletion, created_at
                     FROM seeds WHERE seed_uid = ?1",
                    params![seed_uid],
                    seed_from_row,
                )
                .optional()?;
            if hit.is_some() {
                return Ok(hit);
            }
        }

        if !is_empty_id(seed_local_id) {
            let hit = conn
                .query_row(
                    "SELECT seed_local_id, seed_uid, model, marked_for_deletion, created_at
                     FROM seeds WHERE seed_local_id = ?1",
                    params![seed_local_id],
                    seed_from_row,
                )
                .optional()?;
            return Ok(hit);
        }

        Ok(None)
    }

    pub async fn insert_seed(&self, seed: &SeedRow) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO seeds (seed_local_id, seed_uid, model, marked_for_deletion, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                seed.seed_local_id,
                seed.seed_uid,
                seed.model,
                seed.marked_for_deletion as i64,
                seed.created_at
            ],
        )?;
        Ok(())
    }

    /// Record the remote uid assigned at first publish
    pub async fn set_seed_uid(&self, seed_local_id: &str, seed_uid: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE seeds SET seed_uid = ?2 WHERE seed_local_id = ?1",
            params![seed_local_id, seed_uid],
        )?;
        Ok(())
    }

    /// Soft deletion; the row stays recoverable
    pub async fn mark_seed_for_deletion(&self, seed_local_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE seeds SET marked_for_deletion = 1 WHERE seed_local_id = ?1",
            params![seed_local_id],
        )?;
        Ok(())
    }

    /// Create a seed and its initial version in one transaction, so a crash
    /// can't leave a seed without a version
    pub async fn create_seed_with_version(
        &self,
        model: &str,
        seed_uid: Option<&str>,
    ) -> Result<(SeedRow, VersionRow)> {
        let mut conn = self.conn.lock().await;
        let now = now_millis();

        let seed = SeedRow {
            seed_local_id: new_local_id(),
            seed_uid: seed_uid.map(String::from),
            model: model.to_lowercase(),
            marked_for_deletion: false,
            created_at: now,
        };
        let version = VersionRow {
            version_local_id: new_local_id(),
            version_uid: None,
            seed_local_id: seed.seed_local_id.clone(),
            seed_uid: seed.seed_uid.clone(),
            created_at: now,
        };

        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO seeds (seed_local_id, seed_uid, model, marked_for_deletion, created_at)
             VALUES (?1, ?2, ?3, 0, ?4)",
            params![seed.seed_local_id, seed.seed_uid, seed.model, seed.created_at],
        )?;
        tx.execute(
            "INSERT INTO versions (version_local_id, version_uid, seed_local_id, seed_uid, created_at)
             VALUES (?1, NULL, ?2, ?3, ?4)",
            params![
                version.version_local_id,
                version.seed_local_id,
                version.seed_uid,
                version.created_at
            ],
        )?;
        tx.commit()?;

        debug!(
            model = seed.model,
            seed_local_id = seed.seed_local_id,
            "seed and initial version created"
        );
        Ok((seed, version))
    }

    /// Insert an already-built seed and version pair in one transaction.
    /// Used when mirroring a remote item, where the same crash rule applies:
    /// a seed must never land without a version.
    pub async fn insert_seed_and_version(
        &self,
        seed: &SeedRow,
        version: &VersionRow,
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO seeds (seed_local_id, seed_uid, model, marked_for_deletion, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                seed.seed_local_id,
                seed.seed_uid,
                seed.model,
                seed.marked_for_deletion as i64,
                seed.created_at
            ],
        )?;
        tx.execute(
            "INSERT INTO versions (version_local_id, version_uid, seed_local_id, seed_uid, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                version.version_local_id,
                version.version_uid,
                version.seed_local_id,
                version.seed_uid,
                version.created_at
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Versions
    // ------------------------------------------------------------------

    pub async fn insert_version(&self, version: &VersionRow) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO versions (version_local_id, version_uid, seed_local_id, seed_uid, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                version.version_local_id,
                version.version_uid,
                version.seed_local_id,
                version.seed_uid,
                version.created_at
            ],
        )?;
        Ok(())
    }

    /// Latest version of a seed by local creation time
    pub async fn latest_version_for_seed(
        &self,
        seed_local_id: &str,
    ) -> Result<Option<VersionRow>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT version_local_id, version_uid, seed_local_id, seed_uid, created_at
                 FROM versions WHERE seed_local_id = ?1
                 ORDER BY created_at DESC, version_local_id DESC LIMIT 1",
                params![seed_local_id],
                version_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub async fn find_version_by_uid(&self, version_uid: &str) -> Result<Option<VersionRow>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT version_local_id, version_uid, seed_local_id, seed_uid, created_at
                 FROM versions WHERE version_uid = ?1",
                params![version_uid],
                version_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub async fn set_version_uid(&self, version_local_id: &str, version_uid: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE versions SET version_uid = ?2 WHERE version_local_id = ?1",
            params![version_local_id, version_uid],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Metadata
    // ------------------------------------------------------------------

    /// Insert-if-absent, else update, on the (seed, property, version) key
    pub async fn upsert_metadata(&self, row: &MetadataRow) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO metadata (
                local_id, uid, property_name, property_value, schema_uid,
                seed_local_id, seed_uid, version_local_id, version_uid, model,
                eas_data_type, ref_seed_type, ref_value_type, ref_resolved_value,
                ref_resolved_display_value, local_storage_dir, attestation_created_at, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
             ON CONFLICT(seed_local_id, property_name, version_local_id) DO UPDATE SET
                uid = excluded.uid,
                property_value = excluded.property_value,
                schema_uid = excluded.schema_uid,
                seed_uid = excluded.seed_uid,
                version_uid = excluded.version_uid,
                model = excluded.model,
                eas_data_type = excluded.eas_data_type,
                ref_seed_type = excluded.ref_seed_type,
                ref_value_type = excluded.ref_value_type,
                ref_resolved_value = excluded.ref_resolved_value,
                ref_resolved_display_value = excluded.ref_resolved_display_value,
                local_storage_dir = excluded.local_storage_dir,
                attestation_created_at = excluded.attestation_created_at",
            params![
                row.local_id,
                row.uid,
                row.property_name,
                row.property_value,
                row.schema_uid,
                row.seed_local_id,
                row.seed_uid,
                row.version_local_id,
                row.version_uid,
                row.model,
                row.eas_data_type,
                row.ref_seed_type,
                row.ref_value_type,
                row.ref_resolved_value,
                row.ref_resolved_display_value,
                row.local_storage_dir,
                row.attestation_created_at,
                row.created_at
            ],
        )?;
        Ok(())
    }

    pub async fn metadata_by_local_id(&self, local_id: &str) -> Result<Option<MetadataRow>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                &format!("{} WHERE local_id = ?1", METADATA_SELECT),
                params![local_id],
                metadata_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Authoritative row for a property of a seed: most recent by
    /// `COALESCE(attestation_created_at, created_at)`, local id as the
    /// deterministic secondary key
    pub async fn latest_metadata(
        &self,
        seed_local_id: &str,
        seed_uid: Option<&str>,
        property_name: &str,
    ) -> Result<Option<MetadataRow>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                &format!(
                    "{} WHERE property_name = ?1
                       AND (seed_local_id = ?2 OR (?3 IS NOT NULL AND seed_uid = ?3))
                     ORDER BY COALESCE(attestation_created_at, created_at) DESC, local_id DESC
                     LIMIT 1",
                    METADATA_SELECT
                ),
                params![property_name, seed_local_id, seed_uid],
                metadata_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// All metadata rows of one version
    pub async fn metadata_for_version(&self, version_local_id: &str) -> Result<Vec<MetadataRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE version_local_id = ?1 ORDER BY property_name",
            METADATA_SELECT
        ))?;
        let rows = stmt
            .query_map(params![version_local_id], metadata_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Rows with no remote uid: unpublished or dirty local edits
    pub async fn edited_properties(&self, seed_local_id: &str) -> Result<Vec<MetadataRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE seed_local_id = ?1 AND uid IS NULL ORDER BY property_name",
            METADATA_SELECT
        ))?;
        let rows = stmt
            .query_map(params![seed_local_id], metadata_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Record the registry uid assigned to a published metadata row
    pub async fn mark_metadata_published(&self, local_id: &str, uid: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE metadata SET uid = ?2 WHERE local_id = ?1",
            params![local_id, uid],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // App state
    // ------------------------------------------------------------------

    pub async fn put_app_state(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO app_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub async fn get_app_state(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let value = conn
            .query_row(
                "SELECT value FROM app_state WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }
}

const METADATA_SELECT: &str = "SELECT
    local_id, uid, property_name, property_value, schema_uid,
    seed_local_id, seed_uid, version_local_id, version_uid, model,
    eas_data_type, ref_seed_type, ref_value_type, ref_resolved_value,
    ref_resolved_display_value, local_storage_dir, attestation_created_at, created_at
 FROM metadata";

fn seed_from_row(row: &Row<'_>) -> rusqlite::Result<SeedRow> {
    Ok(SeedRow {
        seed_local_id: row.get(0)?,
        seed_uid: row.get(1)?,
        model: row.get(2)?,
        marked_for_deletion: row.get::<_, i64>(3)? != 0,
        created_at: row.get(4)?,
    })
}

fn version_from_row(row: &Row<'_>) -> rusqlite::Result<VersionRow> {
    Ok(VersionRow {
        version_local_id: row.get(0)?,
        version_uid: row.get(1)?,
        seed_local_id: row.get(2)?,
        seed_uid: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn metadata_from_row(row: &Row<'_>) -> rusqlite::Result<MetadataRow> {
    Ok(MetadataRow {
        local_id: row.get(0)?,
        uid: row.get(1)?,
        property_name: row.get(2)?,
        property_value: row.get(3)?,
        schema_uid: row.get(4)?,
        seed_local_id: row.get(5)?,
        seed_uid: row.get(6)?,
        version_local_id: row.get(7)?,
        version_uid: row.get(8)?,
        model: row.get(9)?,
        eas_data_type: row.get(10)?,
        ref_seed_type: row.get(11)?,
        ref_value_type: row.get(12)?,
        ref_resolved_value: row.get(13)?,
        ref_resolved_display_value: row.get(14)?,
        local_storage_dir: row.get(15)?,
        attestation_created_at: row.get(16)?,
        created_at: row.get(17)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    #[tokio::test]
    async fn test_seed_identity_uid_preferred() {
        let store = store().await;

        // Two seeds: one only local, one with both ids
        let local_only = SeedRow {
            seed_local_id: "local-a".into(),
            seed_uid: None,
            model: "book".into(),
            marked_for_deletion: false,
            created_at: now_millis(),
        };
        let published = SeedRow {
            seed_local_id: "local-b".into(),
            seed_uid: Some("0xuid-b".into()),
            model: "book".into(),
            marked_for_deletion: false,
            created_at: now_millis(),
        };
        store.insert_seed(&local_only).await.unwrap();
        store.insert_seed(&published).await.unwrap();

        // Resolution by either id of the published seed returns the same row
        let by_uid = store.find_seed(Some("0xuid-b"), None).await.unwrap().unwrap();
        let by_local = store.find_seed(None, Some("local-b")).await.unwrap().unwrap();
        assert_eq!(by_uid, by_local);

        // When both are supplied, the uid match wins even if the local id
        // points elsewhere
        let both = store
            .find_seed(Some("0xuid-b"), Some("local-a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(both.seed_local_id, "local-b");
    }

    #[tokio::test]
    async fn test_sentinel_ids_never_match() {
        let store = store().await;
        let seed = SeedRow {
            seed_local_id: "0".into(),
            seed_uid: Some("undefined".into()),
            model: "book".into(),
            marked_for_deletion: false,
            created_at: now_millis(),
        };
        store.insert_seed(&seed).await.unwrap();

        assert!(store
            .find_seed(Some("undefined"), Some("0"))
            .await
            .unwrap()
            .is_none());
        assert!(store.find_seed(Some(""), Some("null")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_seed_with_version_is_atomic_pair() {
        let store = store().await;
        let (seed, version) = store.create_seed_with_version("Book", None).await.unwrap();

        assert_eq!(seed.model, "book");
        assert!(seed.seed_uid.is_none());
        assert_eq!(version.seed_local_id, seed.seed_local_id);

        let latest = store
            .latest_version_for_seed(&seed.seed_local_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.version_local_id, version.version_local_id);
    }

    #[tokio::test]
    async fn test_insert_seed_and_version_lands_as_a_pair() {
        let store = store().await;
        let seed = SeedRow {
            seed_local_id: "local-m".into(),
            seed_uid: Some("0xmirrored".into()),
            model: "book".into(),
            marked_for_deletion: false,
            created_at: now_millis(),
        };
        let version = VersionRow {
            version_local_id: "version-m".into(),
            version_uid: Some("0xversion-m".into()),
            seed_local_id: "local-m".into(),
            seed_uid: Some("0xmirrored".into()),
            created_at: now_millis(),
        };
        store.insert_seed_and_version(&seed, &version).await.unwrap();

        let found = store
            .find_seed(Some("0xmirrored"), None)
            .await
            .unwrap()
            .unwrap();
        let latest = store
            .latest_version_for_seed(&found.seed_local_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.version_uid.as_deref(), Some("0xversion-m"));
    }

    #[tokio::test]
    async fn test_upsert_metadata_updates_in_place() {
        let store = store().await;
        let mut row = MetadataRow::new("seed-1", "version-1", "title");
        row.property_value = Some("Dune".into());
        store.upsert_metadata(&row).await.unwrap();

        row.property_value = Some("Dune Messiah".into());
        store.upsert_metadata(&row).await.unwrap();

        let rows = store.metadata_for_version("version-1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].property_value.as_deref(), Some("Dune Messiah"));
    }

    #[tokio::test]
    async fn test_latest_metadata_prefers_attestation_timestamp() {
        let store = store().await;

        let mut local = MetadataRow::new("seed-1", "version-1", "title");
        local.property_value = Some("local edit".into());
        local.created_at = 1_000;
        store.upsert_metadata(&local).await.unwrap();

        let mut attested = MetadataRow::new("seed-1", "version-2", "title");
        attested.property_value = Some("attested".into());
        attested.created_at = 500;
        attested.attestation_created_at = Some(2_000);
        store.upsert_metadata(&attested).await.unwrap();

        let latest = store
            .latest_metadata("seed-1", None, "title")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.property_value.as_deref(), Some("attested"));
    }

    #[tokio::test]
    async fn test_edited_properties_are_rows_without_uid() {
        let store = store().await;

        let mut dirty = MetadataRow::new("seed-1", "version-1", "title");
        dirty.property_value = Some("draft".into());
        store.upsert_metadata(&dirty).await.unwrap();

        let mut published = MetadataRow::new("seed-1", "version-1", "subtitle");
        published.uid = Some("0xattested".into());
        store.upsert_metadata(&published).await.unwrap();

        let edited = store.edited_properties("seed-1").await.unwrap();
        assert_eq!(edited.len(), 1);
        assert_eq!(edited[0].property_name, "title");

        store
            .mark_metadata_published(&dirty.local_id, "0xnew")
            .await
            .unwrap();
        assert!(store.edited_properties("seed-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_app_state_roundtrip() {
        let store = store().await;
        store.put_app_state("snapshot__book", "{}").await.unwrap();
        store.put_app_state("snapshot__book", "[1]").await.unwrap();
        assert_eq!(
            store.get_app_state("snapshot__book").await.unwrap().as_deref(),
            Some("[1]")
        );
        assert!(store.get_app_state("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_seed_for_deletion_is_soft() {
        let store = store().await;
        let (seed, _) = store.create_seed_with_version("book", None).await.unwrap();
        store.mark_seed_for_deletion(&seed.seed_local_id).await.unwrap();

        let row = store
            .find_seed(None, Some(&seed.seed_local_id))
            .await
            .unwrap()
            .unwrap();
        assert!(row.marked_for_deletion);
    }
}
