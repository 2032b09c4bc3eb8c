//! Engine configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Data directory; the store and managed files live under it
    pub data_dir: PathBuf,

    /// Filename of the relational store inside `data_dir`
    #[serde(default = "default_db_filename")]
    pub db_filename: String,

    /// Base URL for resolving content URLs of locally written files.
    /// When unset, `file://` URLs are produced.
    #[serde(default)]
    pub content_base_url: Option<String>,

    /// How long a per-model seed query result stays fresh within a
    /// refresh burst, in milliseconds
    #[serde(default = "default_seed_query_ttl")]
    pub seed_query_ttl_ms: u64,

    /// Capacity of the process-wide event bus
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Interval between checks for a not-yet-present remote-storage file,
    /// in milliseconds
    #[serde(default = "default_remote_storage_poll")]
    pub remote_storage_poll_ms: u64,
}

fn default_db_filename() -> String {
    "loam.db".to_string()
}
fn default_seed_query_ttl() -> u64 {
    5_000
}
fn default_event_capacity() -> usize {
    1_024
}
fn default_remote_storage_poll() -> u64 {
    500
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            db_filename: default_db_filename(),
            content_base_url: None,
            seed_query_ttl_ms: default_seed_query_ttl(),
            event_capacity: default_event_capacity(),
            remote_storage_poll_ms: default_remote_storage_poll(),
        }
    }
}

impl EngineConfig {
    /// Create a config rooted at the given data directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("LOAM_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        if let Ok(url) = std::env::var("LOAM_CONTENT_BASE_URL") {
            config.content_base_url = Some(url);
        }

        if let Ok(val) = std::env::var("LOAM_SEED_QUERY_TTL_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                config.seed_query_ttl_ms = ms;
            }
        }

        config
    }

    /// Full path of the relational store
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(&self.db_filename)
    }
}
