//! Engine error taxonomy
//!
//! Three stable kinds, matching how callers are expected to react:
//! - `Schema`: programmer/schema errors. Fatal, never retried.
//! - `Integrity`: data-integrity failures. Fatal to the current operation,
//!   surfaced to the caller as a rejected operation.
//! - `Transient`: a resource is not ready yet. Callers wait, they don't fail.

use thiserror::Error;

/// Stable classification for [`EngineError`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Programmer or schema error (missing descriptor, unresolvable schema uid)
    Schema,
    /// Data-integrity error (relation target not found, missing image bytes)
    Integrity,
    /// Transient absence (store not ready, remote file not yet present)
    Transient,
}

/// Error type for all engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    /// A declared model property has no type descriptor
    #[error("missing property descriptor for {model}.{property}")]
    MissingDescriptor { model: String, property: String },

    /// No remote schema uid could be resolved for a declaration
    #[error("schema uid not found for {0}")]
    SchemaUidNotFound(String),

    /// A relation property's stored value does not resolve to a known item
    #[error("no related item found for {property} = {value}")]
    NoRelatedItem { property: String, value: String },

    /// Image input carried no resolvable byte source
    #[error("image input has no resolvable byte source: {0}")]
    NoImageSource(String),

    /// Item-storage target directory or filename could not be determined
    #[error("item storage target could not be determined for {0}")]
    NoStorageTarget(String),

    /// A required record is missing from the local store
    #[error("record not found: {0}")]
    NotFound(String),

    /// A resource the operation depends on is not ready yet
    #[error("resource not ready: {0}")]
    NotReady(String),

    /// Local relational store failure
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Filesystem failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// HTTP fetch for a remote byte source failed
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// Remote registry query failure
    #[error("registry error: {0}")]
    Registry(String),

    /// Content network failure
    #[error("content network error: {0}")]
    Content(String),
}

impl EngineError {
    /// Classify this error into its stable kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::MissingDescriptor { .. } | EngineError::SchemaUidNotFound(_) => {
                ErrorKind::Schema
            }
            EngineError::NotReady(_) => ErrorKind::Transient,
            _ => ErrorKind::Integrity,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        let schema = EngineError::MissingDescriptor {
            model: "book".into(),
            property: "title".into(),
        };
        assert_eq!(schema.kind(), ErrorKind::Schema);

        let integrity = EngineError::NoRelatedItem {
            property: "author".into(),
            value: "x".into(),
        };
        assert_eq!(integrity.kind(), ErrorKind::Integrity);

        let transient = EngineError::NotReady("store".into());
        assert_eq!(transient.kind(), ErrorKind::Transient);
    }
}
