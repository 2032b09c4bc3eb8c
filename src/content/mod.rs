//! Content network boundary and managed file storage
//!
//! Binary content flows two ways: locally, blobs are written under
//! `files/{dir}/{filename}` inside the data directory and resolved to a
//! content URL; remotely, uploads become signed content transactions on the
//! blob network. Transaction submission is deferred to the caller.

use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{EngineError, Result};

/// Delimiter between child files inside a composite upload
pub const FILE_SEPARATOR: &str = "===FILE_SEPARATOR===";

/// A created-but-not-submitted content transaction
#[derive(Debug, Clone)]
pub struct UploadHandle {
    /// Network-assigned transaction id
    pub id: String,
    pub tags: Vec<(String, String)>,
    pub signed: bool,
    pub byte_len: usize,
}

/// Create/sign/tag access to the binary content network
#[async_trait]
pub trait ContentClient: Send + Sync {
    /// Create a transaction for the given bytes. Not submitted.
    async fn create_transaction(&self, bytes: Bytes) -> Result<UploadHandle>;

    /// Attach a tag to a pending transaction
    async fn add_tag(&self, handle: &mut UploadHandle, key: &str, value: &str) -> Result<()>;

    /// Sign a pending transaction
    async fn sign(&self, handle: &mut UploadHandle) -> Result<()>;
}

/// Managed file storage under the engine's data directory
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    base_url: Option<String>,
}

impl FileStore {
    pub fn new(data_dir: impl Into<PathBuf>, base_url: Option<String>) -> Self {
        Self {
            root: data_dir.into(),
            base_url,
        }
    }

    /// Deterministic path for a managed file: `{data_dir}/files/{dir}/{name}`
    pub fn path_for(&self, dir: &str, filename: &str) -> PathBuf {
        self.root.join("files").join(dir).join(filename)
    }

    pub async fn write(&self, dir: &str, filename: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.path_for(dir, filename);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        debug!(path = %path.display(), len = bytes.len(), "managed file written");
        Ok(path)
    }

    pub async fn read_if_present(&self, dir: &str, filename: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(dir, filename);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve the content URL for a managed file
    pub fn content_url(&self, dir: &str, filename: &str) -> String {
        match &self.base_url {
            Some(base) => format!("{}/files/{}/{}", base.trim_end_matches('/'), dir, filename),
            None => format!("file://{}", self.path_for(dir, filename).display()),
        }
    }
}

/// Byte source for an image-typed property write
#[derive(Debug, Clone)]
pub enum ImageInput {
    /// `data:{mime};base64,{payload}`
    DataUrl(String),
    /// http(s) URL fetched at save time
    RemoteUrl(String),
    /// Raw bytes handed over directly
    Raw { bytes: Bytes, mime: Option<String> },
}

impl ImageInput {
    /// Interpret a raw property value as an image source
    pub fn from_value(value: &str) -> Option<Self> {
        if value.starts_with("data:") {
            Some(ImageInput::DataUrl(value.to_string()))
        } else if value.starts_with("http://") || value.starts_with("https://") {
            Some(ImageInput::RemoteUrl(value.to_string()))
        } else {
            None
        }
    }
}

/// Normalized image content
#[derive(Debug, Clone)]
pub struct ImageBytes {
    pub bytes: Bytes,
    pub mime: Option<String>,
}

/// Normalize any image input to raw bytes plus a MIME type
pub async fn resolve_image_bytes(
    input: ImageInput,
    http: &reqwest::Client,
) -> Result<ImageBytes> {
    match input {
        ImageInput::DataUrl(url) => parse_data_url(&url),
        ImageInput::RemoteUrl(url) => {
            let response = http
                .get(&url)
                .send()
                .await
                .map_err(|e| EngineError::Fetch(e.to_string()))?;
            let mime = response
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .map(String::from);
            let bytes = response
                .bytes()
                .await
                .map_err(|e| EngineError::Fetch(e.to_string()))?;
            if bytes.is_empty() {
                return Err(EngineError::NoImageSource(url));
            }
            Ok(ImageBytes { bytes, mime })
        }
        ImageInput::Raw { bytes, mime } => {
            if bytes.is_empty() {
                return Err(EngineError::NoImageSource("empty raw input".into()));
            }
            Ok(ImageBytes { bytes, mime })
        }
    }
}

fn parse_data_url(url: &str) -> Result<ImageBytes> {
    let rest = url
        .strip_prefix("data:")
        .ok_or_else(|| EngineError::NoImageSource(url.into()))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| EngineError::NoImageSource("malformed data url".into()))?;

    let (mime, is_base64) = match header.strip_suffix(";base64") {
        Some(mime) => (mime, true),
        None => (header, false),
    };
    let mime = if mime.is_empty() {
        None
    } else {
        Some(mime.to_string())
    };

    let bytes = if is_base64 {
        base64::engine::general_purpose::STANDARD
            .decode(payload.trim())
            .map_err(|e| EngineError::NoImageSource(format!("base64 decode: {}", e)))?
    } else {
        payload.as_bytes().to_vec()
    };

    if bytes.is_empty() {
        return Err(EngineError::NoImageSource("empty data url".into()));
    }
    Ok(ImageBytes {
        bytes: Bytes::from(bytes),
        mime,
    })
}

/// File extension for a known image MIME type
pub fn extension_for_mime(mime: &str) -> Option<&'static str> {
    match mime.split(';').next().unwrap_or(mime).trim() {
        "image/png" => Some("png"),
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        "image/svg+xml" => Some("svg"),
        "image/avif" => Some("avif"),
        _ => None,
    }
}
