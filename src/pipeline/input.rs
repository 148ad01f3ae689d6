//! Input resolution: turn a path, URL or byte buffer into validated PDF bytes.
//!
//! pdfium loads documents straight from memory, so every source ends up as
//! an in-memory buffer. Hashing that buffer gives the content address every
//! cache key starts from; two files with identical bytes share all cached
//! work regardless of their names. The `%PDF` magic is checked before
//! anything is hashed or cached so callers get a meaningful error rather
//! than a pdfium failure.

use crate::cache::content_hash;
use crate::error::Manual2StepsError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Where the manual comes from.
#[derive(Debug, Clone)]
pub enum DocumentSource {
    /// A local file.
    Path(PathBuf),
    /// An HTTP/HTTPS URL, downloaded in full.
    Url(String),
    /// Bytes already in memory; `name` is used in messages only.
    Bytes { bytes: Vec<u8>, name: String },
}

impl DocumentSource {
    /// Interpret a user-supplied string as a URL or a local path.
    pub fn parse(input: &str) -> Result<Self, Manual2StepsError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(Manual2StepsError::InvalidInput {
                input: input.to_string(),
                reason: "input is empty".into(),
            });
        }
        if is_url(trimmed) {
            Ok(DocumentSource::Url(trimmed.to_string()))
        } else {
            Ok(DocumentSource::Path(PathBuf::from(trimmed)))
        }
    }
}

/// A validated PDF held in memory.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    /// Path, URL or name the bytes came from.
    pub origin: String,
    pub bytes: Arc<[u8]>,
    /// Lowercase hex SHA-256 of `bytes`; also the document id.
    pub content_hash: String,
}

impl SourceDocument {
    /// Validate `bytes` as a PDF and hash them.
    pub fn from_bytes(bytes: Vec<u8>, origin: impl Into<String>) -> Result<Self, Manual2StepsError> {
        let origin = origin.into();
        check_magic(&bytes, &origin)?;
        let content_hash = content_hash(&bytes);
        debug!("{}: {} bytes, sha256 {}", origin, bytes.len(), content_hash);
        Ok(Self {
            origin,
            bytes: Arc::from(bytes),
            content_hash,
        })
    }
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Load `source` fully into memory and validate it.
pub async fn resolve_source(
    source: DocumentSource,
    download_timeout_secs: u64,
) -> Result<SourceDocument, Manual2StepsError> {
    match source {
        DocumentSource::Path(path) => {
            let bytes = read_local(&path).await?;
            SourceDocument::from_bytes(bytes, path.display().to_string())
        }
        DocumentSource::Url(url) => {
            let bytes = download_url(&url, download_timeout_secs).await?;
            SourceDocument::from_bytes(bytes, url)
        }
        DocumentSource::Bytes { bytes, name } => SourceDocument::from_bytes(bytes, name),
    }
}

fn check_magic(bytes: &[u8], origin: &str) -> Result<(), Manual2StepsError> {
    if bytes.len() < 4 || &bytes[..4] != b"%PDF" {
        return Err(Manual2StepsError::NotAPdf {
            origin: origin.to_string(),
            magic: bytes.iter().take(4).copied().collect(),
        });
    }
    Ok(())
}

async fn read_local(path: &Path) -> Result<Vec<u8>, Manual2StepsError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            debug!("Read local PDF: {}", path.display());
            Ok(bytes)
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            Err(Manual2StepsError::PermissionDenied { path: path.to_path_buf() })
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(Manual2StepsError::FileNotFound { path: path.to_path_buf() })
        }
        Err(e) => Err(Manual2StepsError::InvalidInput {
            input: path.display().to_string(),
            reason: e.to_string(),
        }),
    }
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<Vec<u8>, Manual2StepsError> {
    info!("Downloading PDF from: {}", url);

    let download_failed = |reason: String| Manual2StepsError::DownloadFailed {
        url: url.to_string(),
        reason,
    };
    let classify = |e: reqwest::Error| {
        if e.is_timeout() {
            Manual2StepsError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            download_failed(e.to_string())
        }
    };

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| download_failed(e.to_string()))?;

    let response = client.get(url).send().await.map_err(classify)?;

    if !response.status().is_success() {
        return Err(download_failed(format!("HTTP {}", response.status())));
    }

    let bytes = response.bytes().await.map_err(classify)?;
    info!("Downloaded {} bytes", bytes.len());
    Ok(bytes.to_vec())
}
