//! Document store: persistence for the assembled text of each manual.
//!
//! The pipeline only needs `put` and `get`, keyed by the document id (the
//! SHA-256 of the PDF bytes). [`FileDocumentStore`] keeps one Markdown file
//! per document; [`MemoryDocumentStore`] is for tests and embedding.

use crate::error::Manual2StepsError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::debug;

/// Key-value persistence for final per-document text.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn put(&self, id: &str, text: &str) -> Result<(), Manual2StepsError>;

    /// `Ok(None)` when nothing is stored under `id`.
    async fn get(&self, id: &str) -> Result<Option<String>, Manual2StepsError>;
}

/// Reject ids that would escape the store directory.
fn check_id(id: &str) -> Result<(), Manual2StepsError> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Manual2StepsError::StoreFailed {
            id: id.to_string(),
            detail: "ids may contain only ASCII letters, digits, '-' and '_'".into(),
        })
    }
}

/// Stores each document as `{dir}/{id}.md`, written atomically.
#[derive(Debug, Clone)]
pub struct FileDocumentStore {
    dir: PathBuf,
}

impl FileDocumentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.md"))
    }
}

#[async_trait]
impl DocumentStore for FileDocumentStore {
    async fn put(&self, id: &str, text: &str) -> Result<(), Manual2StepsError> {
        check_id(id)?;
        let path = self.path_for(id);
        let dir = self.dir.clone();
        let bytes = text.as_bytes().to_vec();
        let store_err = |detail: String| Manual2StepsError::StoreFailed {
            id: id.to_string(),
            detail,
        };

        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&dir).map_err(|e| Manual2StepsError::cache_io(&dir, e))?;
            crate::cache::write_atomic(&path, &bytes)
        })
        .await
        .map_err(|e| store_err(format!("store task panicked: {e}")))?
        .map_err(|e| store_err(e.to_string()))?;

        debug!("Stored document {} ({} bytes)", id, text.len());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<String>, Manual2StepsError> {
        check_id(id)?;
        match tokio::fs::read_to_string(self.path_for(id)).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Manual2StepsError::StoreFailed {
                id: id.to_string(),
                detail: e.to_string(),
            }),
        }
    }
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    docs: RwLock<HashMap<String, String>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.docs.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn put(&self, id: &str, text: &str) -> Result<(), Manual2StepsError> {
        let mut docs = self.docs.write().map_err(|_| Manual2StepsError::StoreFailed {
            id: id.to_string(),
            detail: "store lock poisoned".into(),
        })?;
        docs.insert(id.to_string(), text.to_string());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<String>, Manual2StepsError> {
        let docs = self.docs.read().map_err(|_| Manual2StepsError::StoreFailed {
            id: id.to_string(),
            detail: "store lock poisoned".into(),
        })?;
        Ok(docs.get(id).cloned())
    }
}
