//! Content-addressed artifact cache shared by every persisting stage.
//!
//! ## Layout
//!
//! ```text
//! <artifact_root>/<stage dir>/<cache key>/manifest.json
//!                                        /<stage-specific files>
//! ```
//!
//! A [`CacheKey`] is derived from a SHA-256 content hash plus a canonical
//! (name-sorted) encoding of every parameter that changes the stage's output
//! bytes. The manifest is the sole source of truth for "has this stage
//! already run": sub-artifacts are written first, then the manifest is
//! written to a temporary file in the same directory and renamed into place,
//! so a reader either sees a complete manifest or none at all.
//!
//! Each manifest file is wrapped in an envelope carrying the schema version,
//! the stage name and the unsanitised key encoding. The envelope lets
//! [`ContentAddressedCache::lookup`] tell three situations apart:
//!
//! * **stale** — older schema, unparsable JSON, a referenced artifact has
//!   disappeared: treated as a miss and rebuilt;
//! * **collision** — the directory belongs to a different key: fatal;
//! * **hit** — returned as-is, byte-identical to what was committed.

use crate::config::CachePolicy;
use crate::error::{Manual2StepsError, Stage};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// File name of every stage manifest.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Length of the content-hash prefix used in step identifiers.
pub const SHORT_HASH_LEN: usize = 6;

/// Compute the lowercase hex SHA-256 of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Deterministic identifier of one cache entry.
///
/// Identical `(content hash, parameters)` always produce the identical key;
/// changing, adding or removing any parameter changes it. Parameter order
/// at construction time does not matter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    content_hash: String,
    params: BTreeMap<String, String>,
}

impl CacheKey {
    /// Start a key from the content hash of the input.
    pub fn new(content_hash: impl Into<String>) -> Self {
        Self {
            content_hash: content_hash.into(),
            params: BTreeMap::new(),
        }
    }

    /// Add (or replace) one output-affecting parameter.
    pub fn with_param(mut self, name: &str, value: impl fmt::Display) -> Self {
        self.params.insert(name.to_string(), value.to_string());
        self
    }

    /// The content hash this key was derived from.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Short content-hash prefix used to build step identifiers.
    pub fn short_prefix(&self) -> &str {
        let end = self
            .content_hash
            .char_indices()
            .nth(SHORT_HASH_LEN)
            .map(|(i, _)| i)
            .unwrap_or(self.content_hash.len());
        &self.content_hash[..end]
    }

    /// Canonical, unsanitised encoding: `hash|name=value|…` in name order.
    pub fn canonical(&self) -> String {
        let mut s = self.content_hash.clone();
        for (k, v) in &self.params {
            s.push('|');
            s.push_str(k);
            s.push('=');
            s.push_str(v);
        }
        s
    }

    /// Directory-safe rendering of the key, used as the entry's folder name.
    pub fn as_dir_name(&self) -> String {
        let mut raw = self.content_hash.clone();
        for (k, v) in &self.params {
            raw.push('_');
            raw.push_str(k);
            raw.push_str(v);
        }
        sanitize_path_component(&raw)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_dir_name())
    }
}

/// Make `s` safe to use as a single path component on every platform.
fn sanitize_path_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_run = false;
    for ch in s.chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
            out.push(ch);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }
    let trimmed = out.trim_matches(|c| c == ' ' || c == '.' || c == '_');
    if trimmed.is_empty() {
        "cache".to_string()
    } else {
        trimmed.to_string()
    }
}

/// A persisted, versioned stage manifest.
pub trait StageManifest: Serialize + DeserializeOwned + Send {
    /// The stage that owns this manifest.
    const STAGE: Stage;

    /// Bump when the manifest layout changes; older entries become stale.
    const SCHEMA_VERSION: u32;

    /// The directory key this manifest was committed under.
    fn cache_key(&self) -> &str;

    /// Sub-artifact files the manifest references; all must exist for a hit.
    fn artifact_paths(&self) -> Vec<PathBuf> {
        Vec::new()
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope<M> {
    schema_version: u32,
    stage: Stage,
    key_source: String,
    manifest: M,
}

/// Outcome of looking a key up.
#[derive(Debug)]
pub enum Lookup<M> {
    /// A complete, current manifest.
    Hit(M),
    /// No manifest exists for the key.
    Miss,
    /// A manifest exists but cannot be trusted; the reason is logged.
    Stale(String),
}

/// A manifest together with where it came from.
#[derive(Debug)]
pub struct Cached<M> {
    pub manifest: M,
    /// True when the manifest was resolved rather than rebuilt.
    pub from_cache: bool,
}

/// Result of deleting a cache entry.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InvalidateReport {
    pub removed: usize,
    /// Entries that could not be removed; logged, never fatal.
    pub failed: usize,
}

/// One stage's subtree of the artifact cache.
#[derive(Debug, Clone)]
pub struct ContentAddressedCache {
    stage: Stage,
    stage_root: PathBuf,
}

impl ContentAddressedCache {
    /// Open the subtree of `stage` under `artifact_root`.
    pub fn for_stage(artifact_root: &Path, stage: Stage) -> Result<Self, Manual2StepsError> {
        let dir = stage.artifact_dir().ok_or_else(|| {
            Manual2StepsError::Internal(format!("stage '{stage}' has no artifact directory"))
        })?;
        Ok(Self {
            stage,
            stage_root: artifact_root.join(dir),
        })
    }

    /// Directory holding the entry for `key`.
    pub fn entry_dir(&self, key: &CacheKey) -> PathBuf {
        self.stage_root.join(key.as_dir_name())
    }

    /// Path of the manifest for `key`.
    pub fn manifest_path(&self, key: &CacheKey) -> PathBuf {
        self.entry_dir(key).join(MANIFEST_FILE)
    }

    /// Look `key` up, classifying what was found.
    ///
    /// # Errors
    /// [`Manual2StepsError::CacheCollision`] when the entry was committed for
    /// a different key; [`Manual2StepsError::CacheIo`] when the manifest
    /// exists but cannot be read.
    pub fn lookup<M: StageManifest>(&self, key: &CacheKey) -> Result<Lookup<M>, Manual2StepsError> {
        let path = self.manifest_path(key);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Lookup::Miss),
            Err(e) => return Err(Manual2StepsError::cache_io(path, e)),
        };

        let envelope: Envelope<M> = match serde_json::from_slice(&bytes) {
            Ok(env) => env,
            Err(e) => return Ok(Lookup::Stale(format!("unreadable manifest: {e}"))),
        };

        if envelope.stage != M::STAGE {
            return Err(Manual2StepsError::CacheCollision {
                key: key.as_dir_name(),
                detail: format!(
                    "entry belongs to stage '{}', expected '{}'",
                    envelope.stage,
                    M::STAGE
                ),
            });
        }
        if envelope.schema_version != M::SCHEMA_VERSION {
            return Ok(Lookup::Stale(format!(
                "schema version {} (current {})",
                envelope.schema_version,
                M::SCHEMA_VERSION
            )));
        }
        let canonical = key.canonical();
        if envelope.key_source != canonical || envelope.manifest.cache_key() != key.as_dir_name() {
            return Err(Manual2StepsError::CacheCollision {
                key: key.as_dir_name(),
                detail: format!(
                    "entry was written for '{}', requested '{}'",
                    envelope.key_source, canonical
                ),
            });
        }

        if let Some(missing) = envelope
            .manifest
            .artifact_paths()
            .into_iter()
            .find(|p| !p.exists())
        {
            return Ok(Lookup::Stale(format!(
                "referenced artifact missing: {}",
                missing.display()
            )));
        }

        Ok(Lookup::Hit(envelope.manifest))
    }

    /// Resolve `key` to a complete manifest, or `None` on a miss.
    ///
    /// Stale entries resolve to `None` as well.
    pub fn resolve<M: StageManifest>(&self, key: &CacheKey) -> Result<Option<M>, Manual2StepsError> {
        match self.lookup(key)? {
            Lookup::Hit(m) => Ok(Some(m)),
            Lookup::Miss | Lookup::Stale(_) => Ok(None),
        }
    }

    /// Run `build` to produce the entry for `key` and commit its manifest.
    ///
    /// `build` receives the entry directory (already created), writes every
    /// sub-artifact there and returns the manifest. The manifest only becomes
    /// resolvable once it has been renamed into place; if `build` fails,
    /// nothing is committed.
    pub async fn commit<M, F, Fut>(&self, key: &CacheKey, build: F) -> Result<M, Manual2StepsError>
    where
        M: StageManifest,
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<M, Manual2StepsError>>,
    {
        let dir = self.entry_dir(key);
        std::fs::create_dir_all(&dir).map_err(|e| Manual2StepsError::cache_io(&dir, e))?;

        let manifest = build(dir).await?;

        if manifest.cache_key() != key.as_dir_name() {
            return Err(Manual2StepsError::CacheCollision {
                key: key.as_dir_name(),
                detail: format!(
                    "builder returned a manifest for '{}'",
                    manifest.cache_key()
                ),
            });
        }

        let envelope = Envelope {
            schema_version: M::SCHEMA_VERSION,
            stage: M::STAGE,
            key_source: key.canonical(),
            manifest,
        };
        let path = self.manifest_path(key);
        let bytes = serde_json::to_vec_pretty(&envelope)
            .map_err(|e| Manual2StepsError::Internal(format!("manifest serialisation: {e}")))?;
        write_atomic(&path, &bytes)?;
        debug!("{}: committed {}", self.stage, path.display());

        Ok(envelope.manifest)
    }

    /// Delete the entry for `key`: manifest first, then every sub-artifact.
    ///
    /// Files that cannot be removed are logged and counted; a stale extra
    /// file never affects manifest correctness.
    pub fn invalidate(&self, key: &CacheKey) -> InvalidateReport {
        let mut report = InvalidateReport::default();
        let dir = self.entry_dir(key);

        let manifest = dir.join(MANIFEST_FILE);
        match std::fs::remove_file(&manifest) {
            Ok(()) => report.removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!("{}: could not remove {}: {}", self.stage, manifest.display(), e);
                report.failed += 1;
            }
        }

        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => return report,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let result = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            match result {
                Ok(()) => report.removed += 1,
                Err(e) => {
                    warn!("{}: could not remove {}: {}", self.stage, path.display(), e);
                    report.failed += 1;
                }
            }
        }
        if report.failed == 0 {
            let _ = std::fs::remove_dir(&dir);
        }
        debug!(
            "{}: invalidated {} ({} removed, {} left behind)",
            self.stage,
            key,
            report.removed,
            report.failed
        );
        report
    }

    /// Apply `policy` to `key`: resolve on [`CachePolicy::UseCache`], rebuild otherwise.
    pub async fn get_or_build<M, F, Fut>(
        &self,
        key: &CacheKey,
        policy: CachePolicy,
        build: F,
    ) -> Result<Cached<M>, Manual2StepsError>
    where
        M: StageManifest,
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<M, Manual2StepsError>>,
    {
        self.get_or_build_with(key, policy, |_| None, build).await
    }

    /// Like [`Self::get_or_build`], with an extra currency check on hits.
    ///
    /// `stale_reason` inspects a resolved manifest and returns `Some(reason)`
    /// when it does not match what the caller needs; the entry is then
    /// invalidated and rebuilt.
    pub async fn get_or_build_with<M, C, F, Fut>(
        &self,
        key: &CacheKey,
        policy: CachePolicy,
        stale_reason: C,
        build: F,
    ) -> Result<Cached<M>, Manual2StepsError>
    where
        M: StageManifest,
        C: FnOnce(&M) -> Option<String>,
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<M, Manual2StepsError>>,
    {
        match policy {
            CachePolicy::UseCache => match self.lookup::<M>(key)? {
                Lookup::Hit(manifest) => match stale_reason(&manifest) {
                    None => {
                        debug!("{}: cache hit for {}", self.stage, key);
                        return Ok(Cached {
                            manifest,
                            from_cache: true,
                        });
                    }
                    Some(reason) => {
                        warn!("{}: cached entry {} is stale ({}); rebuilding", self.stage, key, reason);
                        self.invalidate(key);
                    }
                },
                Lookup::Stale(reason) => {
                    warn!("{}: cached entry {} is stale ({}); rebuilding", self.stage, key, reason);
                    self.invalidate(key);
                }
                Lookup::Miss => debug!("{}: cache miss for {}", self.stage, key),
            },
            CachePolicy::Refresh => {
                debug!("{}: refreshing {}", self.stage, key);
                self.invalidate(key);
            }
        }

        let manifest = self.commit(key, build).await?;
        Ok(Cached {
            manifest,
            from_cache: false,
        })
    }
}

/// Write `bytes` to `path` through a temporary file in the same directory.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), Manual2StepsError> {
    let dir = path
        .parent()
        .ok_or_else(|| Manual2StepsError::Internal(format!("no parent for {}", path.display())))?;
    let mut tmp =
        tempfile::NamedTempFile::new_in(dir).map_err(|e| Manual2StepsError::cache_io(dir, e))?;
    tmp.write_all(bytes)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| Manual2StepsError::cache_io(tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| Manual2StepsError::cache_io(path, e.error))?;
    Ok(())
}
