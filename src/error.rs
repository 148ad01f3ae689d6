//! Error types for the manual2steps library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`Manual2StepsError`] — **Fatal**: the pipeline cannot produce a
//!   document (unreadable input, bad configuration, a corrupted cache entry
//!   that collides with another input). Returned as `Err(Manual2StepsError)`
//!   from the top-level `convert*` functions, wrapped in
//!   [`Manual2StepsError::StageFailed`] so the caller knows which stage gave up.
//!
//! * [`CollaboratorError`] — **Non-fatal**: one call to an external
//!   collaborator (detector, proposer, critic) failed or timed out. The
//!   detector adapter and the negotiation loop absorb these locally: a page
//!   loses its detections, a step is finalised as exhausted.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Pipeline stage names, used to tag fatal errors and progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Input,
    Render,
    Detect,
    Crop,
    Negotiate,
    Assemble,
}

impl Stage {
    /// Directory name of the stage's subtree under the artifact root.
    ///
    /// Stages that persist nothing (`Input`, `Assemble`) return `None`.
    pub fn artifact_dir(&self) -> Option<&'static str> {
        match self {
            Stage::Render => Some("pdf_pages"),
            Stage::Detect => Some("detections"),
            Stage::Crop => Some("step_crops"),
            Stage::Negotiate => Some("instructions"),
            Stage::Input | Stage::Assemble => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Input => "input",
            Stage::Render => "render",
            Stage::Detect => "detect",
            Stage::Crop => "crop",
            Stage::Negotiate => "negotiate",
            Stage::Assemble => "assemble",
        };
        f.write_str(name)
    }
}

/// All fatal errors returned by the manual2steps library.
///
/// Per-call collaborator failures use [`CollaboratorError`] and are absorbed
/// by the stage that made the call rather than propagated here.
#[derive(Debug, Error)]
pub enum Manual2StepsError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The input is empty or neither a path nor a valid HTTP/HTTPS URL.
    #[error("Invalid input '{input}': {reason}")]
    InvalidInput { input: String, reason: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    /// The bytes were read, but they are not a PDF.
    #[error("Input '{origin}' is not a valid PDF\nFirst bytes: {magic:?}")]
    NotAPdf { origin: String, magic: Vec<u8> },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{origin}' is corrupt: {detail}")]
    CorruptPdf { origin: String, detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF '{origin}' is encrypted and requires a password.\nProvide it with --password <PASSWORD>.")]
    PasswordRequired { origin: String },

    /// A password was provided but it is wrong.
    #[error("Wrong password for PDF '{origin}'")]
    WrongPassword { origin: String },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
PDFium is normally downloaded automatically on first run.\n\
If the auto-download failed, set PDFIUM_LIB_PATH=/path/to/libpdfium to use an existing copy.\n"
    )]
    PdfiumBindingFailed(String),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A raster output format other than the supported one was requested.
    #[error("Unsupported output format '{requested}' (supported: {supported})")]
    UnsupportedFormat {
        requested: String,
        supported: &'static str,
    },

    // ── Cache errors ──────────────────────────────────────────────────────
    /// Reading or writing inside the artifact tree failed.
    #[error("Artifact cache I/O failed at '{path}': {source}")]
    CacheIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Two distinct inputs mapped onto the same output location.
    #[error("Cache collision for key '{key}': {detail}")]
    CacheCollision { key: String, detail: String },

    // ── Collaborator contract errors ──────────────────────────────────────
    /// The detector broke its contract (batch length mismatch, unparsable output
    /// for a whole batch, process could not be started).
    #[error("Region detector '{detector}' failed: {detail}")]
    Detector { detector: String, detail: String },

    /// The configured LLM provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Output errors ─────────────────────────────────────────────────────
    /// Could not create or write the output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The document store rejected a read or write.
    #[error("Document store failed for '{id}': {detail}")]
    StoreFailed { id: String, detail: String },

    // ── Wrapping ──────────────────────────────────────────────────────────
    /// A fatal error, tagged with the pipeline stage that raised it.
    #[error("{stage} stage failed: {source}")]
    StageFailed {
        stage: Stage,
        #[source]
        source: Box<Manual2StepsError>,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Manual2StepsError {
    /// Tag this error with the stage that raised it.
    ///
    /// Already-tagged errors keep their original stage.
    pub fn in_stage(self, stage: Stage) -> Self {
        match self {
            tagged @ Manual2StepsError::StageFailed { .. } => tagged,
            other => Manual2StepsError::StageFailed {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// The stage this error was tagged with, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Manual2StepsError::StageFailed { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Shorthand for a [`Manual2StepsError::CacheIo`] error.
    pub(crate) fn cache_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Manual2StepsError::CacheIo {
            path: path.into(),
            source,
        }
    }
}

/// A non-fatal failure of a single collaborator call.
///
/// Absorbed by the calling stage: the detector adapter counts the page as
/// failed, the negotiation loop ends the step as exhausted and keeps the
/// error in the step's audit record.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
pub enum CollaboratorError {
    /// The call did not complete within its time budget.
    #[error("{role} call timed out after {secs}s")]
    Timeout { role: String, secs: u64 },

    /// The call failed after all retries.
    #[error("{role} call failed after {retries} retries: {detail}")]
    Failed {
        role: String,
        retries: u32,
        detail: String,
    },

    /// The call returned output that could not be interpreted.
    #[error("{role} returned malformed output: {detail}")]
    Malformed { role: String, detail: String },

    /// An input artifact for the call (e.g. a step image) could not be read.
    #[error("{role} input unavailable: {detail}")]
    InputUnavailable { role: String, detail: String },
}
