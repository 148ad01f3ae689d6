//! # manual2steps
//!
//! Turn furniture-assembly manuals (PDF) into ordered, per-step text
//! instructions.
//!
//! ## Why this crate?
//!
//! Assembly manuals are mostly pictures: numbered panels showing parts,
//! hardware and arrows, with little or no text. This crate renders every
//! page, asks a region detector where the step panels are, crops each panel,
//! and has a vision model describe it. A second, text-only model plays a
//! novice builder who cannot see the picture; when it asks a question the
//! vision model rewrites its instruction. The exchange is bounded, so every
//! step ends with exactly one instruction.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Input      resolve a local file, URL or byte buffer; SHA-256 it
//!  ├─ 2. Render     rasterise pages via pdfium (CPU-bound, spawn_blocking)
//!  ├─ 3. Detect     step-panel boxes from a RegionDetector
//!  ├─ 4. Crop       clamp, filter, order and pad boxes; save one image per step
//!  ├─ 5. Negotiate  proposer ⇄ critic, at most 3 drafts per step
//!  └─ 6. Assemble   "## Step N" sections + per-step audit + stats
//! ```
//!
//! Stages 2–5 are cached under an artifact root, keyed by the document hash
//! and every parameter that affects their output.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use manual2steps::{convert, Collaborators, CommandDetector, DocumentSource, PipelineConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let config = PipelineConfig::builder().artifact_root("artifacts").build()?;
//!     let detector = CommandDetector::new("./detect_steps.py", vec![]);
//!     let collaborators = Collaborators::from_config(&config, Arc::new(detector))?;
//!
//!     let manual = convert(DocumentSource::parse("manual.pdf")?, &config, &collaborators).await?;
//!     println!("{}", manual.text);
//!     eprintln!("{} steps, {} accepted", manual.stats.step_count, manual.stats.accepted);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature   | Default | Description |
//! |-----------|---------|-------------|
//! | `cli`     | on      | Enables the `manual2steps` binary (clap + anyhow + tracing-subscriber + indicatif) |
//! | `bundled` | off     | Embeds the pdfium shared library at compile time |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod cache;
pub mod config;
pub mod convert;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use cache::{CacheKey, ContentAddressedCache};
pub use config::{CachePolicy, PipelineConfig, PipelineConfigBuilder, RasterFormat};
pub use convert::{convert, convert_from_bytes, convert_sync, convert_to_file, Collaborators};
pub use error::{CollaboratorError, Manual2StepsError, Stage};
pub use output::{AssembledManual, CoverPage, PipelineStats, StepInstruction, StepStatus};
pub use pipeline::detect::{CommandDetector, Detection, RegionDetector};
pub use pipeline::input::{resolve_source, DocumentSource, SourceDocument};
pub use pipeline::llm::{Critic, CriticVerdict, LlmCritic, LlmProposer, ProposalRequest, Proposer};
pub use pipeline::render::{PdfiumRasterizer, Rasterizer};
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback};
pub use store::{DocumentStore, FileDocumentStore, MemoryDocumentStore};
