//! PipelineOrchestrator: the public conversion entry points.
//!
//! Stages run strictly in order; each consumes the complete manifest of the
//! one before it:
//!
//! ```text
//! input ─▶ render ─▶ detect ─▶ crop ─┬─ no steps ─▶ empty manual
//!                                    └─ negotiate (per step) ─▶ assemble ─▶ store
//! ```
//!
//! Every stage but input and assembly is cached under the artifact root, so
//! a rerun on the same bytes and settings touches no collaborator. Every
//! fatal error leaves here tagged with the stage that raised it.

use crate::cache::{CacheKey, ContentAddressedCache};
use crate::config::PipelineConfig;
use crate::error::{Manual2StepsError, Stage};
use crate::output::{
    assemble_text, AssembledManual, InstructionsManifest, PipelineStats, StepInstruction, StepStatus,
};
use crate::pipeline::crop::{crop_steps, CropManifest};
use crate::pipeline::detect::{detect_regions, detection_cache_key, RegionDetector};
use crate::pipeline::input::{resolve_source, DocumentSource};
use crate::pipeline::llm::{llm_roles, Critic, Proposer};
use crate::pipeline::negotiate::{negotiate_step, MAX_PROPOSER_CALLS};
use crate::pipeline::render::{render_cache_key, render_document, PdfiumRasterizer, Rasterizer};
use crate::store::DocumentStore;
use futures::stream::{self, StreamExt};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// The external capabilities a pipeline run uses, constructed once.
#[derive(Clone)]
pub struct Collaborators {
    pub rasterizer: Arc<dyn Rasterizer>,
    pub detector: Arc<dyn RegionDetector>,
    pub proposer: Arc<dyn Proposer>,
    pub critic: Arc<dyn Critic>,
    /// Receives the assembled text under the document id, when set.
    pub store: Option<Arc<dyn DocumentStore>>,
}

impl Collaborators {
    /// pdfium rendering and LLM roles resolved from `config`, around `detector`.
    pub fn from_config(
        config: &PipelineConfig,
        detector: Arc<dyn RegionDetector>,
    ) -> Result<Self, Manual2StepsError> {
        let (proposer, critic) = llm_roles(config)?;
        Ok(Self {
            rasterizer: Arc::new(PdfiumRasterizer),
            detector,
            proposer,
            critic,
            store: None,
        })
    }

    pub fn with_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }
}

/// Instructions cache key: everything that shapes the negotiated text.
fn instructions_cache_key(crop_key: &CacheKey, config: &PipelineConfig, collab: &Collaborators) -> CacheKey {
    crop_key
        .clone()
        .with_param("pad", config.padding_px)
        .with_param("min", config.min_box_size_px)
        .with_param("proposer", collab.proposer.id())
        .with_param("critic", collab.critic.id())
        .with_param("turns", MAX_PROPOSER_CALLS)
        .with_param("ctx", config.carry_prior_context)
}

/// Convert an assembly manual into ordered step instructions.
///
/// # Returns
/// `Ok(AssembledManual)` whenever every stage completed, including when the
/// document yields no steps (empty `steps` and `text`). Steps that ended in
/// `exhausted` or `ambiguous-exit` are included; their status, and the role
/// error that cut a step short, are in [`AssembledManual::steps`].
///
/// # Errors
/// A single [`Manual2StepsError::StageFailed`] naming the failing stage.
pub async fn convert(
    source: DocumentSource,
    config: &PipelineConfig,
    collaborators: &Collaborators,
) -> Result<AssembledManual, Manual2StepsError> {
    let total_start = Instant::now();
    let progress = config.progress_callback.clone();
    let mut stats = PipelineStats::default();

    // ── Input ────────────────────────────────────────────────────────────
    let document = resolve_source(source, config.download_timeout_secs)
        .await
        .map_err(|e| e.in_stage(Stage::Input))?;
    info!(
        "Starting conversion: {} ({} bytes, {})",
        document.origin,
        document.bytes.len(),
        &document.content_hash[..12]
    );

    // ── Render ───────────────────────────────────────────────────────────
    if let Some(ref cb) = progress {
        cb.on_stage_start(Stage::Render);
    }
    let start = Instant::now();
    let render_key = render_cache_key(&document.content_hash, config);
    let render = render_document(&document, config, Arc::clone(&collaborators.rasterizer))
        .await
        .map_err(|e| e.in_stage(Stage::Render))?;
    stats.render_duration_ms = start.elapsed().as_millis() as u64;
    stats.cache_hits.render = render.from_cache;
    stats.page_count = render.manifest.page_count;
    stats.failed_pages = render.manifest.failed_page_count();
    if let Some(ref cb) = progress {
        cb.on_stage_complete(Stage::Render, render.from_cache);
    }
    info!(
        "Rendered {} pages ({} failed) in {}ms",
        stats.page_count, stats.failed_pages, stats.render_duration_ms
    );

    // ── Detect ───────────────────────────────────────────────────────────
    if let Some(ref cb) = progress {
        cb.on_stage_start(Stage::Detect);
    }
    let start = Instant::now();
    let detect_key = detection_cache_key(&render_key, collaborators.detector.id());
    let detections = detect_regions(
        &render.manifest,
        &render_key,
        config,
        Arc::clone(&collaborators.detector),
    )
    .await
    .map_err(|e| e.in_stage(Stage::Detect))?;
    stats.detect_duration_ms = start.elapsed().as_millis() as u64;
    stats.cache_hits.detect = detections.from_cache;
    stats.detection_count = detections.manifest.detection_count;
    stats.detector_failed_pages = detections.manifest.failed_pages.len();
    if let Some(ref cb) = progress {
        cb.on_stage_complete(Stage::Detect, detections.from_cache);
    }

    // ── Crop ─────────────────────────────────────────────────────────────
    if let Some(ref cb) = progress {
        cb.on_stage_start(Stage::Crop);
    }
    let start = Instant::now();
    let crops = crop_steps(&render.manifest, &detections.manifest, &detect_key, config)
        .await
        .map_err(|e| e.in_stage(Stage::Crop))?;
    stats.crop_duration_ms = start.elapsed().as_millis() as u64;
    stats.cache_hits.crop = crops.from_cache;
    if let Some(ref cb) = progress {
        cb.on_stage_complete(Stage::Crop, crops.from_cache);
    }
    info!(
        "{} detections → {} steps",
        stats.detection_count, crops.manifest.step_count
    );

    // ── Negotiate ────────────────────────────────────────────────────────
    let steps = if crops.manifest.steps.is_empty() {
        info!("No steps detected; the manual is empty");
        Vec::new()
    } else {
        if let Some(ref cb) = progress {
            cb.on_stage_start(Stage::Negotiate);
        }
        let start = Instant::now();
        let cache = ContentAddressedCache::for_stage(&config.artifact_root, Stage::Negotiate)
            .map_err(|e| e.in_stage(Stage::Negotiate))?;
        let key = instructions_cache_key(&detect_key, config, collaborators);
        let cache_key = key.as_dir_name();
        let crop_manifest = &crops.manifest;

        // Steps without any draft are retried on the next run.
        let negotiated = cache
            .get_or_build_with(
                &key,
                config.cache_policy,
                |m: &InstructionsManifest| {
                    let undrafted: Vec<&str> = m
                        .steps
                        .iter()
                        .filter(|s| s.is_undrafted())
                        .map(|s| s.step_id.as_str())
                        .collect();
                    (!undrafted.is_empty()).then(|| format!("no draft for steps {undrafted:?}"))
                },
                move |_dir| async move {
                    let steps = negotiate_all(crop_manifest, config, collaborators).await;
                    Ok::<_, Manual2StepsError>(InstructionsManifest {
                        cache_key,
                        proposer: collaborators.proposer.id().to_string(),
                        critic: collaborators.critic.id().to_string(),
                        max_proposer_calls: MAX_PROPOSER_CALLS,
                        step_count: steps.len(),
                        steps,
                    })
                },
            )
            .await
            .map_err(|e| e.in_stage(Stage::Negotiate))?;
        stats.negotiate_duration_ms = start.elapsed().as_millis() as u64;
        stats.cache_hits.negotiate = negotiated.from_cache;
        if let Some(ref cb) = progress {
            cb.on_stage_complete(Stage::Negotiate, negotiated.from_cache);
        }
        negotiated.manifest.steps
    };

    // ── Assemble ─────────────────────────────────────────────────────────
    let text = assemble_text(&steps);
    stats.record_steps(&steps);

    if let Some(ref store) = collaborators.store {
        store
            .put(&document.content_hash, &text)
            .await
            .map_err(|e| e.in_stage(Stage::Assemble))?;
    }

    stats.total_duration_ms = total_start.elapsed().as_millis() as u64;
    info!(
        "Conversion complete: {} steps ({} accepted, {} ambiguous, {} exhausted, {} skipped), {}ms total",
        stats.step_count,
        stats.accepted,
        stats.ambiguous_exits,
        stats.exhausted,
        stats.skipped,
        stats.total_duration_ms
    );
    if stats.undrafted > 0 {
        warn!("{} steps have no instruction; rerun to retry them", stats.undrafted);
    }
    if let Some(ref cb) = progress {
        cb.on_pipeline_complete(steps.len());
    }

    Ok(AssembledManual {
        document_id: document.content_hash.clone(),
        cover: render.manifest.cover(),
        steps,
        text,
        stats,
    })
}

/// Negotiate every step, returning them in reading order.
///
/// With prior-step context each step waits for the previous one's final
/// text; otherwise steps run concurrently and are re-sorted afterwards.
/// A step that fails ends as exhausted and never affects its neighbours.
async fn negotiate_all(
    crops: &CropManifest,
    config: &PipelineConfig,
    collaborators: &Collaborators,
) -> Vec<StepInstruction> {
    let total = crops.steps.len();
    let progress = config.progress_callback.as_ref();
    let proposer = collaborators.proposer.as_ref();
    let critic = collaborators.critic.as_ref();
    if let Some(cb) = progress {
        cb.on_negotiation_start(total);
    }

    if config.carry_prior_context {
        let mut results: Vec<StepInstruction> = Vec::with_capacity(total);
        for step in &crops.steps {
            if let Some(cb) = progress {
                cb.on_step_start(step.global_step_index, total);
            }
            // Only a real draft is worth carrying forward.
            let prior = results
                .iter()
                .rev()
                .find(|s| !s.is_undrafted() && s.status != StepStatus::Skipped)
                .map(|s| s.text.as_str());
            let outcome =
                negotiate_step(step, prior, proposer, critic, config.step_call_timeout_secs).await;
            if let Some(cb) = progress {
                cb.on_step_complete(step.global_step_index, total, outcome.status);
            }
            results.push(outcome);
        }
        return results;
    }

    let mut results: Vec<StepInstruction> = stream::iter(crops.steps.iter())
        .map(|step| async move {
            if let Some(cb) = progress {
                cb.on_step_start(step.global_step_index, total);
            }
            let outcome =
                negotiate_step(step, None, proposer, critic, config.step_call_timeout_secs).await;
            if let Some(cb) = progress {
                cb.on_step_complete(step.global_step_index, total, outcome.status);
            }
            outcome
        })
        .buffer_unordered(config.concurrency)
        .collect()
        .await;

    results.sort_by_key(|s| s.global_step_index);
    debug!("Negotiated {} steps", results.len());
    results
}

/// Convert PDF bytes already in memory.
///
/// `name` appears in log and error messages only; the document id is the
/// hash of `bytes`.
pub async fn convert_from_bytes(
    bytes: Vec<u8>,
    name: impl Into<String>,
    config: &PipelineConfig,
    collaborators: &Collaborators,
) -> Result<AssembledManual, Manual2StepsError> {
    let source = DocumentSource::Bytes {
        bytes,
        name: name.into(),
    };
    convert(source, config, collaborators).await
}

/// Convert and write the assembled text to `output_path`.
///
/// Uses atomic write (temp file + rename) to prevent partial files.
pub async fn convert_to_file(
    source: DocumentSource,
    output_path: impl AsRef<Path>,
    config: &PipelineConfig,
    collaborators: &Collaborators,
) -> Result<AssembledManual, Manual2StepsError> {
    let manual = convert(source, config, collaborators).await?;
    let path = output_path.as_ref();
    let write_err = |source: std::io::Error| {
        Manual2StepsError::OutputWriteFailed {
            path: path.to_path_buf(),
            source,
        }
        .in_stage(Stage::Assemble)
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }

    let tmp_path = path.with_extension("md.tmp");
    tokio::fs::write(&tmp_path, &manual.text)
        .await
        .map_err(write_err)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(write_err)?;

    Ok(manual)
}

/// Synchronous wrapper around [`convert`].
///
/// Creates a temporary tokio runtime internally.
pub fn convert_sync(
    source: DocumentSource,
    config: &PipelineConfig,
    collaborators: &Collaborators,
) -> Result<AssembledManual, Manual2StepsError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| Manual2StepsError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(convert(source, config, collaborators))
}
