//! RegionDetector adapter: run the external step-panel detector over every
//! rendered page and normalise its output into a page-indexed table.
//!
//! The detector is an external collaborator. Its records are untrusted: a
//! record with the wrong number of coordinates, a non-finite or non-numeric
//! value, a confidence outside `[0, 1]` or a negative class is discarded with
//! a warning. A page the detector fails on contributes no detections and is
//! listed in `failed_pages`; a batched call that fails as a whole, or returns
//! a different number of results than it was given, is fatal because results
//! can no longer be matched to pages.

use crate::cache::{CacheKey, Cached, ContentAddressedCache, StageManifest};
use crate::config::PipelineConfig;
use crate::error::{CollaboratorError, Manual2StepsError, Stage};
use crate::pipeline::geometry::BBox;
use crate::pipeline::render::RenderManifest;
use crate::pipeline::response::parse_structured;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A detection exactly as the detector reported it.
///
/// Missing `confidence` and `class_id` default to 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    #[serde(alias = "bbox", alias = "xyxy")]
    pub bbox_xyxy: Vec<f32>,
    #[serde(default, alias = "conf", alias = "score")]
    pub confidence: f32,
    #[serde(default, alias = "class", alias = "cls")]
    pub class_id: i64,
}

impl RawDetection {
    /// Lenient decoding of one untrusted JSON record.
    ///
    /// Never fails: a field of the wrong type becomes a value that
    /// [`Detection::from_raw`] rejects, so the record is counted as discarded
    /// instead of poisoning the rest of the batch.
    pub fn from_value(value: &serde_json::Value) -> Self {
        let field = |names: &[&str]| names.iter().find_map(|n| value.get(*n));
        let number = |v: &serde_json::Value| v.as_f64().map_or(f32::NAN, |x| x as f32);

        let bbox_xyxy = match field(&["bbox_xyxy", "bbox", "xyxy"]) {
            Some(serde_json::Value::Array(coords)) => coords.iter().map(number).collect(),
            _ => Vec::new(),
        };
        let confidence = field(&["confidence", "conf", "score"]).map_or(0.0, number);
        let class_id = field(&["class_id", "class", "cls"]).map_or(0, |v| v.as_i64().unwrap_or(-1));

        Self {
            bbox_xyxy,
            confidence,
            class_id,
        }
    }
}

/// A validated candidate region on one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Detector coordinates; corner order is not yet guaranteed.
    pub bbox: BBox,
    pub confidence: f32,
    pub class_id: u32,
}

impl Detection {
    /// Validate a raw record; `None` means discard.
    pub fn from_raw(raw: &RawDetection) -> Option<Self> {
        let bbox = BBox::from_xyxy(&raw.bbox_xyxy)?;
        if !(0.0..=1.0).contains(&raw.confidence) {
            return None;
        }
        let class_id = u32::try_from(raw.class_id).ok()?;
        Some(Self {
            bbox,
            confidence: raw.confidence,
            class_id,
        })
    }
}

/// The external image → candidate boxes capability.
#[async_trait]
pub trait RegionDetector: Send + Sync {
    /// Stable identifier; part of the detection cache key.
    fn id(&self) -> &str;

    /// Detect regions on one page image.
    async fn detect(&self, image: &Path) -> Result<Vec<RawDetection>, CollaboratorError>;

    /// Whether [`Self::detect_batch`] is cheaper than per-page calls.
    fn supports_batch(&self) -> bool {
        false
    }

    /// Detect regions on several pages; results must be in input order.
    ///
    /// The outer error fails the whole batch; inner errors fail one page.
    async fn detect_batch(
        &self,
        images: &[PathBuf],
    ) -> Result<Vec<Result<Vec<RawDetection>, CollaboratorError>>, CollaboratorError> {
        let mut out = Vec::with_capacity(images.len());
        for image in images {
            out.push(self.detect(image).await);
        }
        Ok(out)
    }
}

/// Persisted record of the detection stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionManifest {
    pub cache_key: String,
    pub detector: String,
    /// Every rendered page, including those with zero detections.
    pub by_page: BTreeMap<usize, Vec<Detection>>,
    pub detection_count: usize,
    /// Records discarded as malformed.
    pub discarded_count: usize,
    /// Pages the detector failed on.
    pub failed_pages: Vec<usize>,
}

impl StageManifest for DetectionManifest {
    const STAGE: Stage = Stage::Detect;
    const SCHEMA_VERSION: u32 = 1;

    fn cache_key(&self) -> &str {
        &self.cache_key
    }
}

impl DetectionManifest {
    pub fn detections_for(&self, page_index: usize) -> &[Detection] {
        self.by_page
            .get(&page_index)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Detection cache key: the render key plus the detector id.
pub fn detection_cache_key(render_key: &CacheKey, detector_id: &str) -> CacheKey {
    render_key.clone().with_param("detector", detector_id)
}

/// Run the detector over every rendered page, or resolve a cached run.
///
/// A cached run in which the detector failed on some page is treated as
/// stale, so transient failures are retried on the next invocation.
pub async fn detect_regions(
    render: &RenderManifest,
    render_key: &CacheKey,
    config: &PipelineConfig,
    detector: Arc<dyn RegionDetector>,
) -> Result<Cached<DetectionManifest>, Manual2StepsError> {
    let cache = ContentAddressedCache::for_stage(&config.artifact_root, Stage::Detect)?;
    let key = detection_cache_key(render_key, detector.id());
    let cache_key = key.as_dir_name();

    let pages: Vec<(usize, PathBuf)> = render
        .rendered_pages()
        .filter_map(|p| p.image_path.clone().map(|path| (p.page_index, path)))
        .collect();
    let concurrency = config.concurrency;

    cache
        .get_or_build_with(
            &key,
            config.cache_policy,
            |m: &DetectionManifest| {
                (!m.failed_pages.is_empty())
                    .then(|| format!("detector failed on pages {:?}", m.failed_pages))
            },
            move |_dir| async move {
                let results = run_detector(detector.as_ref(), &pages, concurrency).await?;
                Ok(normalise(cache_key, detector.id(), &pages, results))
            },
        )
        .await
}

async fn run_detector(
    detector: &dyn RegionDetector,
    pages: &[(usize, PathBuf)],
    concurrency: usize,
) -> Result<Vec<Result<Vec<RawDetection>, CollaboratorError>>, Manual2StepsError> {
    if detector.supports_batch() {
        let images: Vec<PathBuf> = pages.iter().map(|(_, p)| p.clone()).collect();
        debug!("Detecting regions on {} pages in one batch", images.len());
        let results = detector
            .detect_batch(&images)
            .await
            .map_err(|e| Manual2StepsError::Detector {
                detector: detector.id().to_string(),
                detail: e.to_string(),
            })?;
        if results.len() != images.len() {
            return Err(Manual2StepsError::Detector {
                detector: detector.id().to_string(),
                detail: format!(
                    "batch returned {} results for {} pages",
                    results.len(),
                    images.len()
                ),
            });
        }
        Ok(results)
    } else {
        // `buffered` keeps input order, so results line up with `pages`.
        Ok(stream::iter(pages.iter())
            .map(|(idx, path)| async move {
                debug!("Detecting regions on page {}", idx);
                detector.detect(path).await
            })
            .buffered(concurrency.max(1))
            .collect()
            .await)
    }
}

fn normalise(
    cache_key: String,
    detector_id: &str,
    pages: &[(usize, PathBuf)],
    results: Vec<Result<Vec<RawDetection>, CollaboratorError>>,
) -> DetectionManifest {
    let mut by_page = BTreeMap::new();
    let mut failed_pages = Vec::new();
    let mut detection_count = 0;
    let mut discarded_count = 0;

    for ((page_index, _), result) in pages.iter().zip(results) {
        let raw = match result {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Detector failed on page {}: {}", page_index, e);
                failed_pages.push(*page_index);
                by_page.insert(*page_index, Vec::new());
                continue;
            }
        };
        let mut accepted = Vec::with_capacity(raw.len());
        for record in &raw {
            match Detection::from_raw(record) {
                Some(d) => accepted.push(d),
                None => {
                    warn!("Discarding malformed detection on page {}: {:?}", page_index, record);
                    discarded_count += 1;
                }
            }
        }
        debug!("Page {}: {} detections", page_index, accepted.len());
        detection_count += accepted.len();
        by_page.insert(*page_index, accepted);
    }

    info!(
        "Detected {} regions on {} pages ({} discarded, {} pages failed)",
        detection_count,
        pages.len(),
        discarded_count,
        failed_pages.len()
    );

    DetectionManifest {
        cache_key,
        detector: detector_id.to_string(),
        by_page,
        detection_count,
        discarded_count,
        failed_pages,
    }
}

// ── External-process detector ────────────────────────────────────────────────

/// Runs an external detector program once per batch.
///
/// The program receives the page image paths as trailing arguments and must
/// print a JSON array with one array of detections per image, in argument
/// order:
///
/// ```json
/// [[{"bbox_xyxy": [10, 10, 100, 100], "confidence": 0.9, "class_id": 0}], []]
/// ```
///
/// Records are decoded one by one with [`RawDetection::from_value`], so a
/// malformed record is discarded without losing its neighbours.
#[derive(Debug, Clone)]
pub struct CommandDetector {
    program: PathBuf,
    args: Vec<String>,
    id: String,
    timeout: Duration,
}

impl CommandDetector {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        let program = program.into();
        let name = program
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "detector".to_string());
        Self {
            id: format!("cmd-{name}"),
            program,
            args,
            timeout: Duration::from_secs(600),
        }
    }

    /// Override the id (e.g. to include the model weights version).
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn failed(&self, detail: String) -> CollaboratorError {
        CollaboratorError::Failed {
            role: "detector".into(),
            retries: 0,
            detail,
        }
    }

    /// Run the program once; one entry per image, in argument order.
    ///
    /// Records are decoded one at a time. A page entry that is not a list
    /// fails that page only.
    async fn run(
        &self,
        images: &[PathBuf],
    ) -> Result<Vec<Result<Vec<RawDetection>, CollaboratorError>>, CollaboratorError> {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args).args(images).kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| CollaboratorError::Timeout {
                role: "detector".into(),
                secs: self.timeout.as_secs(),
            })?
            .map_err(|e| self.failed(format!("could not start {}: {e}", self.program.display())))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(self.failed(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let pages: Vec<serde_json::Value> =
            parse_structured(&stdout).map_err(|e| CollaboratorError::Malformed {
                role: "detector".into(),
                detail: e.to_string(),
            })?;

        Ok(pages
            .into_iter()
            .map(|page| match page {
                serde_json::Value::Array(records) => {
                    Ok(records.iter().map(RawDetection::from_value).collect())
                }
                other => Err(CollaboratorError::Malformed {
                    role: "detector".into(),
                    detail: format!("expected a list of detections, got {other}"),
                }),
            })
            .collect())
    }
}

#[async_trait]
impl RegionDetector for CommandDetector {
    fn id(&self) -> &str {
        &self.id
    }

    async fn detect(&self, image: &Path) -> Result<Vec<RawDetection>, CollaboratorError> {
        let mut all = self.run(&[image.to_path_buf()]).await?;
        if all.len() != 1 {
            return Err(CollaboratorError::Malformed {
                role: "detector".into(),
                detail: format!("expected 1 result, got {}", all.len()),
            });
        }
        all.remove(0)
    }

    fn supports_batch(&self) -> bool {
        true
    }

    async fn detect_batch(
        &self,
        images: &[PathBuf],
    ) -> Result<Vec<Result<Vec<RawDetection>, CollaboratorError>>, CollaboratorError> {
        if images.is_empty() {
            return Ok(Vec::new());
        }
        self.run(images).await
    }
}
