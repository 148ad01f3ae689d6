//! StepCropper: cut one image per accepted detection out of its page.
//!
//! Per page, in ascending page order:
//!
//! 1. skip pages without an image or without detections;
//! 2. open the page once and take its real pixel size `W × H`;
//! 3. clamp every box to the page, repair inverted corners and drop boxes
//!    with an edge shorter than `min_box_size_px`;
//! 4. sort survivors top-to-bottom, then left-to-right;
//! 5. pad, re-clamp, drop boxes that collapse, crop and save.
//!
//! Pages are cropped in parallel on the blocking pool. Within-page ordinals
//! are assigned while cropping; the document-wide `global_step_index` is
//! assigned only after every page has finished, so it never depends on
//! completion order.
//!
//! A page image that cannot be decoded contributes no steps and is listed in
//! `unreadable_pages`; such a manifest is stale on the next run, as with the
//! detector's failed pages.

use crate::cache::{CacheKey, Cached, ContentAddressedCache, StageManifest};
use crate::config::{PipelineConfig, RasterFormat};
use crate::error::{Manual2StepsError, Stage};
use crate::pipeline::detect::{Detection, DetectionManifest};
use crate::pipeline::geometry::{BBox, PixelRect};
use crate::pipeline::render::{PageRecord, RenderManifest};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// One accepted, cropped step panel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCrop {
    /// `{hash prefix}_p{page:03}_s{ordinal:02}`; unique within a manifest.
    pub step_id: String,
    /// Document-wide reading-order position (0-based).
    pub global_step_index: usize,
    pub page_index: usize,
    /// Within-page ordinal (0-based, contiguous over emitted crops).
    pub panel_index: usize,
    /// Clamped, repaired box before padding.
    pub bbox: BBox,
    /// The rectangle actually cut from the page.
    pub bbox_padded: PixelRect,
    pub confidence: f32,
    pub class_id: u32,
    pub image_path: PathBuf,
    pub width_px: u32,
    pub height_px: u32,
    pub source_page_image_path: PathBuf,
}

/// Persisted record of the crop stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CropManifest {
    pub cache_key: String,
    pub steps_dir: PathBuf,
    pub step_count: usize,
    /// Parameter echo: lets a reader check the crops match its settings.
    pub padding_px: u32,
    pub min_box_size_px: u32,
    pub format: RasterFormat,
    /// Ordered by `global_step_index`.
    pub steps: Vec<StepCrop>,
    /// Pages with detections whose image could not be decoded.
    #[serde(default)]
    pub unreadable_pages: Vec<usize>,
}

impl StageManifest for CropManifest {
    const STAGE: Stage = Stage::Crop;
    const SCHEMA_VERSION: u32 = 2;

    fn cache_key(&self) -> &str {
        &self.cache_key
    }

    fn artifact_paths(&self) -> Vec<PathBuf> {
        self.steps.iter().map(|s| s.image_path.clone()).collect()
    }
}

impl CropManifest {
    /// Whether this manifest was produced with the given crop settings.
    pub fn matches(&self, padding_px: u32, min_box_size_px: u32) -> bool {
        self.padding_px == padding_px && self.min_box_size_px == min_box_size_px
    }

    /// Why a resolved manifest must be rebuilt for these settings, if at all.
    fn stale_reason(&self, padding_px: u32, min_box_size_px: u32) -> Option<String> {
        if !self.matches(padding_px, min_box_size_px) {
            return Some(format!(
                "cropped with padding {} / min size {}, requested {} / {}",
                self.padding_px, self.min_box_size_px, padding_px, min_box_size_px
            ));
        }
        (!self.unreadable_pages.is_empty())
            .then(|| format!("page images {:?} were unreadable", self.unreadable_pages))
    }
}

/// Step identifier for a panel.
pub fn step_id(prefix: &str, page_index: usize, panel_index: usize) -> String {
    format!("{}_p{:03}_s{:02}", prefix, page_index, panel_index)
}

/// Crop every accepted detection, or resolve a cached crop run.
///
/// Crops live under the detection key. A cached manifest whose echoed
/// padding or threshold differs from `config`, or that skipped unreadable
/// pages, is stale and is rebuilt.
pub async fn crop_steps(
    render: &RenderManifest,
    detections: &DetectionManifest,
    detect_key: &CacheKey,
    config: &PipelineConfig,
) -> Result<Cached<CropManifest>, Manual2StepsError> {
    let cache = ContentAddressedCache::for_stage(&config.artifact_root, Stage::Crop)?;
    let key = detect_key;
    let padding = config.padding_px;
    let min_size = config.min_box_size_px;
    let format = config.format;
    let concurrency = config.concurrency;
    let prefix = key.short_prefix().to_string();
    let cache_key = key.as_dir_name();

    let work: Vec<(PageRecord, Vec<Detection>)> = render
        .pages
        .iter()
        .filter(|p| p.is_rendered())
        .filter_map(|p| {
            let dets = detections.detections_for(p.page_index);
            (!dets.is_empty()).then(|| (p.clone(), dets.to_vec()))
        })
        .collect();

    cache
        .get_or_build_with(
            key,
            config.cache_policy,
            |m: &CropManifest| m.stale_reason(padding, min_size),
            move |dir| async move {
                let steps_dir = std::path::absolute(&dir)
                    .map_err(|e| Manual2StepsError::cache_io(&dir, e))?;

                let per_page: Vec<Result<(usize, Option<Vec<StepCrop>>), Manual2StepsError>> =
                    stream::iter(work)
                        .map(|(page, dets)| {
                            let dir = steps_dir.clone();
                            let prefix = prefix.clone();
                            async move {
                                tokio::task::spawn_blocking(move || {
                                    let params = CropParams { padding, min_size, format };
                                    crop_page(&page, &dets, &dir, &prefix, params)
                                        .map(|steps| (page.page_index, steps))
                                })
                                .await
                                .map_err(|e| {
                                    Manual2StepsError::Internal(format!("Crop task panicked: {}", e))
                                })?
                            }
                        })
                        .buffered(concurrency.max(1))
                        .collect()
                        .await;

                let mut steps = Vec::new();
                let mut unreadable_pages = Vec::new();
                for page in per_page {
                    match page? {
                        (_, Some(page_steps)) => steps.extend(page_steps),
                        (page_index, None) => unreadable_pages.push(page_index),
                    }
                }
                assign_global_indices(&mut steps, &cache_key)?;

                info!(
                    "Cropped {} steps ({} unreadable pages)",
                    steps.len(),
                    unreadable_pages.len()
                );
                Ok(CropManifest {
                    cache_key,
                    steps_dir,
                    step_count: steps.len(),
                    padding_px: padding,
                    min_box_size_px: min_size,
                    format,
                    steps,
                    unreadable_pages,
                })
            },
        )
        .await
}

#[derive(Clone, Copy)]
struct CropParams {
    padding: u32,
    min_size: u32,
    format: RasterFormat,
}

/// Number steps in page order and reject duplicate identifiers.
fn assign_global_indices(steps: &mut [StepCrop], cache_key: &str) -> Result<(), Manual2StepsError> {
    let mut seen = HashSet::with_capacity(steps.len());
    for (i, step) in steps.iter_mut().enumerate() {
        if !seen.insert(step.step_id.clone()) {
            return Err(Manual2StepsError::CacheCollision {
                key: cache_key.to_string(),
                detail: format!("duplicate step id '{}'", step.step_id),
            });
        }
        step.global_step_index = i;
    }
    Ok(())
}

/// Crop one page. Blocking.
///
/// `Ok(None)` when the page image cannot be decoded.
fn crop_page(
    page: &PageRecord,
    detections: &[Detection],
    dir: &Path,
    prefix: &str,
    params: CropParams,
) -> Result<Option<Vec<StepCrop>>, Manual2StepsError> {
    let Some(source) = page.image_path.as_ref() else {
        return Ok(Some(Vec::new()));
    };
    let image = match image::open(source) {
        Ok(img) => img,
        Err(e) => {
            warn!("Page {} image unreadable, skipping: {}", page.page_index, e);
            return Ok(None);
        }
    };
    let (w, h) = (image.width(), image.height());

    let mut boxes: Vec<(BBox, &Detection)> = detections
        .iter()
        .filter_map(|d| {
            let b = d.bbox.normalized(w, h)?;
            if b.meets_min_size(params.min_size) {
                Some((b, d))
            } else {
                debug!(
                    "Page {}: dropping {:.0}x{:.0} box below {}px",
                    page.page_index,
                    b.width(),
                    b.height(),
                    params.min_size
                );
                None
            }
        })
        .collect();
    boxes.sort_by(|a, b| a.0.reading_order(&b.0));

    let mut out = Vec::with_capacity(boxes.len());
    for (bbox, det) in boxes {
        let Some(rect) = bbox.padded(params.padding, w, h) else {
            debug!("Page {}: padded box collapsed, skipping", page.page_index);
            continue;
        };
        let panel_index = out.len();
        let id = step_id(prefix, page.page_index, panel_index);
        let path = dir.join(format!("step_{}.{}", id, params.format.extension()));

        let crop = image.crop_imm(rect.x1, rect.y1, rect.width(), rect.height());
        crop.save_with_format(&path, params.format.image_format())
            .map_err(|e| {
                Manual2StepsError::cache_io(&path, std::io::Error::other(e.to_string()))
            })?;

        out.push(StepCrop {
            step_id: id,
            global_step_index: 0,
            page_index: page.page_index,
            panel_index,
            bbox,
            bbox_padded: rect,
            confidence: det.confidence,
            class_id: det.class_id,
            image_path: path,
            width_px: rect.width(),
            height_px: rect.height(),
            source_page_image_path: source.clone(),
        });
    }
    debug!("Page {}: {} steps", page.page_index, out.len());
    Ok(Some(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CachePolicy;
    use image::{DynamicImage, Rgba, RgbaImage};
    use std::collections::BTreeMap;

    fn write_page(dir: &Path, idx: usize, w: u32, h: u32) -> PathBuf {
        let path = dir.join(format!("page_{idx:03}.png"));
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(w, h, Rgba([200, 200, 200, 255])))
            .save(&path)
            .unwrap();
        path
    }

    fn det(b: [f32; 4], confidence: f32) -> Detection {
        Detection {
            bbox: BBox::new(b[0], b[1], b[2], b[3]),
            confidence,
            class_id: 0,
        }
    }

    fn setup(
        pages: &[(u32, u32)],
        by_page: Vec<(usize, Vec<Detection>)>,
        dir: &Path,
    ) -> (RenderManifest, DetectionManifest) {
        let records = pages
            .iter()
            .enumerate()
            .map(|(i, (w, h))| PageRecord {
                page_index: i,
                image_path: Some(write_page(dir, i, *w, *h)),
                width_px: *w,
                height_px: *h,
                dpi: 72,
                error: None,
            })
            .collect();
        let render = RenderManifest {
            cache_key: "r".into(),
            pdf_hash: "abcdef0123".into(),
            renderer_version: "t".into(),
            dpi: 72,
            format: RasterFormat::Png,
            page_count: pages.len(),
            pages: records,
        };
        let by_page: BTreeMap<_, _> = by_page.into_iter().collect();
        let detection_count = by_page.values().map(Vec::len).sum();
        let detections = DetectionManifest {
            cache_key: "d".into(),
            detector: "fake".into(),
            by_page,
            detection_count,
            discarded_count: 0,
            failed_pages: vec![],
        };
        (render, detections)
    }

    fn config(root: &Path) -> PipelineConfig {
        PipelineConfig::builder().artifact_root(root).build().unwrap()
    }

    fn key() -> CacheKey {
        CacheKey::new("abcdef0123").with_param("detector", "fake")
    }

    #[tokio::test]
    async fn single_detection_on_first_of_two_pages() {
        let tmp = tempfile::tempdir().unwrap();
        let (render, dets) = setup(
            &[(850, 1100), (850, 1100)],
            vec![(0, vec![det([10.0, 10.0, 100.0, 100.0], 0.9)]), (1, vec![])],
            tmp.path(),
        );
        let m = crop_steps(&render, &dets, &key(), &config(tmp.path()))
            .await
            .unwrap()
            .manifest;

        assert_eq!(m.step_count, 1);
        let s = &m.steps[0];
        assert_eq!(s.global_step_index, 0);
        assert_eq!(s.page_index, 0);
        assert_eq!(s.step_id, "abcdef_p000_s00");
        assert_eq!(s.bbox_padded, PixelRect { x1: 0, y1: 0, x2: 116, y2: 116 });
        assert!(s.image_path.exists());
        assert!(s.image_path.is_absolute());
        let saved = image::open(&s.image_path).unwrap();
        assert_eq!((saved.width(), saved.height()), (116, 116));
    }

    #[tokio::test]
    async fn narrow_box_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let (render, dets) = setup(
            &[(1000, 1000)],
            vec![(0, vec![det([5.0, 5.0, 3.0, 300.0], 0.8)])],
            tmp.path(),
        );
        let m = crop_steps(&render, &dets, &key(), &config(tmp.path()))
            .await
            .unwrap()
            .manifest;
        assert_eq!(m.step_count, 0);
    }

    #[tokio::test]
    async fn reading_order_and_global_ordinals() {
        let tmp = tempfile::tempdir().unwrap();
        let (render, dets) = setup(
            &[(400, 400), (400, 400), (400, 400)],
            vec![
                (
                    0,
                    vec![
                        det([200.0, 200.0, 300.0, 300.0], 0.7),
                        det([220.0, 20.0, 380.0, 120.0], 0.8),
                        det([20.0, 20.0, 180.0, 120.0], 0.9),
                    ],
                ),
                (2, vec![det([50.0, 50.0, 150.0, 150.0], 0.6)]),
            ],
            tmp.path(),
        );
        let m = crop_steps(&render, &dets, &key(), &config(tmp.path()))
            .await
            .unwrap()
            .manifest;

        let ids: Vec<_> = m.steps.iter().map(|s| s.step_id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["abcdef_p000_s00", "abcdef_p000_s01", "abcdef_p000_s02", "abcdef_p002_s00"]
        );
        assert_eq!(m.steps[0].confidence, 0.9);
        assert_eq!(m.steps[1].confidence, 0.8);
        assert_eq!(m.steps[2].confidence, 0.7);
        let globals: Vec<_> = m.steps.iter().map(|s| s.global_step_index).collect();
        assert_eq!(globals, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn crops_stay_inside_page_and_contain_box() {
        let tmp = tempfile::tempdir().unwrap();
        let (w, h) = (300u32, 200u32);
        let (render, dets) = setup(
            &[(w, h)],
            vec![(
                0,
                vec![
                    det([-40.0, -40.0, 60.0, 60.0], 0.5),
                    det([250.0, 150.0, 900.0, 900.0], 0.5),
                    det([120.5, 80.25, 180.75, 130.5], 0.5),
                ],
            )],
            tmp.path(),
        );
        let m = crop_steps(&render, &dets, &key(), &config(tmp.path()))
            .await
            .unwrap()
            .manifest;
        assert_eq!(m.step_count, 3);
        for s in &m.steps {
            let r = s.bbox_padded;
            assert!(r.x1 < r.x2 && r.x2 <= w, "{r:?}");
            assert!(r.y1 < r.y2 && r.y2 <= h, "{r:?}");
            assert!(r.x1 as f32 <= s.bbox.x1 && r.x2 as f32 >= s.bbox.x2);
            assert!(r.y1 as f32 <= s.bbox.y1 && r.y2 as f32 >= s.bbox.y2);
        }
    }

    #[tokio::test]
    async fn rerun_is_identical_and_cached() {
        let tmp = tempfile::tempdir().unwrap();
        let (render, dets) = setup(
            &[(400, 400)],
            vec![(0, vec![det([20.0, 20.0, 180.0, 120.0], 0.9), det([20.0, 200.0, 180.0, 300.0], 0.9)])],
            tmp.path(),
        );
        let cfg = config(tmp.path());
        let first = crop_steps(&render, &dets, &key(), &cfg).await.unwrap();
        let second = crop_steps(&render, &dets, &key(), &cfg).await.unwrap();
        assert!(second.from_cache);
        assert_eq!(first.manifest, second.manifest);

        let mut refresh = cfg.clone();
        refresh.cache_policy = CachePolicy::Refresh;
        let third = crop_steps(&render, &dets, &key(), &refresh).await.unwrap();
        assert!(!third.from_cache);
        assert_eq!(
            first.manifest.steps.iter().map(|s| &s.step_id).collect::<Vec<_>>(),
            third.manifest.steps.iter().map(|s| &s.step_id).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn changed_padding_rebuilds() {
        let tmp = tempfile::tempdir().unwrap();
        let (render, dets) = setup(
            &[(400, 400)],
            vec![(0, vec![det([100.0, 100.0, 200.0, 200.0], 0.9)])],
            tmp.path(),
        );
        let cfg = config(tmp.path());
        crop_steps(&render, &dets, &key(), &cfg).await.unwrap();

        let mut wider = cfg.clone();
        wider.padding_px = 40;
        let out = crop_steps(&render, &dets, &key(), &wider).await.unwrap();
        assert!(!out.from_cache);
        assert_eq!(out.manifest.padding_px, 40);
        assert_eq!(out.manifest.steps[0].width_px, 180);
    }

    #[tokio::test]
    async fn unreadable_page_is_recorded_and_retried() {
        let tmp = tempfile::tempdir().unwrap();
        let box_ = det([20.0, 20.0, 180.0, 120.0], 0.9);
        let (render, dets) = setup(
            &[(400, 400), (400, 400)],
            vec![(0, vec![box_.clone()]), (1, vec![box_])],
            tmp.path(),
        );
        let page_1 = render.pages[1].image_path.clone().unwrap();
        std::fs::write(&page_1, b"not a png").unwrap();
        let cfg = config(tmp.path());

        let first = crop_steps(&render, &dets, &key(), &cfg).await.unwrap();
        assert_eq!(first.manifest.step_count, 1);
        assert_eq!(first.manifest.unreadable_pages, vec![1]);

        write_page(tmp.path(), 1, 400, 400);
        let second = crop_steps(&render, &dets, &key(), &cfg).await.unwrap();
        assert!(!second.from_cache);
        assert!(second.manifest.unreadable_pages.is_empty());
        let ids: Vec<_> = second.manifest.steps.iter().map(|s| s.step_id.as_str()).collect();
        assert_eq!(ids, vec!["abcdef_p000_s00", "abcdef_p001_s00"]);

        let third = crop_steps(&render, &dets, &key(), &cfg).await.unwrap();
        assert!(third.from_cache);
    }

    #[test]
    fn step_ids_are_zero_padded() {
        assert_eq!(step_id("a1b2c3", 4, 7), "a1b2c3_p004_s07");
    }

    #[test]
    fn duplicate_ids_are_collisions() {
        let s = StepCrop {
            step_id: "x_p000_s00".into(),
            global_step_index: 0,
            page_index: 0,
            panel_index: 0,
            bbox: BBox::new(0.0, 0.0, 10.0, 10.0),
            bbox_padded: PixelRect { x1: 0, y1: 0, x2: 10, y2: 10 },
            confidence: 1.0,
            class_id: 0,
            image_path: PathBuf::from("a.png"),
            width_px: 10,
            height_px: 10,
            source_page_image_path: PathBuf::from("p.png"),
        };
        let mut steps = vec![s.clone(), s];
        assert!(matches!(
            assign_global_indices(&mut steps, "k"),
            Err(Manual2StepsError::CacheCollision { .. })
        ));
    }
}
