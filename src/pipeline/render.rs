//! DocumentRenderer: rasterise every page of a PDF into the artifact cache.
//!
//! ## Why spawn_blocking?
//!
//! The `pdfium-render` crate wraps the pdfium C++ library, which uses
//! thread-local state internally and is not safe to call from async contexts.
//! Rasterisation and PNG encoding both run on the blocking pool so Tokio
//! worker threads never stall on CPU-heavy work.
//!
//! A page that fails to rasterise (or to save) keeps its index in the
//! manifest with an `error` and no `image_path`; downstream stages skip it.

use crate::cache::{CacheKey, Cached, ContentAddressedCache, StageManifest};
use crate::config::{PipelineConfig, RasterFormat};
use crate::error::{Manual2StepsError, Stage};
use crate::output::CoverPage;
use crate::pipeline::input::SourceDocument;
use image::DynamicImage;
use pdfium_render::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Page → image conversion.
///
/// Called from a blocking thread. The outer `Result` fails the whole document
/// (cannot open, wrong password); the inner one marks a single page.
pub trait Rasterizer: Send + Sync {
    fn rasterize(
        &self,
        pdf: &[u8],
        dpi: u32,
        password: Option<&str>,
        origin: &str,
    ) -> Result<Vec<Result<DynamicImage, String>>, Manual2StepsError>;
}

/// [`Rasterizer`] backed by pdfium, downloaded on first use by `pdfium-auto`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PdfiumRasterizer;

impl Rasterizer for PdfiumRasterizer {
    fn rasterize(
        &self,
        pdf: &[u8],
        dpi: u32,
        password: Option<&str>,
        origin: &str,
    ) -> Result<Vec<Result<DynamicImage, String>>, Manual2StepsError> {
        let pdfium = pdfium_auto::bind_pdfium_silent()
            .map_err(|e| Manual2StepsError::PdfiumBindingFailed(e.to_string()))?;

        let document = pdfium
            .load_pdf_from_byte_slice(pdf, password)
            .map_err(|e| {
                let err_str = format!("{:?}", e);
                if err_str.contains("Password") || err_str.contains("password") {
                    if password.is_some() {
                        Manual2StepsError::WrongPassword {
                            origin: origin.to_string(),
                        }
                    } else {
                        Manual2StepsError::PasswordRequired {
                            origin: origin.to_string(),
                        }
                    }
                } else {
                    Manual2StepsError::CorruptPdf {
                        origin: origin.to_string(),
                        detail: err_str,
                    }
                }
            })?;

        let pages = document.pages();
        info!("PDF loaded: {} pages", pages.len());

        // pdfium's native unit is the PDF point (1/72 inch).
        let render_config = PdfRenderConfig::new().scale_page_by_factor(dpi as f32 / 72.0);

        let mut results = Vec::with_capacity(pages.len() as usize);
        for (idx, page) in pages.iter().enumerate() {
            match page.render_with_config(&render_config) {
                Ok(bitmap) => {
                    let image = bitmap.as_image();
                    debug!("Rendered page {} → {}x{} px", idx, image.width(), image.height());
                    results.push(Ok(image));
                }
                Err(e) => results.push(Err(format!("{:?}", e))),
            }
        }
        Ok(results)
    }
}

/// One page of the rendered document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRecord {
    /// 0-based, contiguous even across failed pages.
    pub page_index: usize,
    /// Absolute path of the page image; `None` when the page failed.
    pub image_path: Option<PathBuf>,
    pub width_px: u32,
    pub height_px: u32,
    pub dpi: u32,
    pub error: Option<String>,
}

impl PageRecord {
    pub fn is_rendered(&self) -> bool {
        self.image_path.is_some()
    }
}

/// Persisted record of the render stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderManifest {
    pub cache_key: String,
    pub pdf_hash: String,
    pub renderer_version: String,
    pub dpi: u32,
    pub format: RasterFormat,
    pub page_count: usize,
    pub pages: Vec<PageRecord>,
}

impl StageManifest for RenderManifest {
    const STAGE: Stage = Stage::Render;
    const SCHEMA_VERSION: u32 = 1;

    fn cache_key(&self) -> &str {
        &self.cache_key
    }

    fn artifact_paths(&self) -> Vec<PathBuf> {
        self.pages
            .iter()
            .filter_map(|p| p.image_path.clone())
            .collect()
    }
}

impl RenderManifest {
    /// The first successfully rendered page.
    pub fn cover(&self) -> Option<CoverPage> {
        self.pages.iter().find_map(|p| {
            p.image_path.as_ref().map(|path| CoverPage {
                page_index: p.page_index,
                image_path: path.clone(),
                width_px: p.width_px,
                height_px: p.height_px,
            })
        })
    }

    /// Pages that have an image, in index order.
    pub fn rendered_pages(&self) -> impl Iterator<Item = &PageRecord> {
        self.pages.iter().filter(|p| p.is_rendered())
    }

    pub fn failed_page_count(&self) -> usize {
        self.pages.iter().filter(|p| !p.is_rendered()).count()
    }
}

/// Cache key of the render stage: content hash, DPI, format and renderer tag.
pub fn render_cache_key(content_hash: &str, config: &PipelineConfig) -> CacheKey {
    CacheKey::new(content_hash)
        .with_param("dpi", config.dpi)
        .with_param("fmt", config.format)
        .with_param("renderer", &config.renderer_version)
}

/// File name of a rendered page image.
pub fn page_file_name(page_index: usize, format: RasterFormat) -> String {
    format!("page_{:03}.{}", page_index, format.extension())
}

/// Render `source` into the cache, or resolve an existing render.
pub async fn render_document(
    source: &SourceDocument,
    config: &PipelineConfig,
    rasterizer: Arc<dyn Rasterizer>,
) -> Result<Cached<RenderManifest>, Manual2StepsError> {
    let cache = ContentAddressedCache::for_stage(&config.artifact_root, Stage::Render)?;
    let key = render_cache_key(&source.content_hash, config);

    let cache_key = key.as_dir_name();
    let pdf = Arc::clone(&source.bytes);
    let origin = source.origin.clone();
    let pdf_hash = source.content_hash.clone();
    let dpi = config.dpi;
    let format = config.format;
    let password = config.password.clone();
    let renderer_version = config.renderer_version.clone();

    cache
        .get_or_build(&key, config.cache_policy, move |dir| async move {
            let pages = tokio::task::spawn_blocking(move || {
                let rendered = rasterizer.rasterize(&pdf, dpi, password.as_deref(), &origin)?;
                Ok::<_, Manual2StepsError>(save_pages(&dir, rendered, dpi, format))
            })
            .await
            .map_err(|e| Manual2StepsError::Internal(format!("Render task panicked: {}", e)))??;

            let failed = pages.iter().filter(|p| !p.is_rendered()).count();
            info!("Rendered {} pages ({} failed)", pages.len(), failed);

            Ok(RenderManifest {
                cache_key,
                pdf_hash,
                renderer_version,
                dpi,
                format,
                page_count: pages.len(),
                pages,
            })
        })
        .await
}

/// Save each rendered page; failures are recorded on the page, never raised.
fn save_pages(
    dir: &Path,
    rendered: Vec<Result<DynamicImage, String>>,
    dpi: u32,
    format: RasterFormat,
) -> Vec<PageRecord> {
    rendered
        .into_iter()
        .enumerate()
        .map(|(page_index, result)| {
            let failed = |error: String| PageRecord {
                page_index,
                image_path: None,
                width_px: 0,
                height_px: 0,
                dpi,
                error: Some(error),
            };
            let image = match result {
                Ok(img) => img,
                Err(e) => {
                    warn!("Page {} failed to render: {}", page_index, e);
                    return failed(e);
                }
            };
            let path = dir.join(page_file_name(page_index, format));
            let saved = image
                .save_with_format(&path, format.image_format())
                .map_err(|e| e.to_string())
                .and_then(|_| std::path::absolute(&path).map_err(|e| e.to_string()));
            match saved {
                Ok(abs) => PageRecord {
                    page_index,
                    image_path: Some(abs),
                    width_px: image.width(),
                    height_px: image.height(),
                    dpi,
                    error: None,
                },
                Err(e) => {
                    warn!("Page {} could not be saved: {}", page_index, e);
                    failed(format!("save failed: {e}"))
                }
            }
        })
        .collect()
}
