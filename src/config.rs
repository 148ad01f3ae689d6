//! Configuration types for manual-to-steps conversion.
//!
//! All pipeline behaviour is controlled through [`PipelineConfig`], built via
//! its [`PipelineConfigBuilder`]. Every parameter that changes the bytes a
//! stage writes (DPI, raster format, renderer version, crop padding and
//! threshold) lives here, so two runs with equal configs hit the same cache
//! entries and two runs with different configs never share one.

use crate::error::Manual2StepsError;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Default renderer version tag, part of the render cache key.
///
/// Bump it whenever rasterisation logic changes so that identical inputs
/// stop resolving to images produced by the old code.
pub const DEFAULT_RENDERER_VERSION: &str = "pdfium_v1";

/// Configuration for one pipeline run.
///
/// Built via [`PipelineConfig::builder()`] or [`PipelineConfig::default()`].
///
/// # Example
/// ```rust
/// use manual2steps::{CachePolicy, PipelineConfig};
///
/// let config = PipelineConfig::builder()
///     .artifact_root("./artifacts")
///     .dpi(200)
///     .padding_px(16)
///     .cache_policy(CachePolicy::UseCache)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Root directory of the artifact cache. Default: `./artifacts`.
    pub artifact_root: PathBuf,

    /// Reuse cached stage output or rebuild it. Default: [`CachePolicy::UseCache`].
    pub cache_policy: CachePolicy,

    /// Rendering DPI used when rasterising each page. Range: 72–400. Default: 200.
    ///
    /// Assembly diagrams carry small part numbers and screw callouts; 200 DPI
    /// keeps them legible for both the detector and the vision model.
    pub dpi: u32,

    /// Raster format for page images and crops. Only PNG is supported.
    pub format: RasterFormat,

    /// Renderer version tag mixed into the render cache key.
    pub renderer_version: String,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Padding added around each detected step region before cropping. Default: 16.
    pub padding_px: u32,

    /// Boxes with an edge shorter than this are discarded. Default: 10.
    pub min_box_size_px: u32,

    /// Within-stage parallelism (detector calls, page crops, step negotiations). Default: 4.
    pub concurrency: usize,

    /// Pass the previous step's final text to the proposer as context. Default: false.
    ///
    /// Forces steps to be negotiated one at a time, in reading order.
    pub carry_prior_context: bool,

    /// Have the critic's model review every first draft before negotiation
    /// starts. Default: false.
    pub reflect_drafts: bool,

    /// LLM provider name (e.g. "openai", "ollama"). If None, auto-detected.
    pub provider_name: Option<String>,

    /// Vision model used by the proposer role.
    pub proposer_model: Option<String>,

    /// Text model used by the critic role.
    pub critic_model: Option<String>,

    /// Proposer sampling temperature. Default: 0.2.
    pub temperature: f32,

    /// Critic sampling temperature. Default: 0.5.
    pub critic_temperature: f32,

    /// Maximum tokens per role response. Default: 1024.
    pub max_tokens: usize,

    /// Retries per role call on transient failure. Default: 2.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds (exponential backoff). Default: 500.
    pub retry_backoff_ms: u64,

    /// Per-attempt LLM timeout in seconds. Default: 60.
    pub api_timeout_secs: u64,

    /// Outer bound the negotiation loop places on each role call. Default: 300.
    ///
    /// A call exceeding it ends the step's negotiation as exhausted.
    pub step_call_timeout_secs: u64,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Optional progress observer.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            artifact_root: PathBuf::from("./artifacts"),
            cache_policy: CachePolicy::default(),
            dpi: 200,
            format: RasterFormat::default(),
            renderer_version: DEFAULT_RENDERER_VERSION.to_string(),
            password: None,
            padding_px: 16,
            min_box_size_px: 10,
            concurrency: 4,
            carry_prior_context: false,
            reflect_drafts: false,
            provider_name: None,
            proposer_model: None,
            critic_model: None,
            temperature: 0.2,
            critic_temperature: 0.5,
            max_tokens: 1024,
            max_retries: 2,
            retry_backoff_ms: 500,
            api_timeout_secs: 60,
            step_call_timeout_secs: 300,
            download_timeout_secs: 120,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("artifact_root", &self.artifact_root)
            .field("cache_policy", &self.cache_policy)
            .field("dpi", &self.dpi)
            .field("format", &self.format)
            .field("renderer_version", &self.renderer_version)
            .field("padding_px", &self.padding_px)
            .field("min_box_size_px", &self.min_box_size_px)
            .field("concurrency", &self.concurrency)
            .field("carry_prior_context", &self.carry_prior_context)
            .field("reflect_drafts", &self.reflect_drafts)
            .field("provider_name", &self.provider_name)
            .field("proposer_model", &self.proposer_model)
            .field("critic_model", &self.critic_model)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn PipelineProgressCallback>"),
            )
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
            format_name: None,
        }
    }
}

/// Builder for [`PipelineConfig`].
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
    format_name: Option<String>,
}

impl PipelineConfigBuilder {
    pub fn artifact_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.artifact_root = root.into();
        self
    }

    pub fn cache_policy(mut self, policy: CachePolicy) -> Self {
        self.config.cache_policy = policy;
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 400);
        self
    }

    /// Requested raster format by name; validated in [`Self::build`].
    pub fn format(mut self, name: impl Into<String>) -> Self {
        self.format_name = Some(name.into());
        self
    }

    pub fn renderer_version(mut self, tag: impl Into<String>) -> Self {
        self.config.renderer_version = tag.into();
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn padding_px(mut self, px: u32) -> Self {
        self.config.padding_px = px;
        self
    }

    pub fn min_box_size_px(mut self, px: u32) -> Self {
        self.config.min_box_size_px = px;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn carry_prior_context(mut self, v: bool) -> Self {
        self.config.carry_prior_context = v;
        self
    }

    pub fn reflect_drafts(mut self, v: bool) -> Self {
        self.config.reflect_drafts = v;
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn proposer_model(mut self, model: impl Into<String>) -> Self {
        self.config.proposer_model = Some(model.into());
        self
    }

    pub fn critic_model(mut self, model: impl Into<String>) -> Self {
        self.config.critic_model = Some(model.into());
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn critic_temperature(mut self, t: f32) -> Self {
        self.config.critic_temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn step_call_timeout_secs(mut self, secs: u64) -> Self {
        self.config.step_call_timeout_secs = secs;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(mut self) -> Result<PipelineConfig, Manual2StepsError> {
        if let Some(name) = self.format_name.take() {
            self.config.format = name.parse()?;
        }
        let c = &self.config;
        if c.dpi < 72 || c.dpi > 400 {
            return Err(Manual2StepsError::InvalidConfig(format!(
                "DPI must be 72–400, got {}",
                c.dpi
            )));
        }
        if c.concurrency == 0 {
            return Err(Manual2StepsError::InvalidConfig(
                "Concurrency must be ≥ 1".into(),
            ));
        }
        if c.renderer_version.trim().is_empty() {
            return Err(Manual2StepsError::InvalidConfig(
                "Renderer version tag must not be empty".into(),
            ));
        }
        if c.artifact_root.as_os_str().is_empty() {
            return Err(Manual2StepsError::InvalidConfig(
                "Artifact root must not be empty".into(),
            ));
        }
        if c.step_call_timeout_secs == 0 {
            return Err(Manual2StepsError::InvalidConfig(
                "Step call timeout must be ≥ 1 second".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// How a stage treats an existing cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    /// Resolve first; build only on a miss. (default)
    #[default]
    UseCache,
    /// Always delete the entry and rebuild it.
    Refresh,
}

/// Raster format of page images and step crops.
///
/// PNG is the only supported format: crops are cut from page images and
/// re-encoded, and lossy formats would compound artefacts on fine linework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RasterFormat {
    #[default]
    Png,
}

impl RasterFormat {
    /// File extension, also used in cache keys.
    pub fn extension(&self) -> &'static str {
        match self {
            RasterFormat::Png => "png",
        }
    }

    /// MIME type for vision requests.
    pub fn mime_type(&self) -> &'static str {
        match self {
            RasterFormat::Png => "image/png",
        }
    }

    /// The matching `image` crate encoder format.
    pub fn image_format(&self) -> image::ImageFormat {
        match self {
            RasterFormat::Png => image::ImageFormat::Png,
        }
    }
}

impl FromStr for RasterFormat {
    type Err = Manual2StepsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "png" => Ok(RasterFormat::Png),
            other => Err(Manual2StepsError::UnsupportedFormat {
                requested: other.to_string(),
                supported: "png",
            }),
        }
    }
}

impl fmt::Display for RasterFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}
