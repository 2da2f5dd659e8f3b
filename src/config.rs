//! Configuration types for comic generation.
//!
//! Two layers of configuration exist:
//!
//! * [`GenerationConfig`]: process-wide knobs (services, retry policy, the
//!   shared image-generation pool size, storage locations, layout geometry).
//!   Built once via [`GenerationConfigBuilder`] and shared by every job.
//! * [`crate::model::GenerationOptions`]: per-request choices (art style,
//!   target pages, audience, output formats) threaded unchanged through every
//!   stage of one job.

use crate::error::ComicError;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// Process-wide configuration for the generation pipeline.
///
/// # Example
/// ```rust
/// use doc2comic::GenerationConfig;
///
/// let config = GenerationConfig::builder()
///     .max_parallel_panels(4)
///     .output_dir("outputs")
///     .build()
///     .unwrap();
/// assert_eq!(config.max_parallel_panels, 4);
/// ```
#[derive(Clone)]
pub struct GenerationConfig {
    /// Maximum in-flight image-generation requests across ALL jobs. Default: 5.
    ///
    /// The pool is shared system-wide so several concurrent jobs cannot
    /// multiply the load on the upstream image service.
    pub max_parallel_panels: usize,

    /// Retry attempts for rate-limit / transport failures. Default: 3.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds, doubling per attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Bounded wait for any single external call, in seconds. Default: 120.
    pub api_timeout_secs: u64,

    /// How many times an asynchronous ("processing") image job is polled
    /// before the panel is treated as degraded. Default: 10.
    pub max_poll_attempts: u32,

    /// Initial polling delay in milliseconds, doubling per poll and capped at
    /// [`MAX_POLL_DELAY_MS`]. Default: 2000.
    pub poll_backoff_ms: u64,

    /// LLM model identifier for the content stage. If None, provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "openrouter").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature for content generation. Default: 0.8.
    pub temperature: f32,

    /// Maximum tokens per content sub-step. Default: 8000.
    pub max_tokens: usize,

    /// Image-generation parameters.
    pub image: ImageSettings,

    /// ModelsLab API key. Falls back to `MODELSLAB_API_KEY`.
    pub image_api_key: Option<String>,

    /// Root directory for per-job output (`<output_dir>/<job_id>/`).
    pub output_dir: PathBuf,

    /// Scratch directory for uploaded source files.
    pub temp_dir: PathBuf,

    /// Uploaded sources older than this are removed by
    /// [`crate::jobs::JobManager::cleanup_scratch`]. Default: 7.
    pub cleanup_after_days: u32,

    /// Author recorded in exported metadata. Default: "AI Generated".
    pub author: String,

    /// Page geometry for the layout engine.
    pub layout: LayoutConfig,

    /// TrueType font used for balloons and captions. If None, common system
    /// locations are probed once when the pipeline is built.
    pub font_path: Option<PathBuf>,

    /// Gallery export downsizes pages wider than this. Default: 1200.
    pub max_web_width: u32,

    /// Paged-document page size in PDF points. Default: US Letter.
    pub pdf_page_size: (f32, f32),
}

/// Upper bound for a single polling delay.
pub const MAX_POLL_DELAY_MS: u64 = 30_000;

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_parallel_panels: 5,
            max_retries: 3,
            retry_backoff_ms: 500,
            api_timeout_secs: 120,
            max_poll_attempts: 10,
            poll_backoff_ms: 2000,
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.8,
            max_tokens: 8000,
            image: ImageSettings::default(),
            image_api_key: None,
            output_dir: PathBuf::from("outputs"),
            temp_dir: PathBuf::from("outputs/temp"),
            cleanup_after_days: 7,
            author: "AI Generated".to_string(),
            layout: LayoutConfig::default(),
            font_path: None,
            max_web_width: 1200,
            pdf_page_size: (612.0, 792.0),
        }
    }
}

impl fmt::Debug for GenerationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationConfig")
            .field("max_parallel_panels", &self.max_parallel_panels)
            .field("max_retries", &self.max_retries)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("max_poll_attempts", &self.max_poll_attempts)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("image", &self.image)
            .field("image_api_key", &self.image_api_key.as_ref().map(|_| "<redacted>"))
            .field("output_dir", &self.output_dir)
            .field("temp_dir", &self.temp_dir)
            .field("layout", &self.layout)
            .finish()
    }
}

impl GenerationConfig {
    /// Create a new builder for `GenerationConfig`.
    pub fn builder() -> GenerationConfigBuilder {
        GenerationConfigBuilder {
            config: Self::default(),
        }
    }

    /// Directory holding everything generated for one job.
    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.output_dir.join(job_id)
    }
}

/// Builder for [`GenerationConfig`].
#[derive(Debug)]
pub struct GenerationConfigBuilder {
    config: GenerationConfig,
}

impl GenerationConfigBuilder {
    pub fn max_parallel_panels(mut self, n: usize) -> Self {
        self.config.max_parallel_panels = n.clamp(1, 20);
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

    pub fn max_poll_attempts(mut self, n: u32) -> Self {
        self.config.max_poll_attempts = n;
        self
    }

    pub fn poll_backoff_ms(mut self, ms: u64) -> Self {
        self.config.poll_backoff_ms = ms;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn image(mut self, settings: ImageSettings) -> Self {
        self.config.image = settings;
        self
    }

    pub fn image_api_key(mut self, key: impl Into<String>) -> Self {
        self.config.image_api_key = Some(key.into());
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    pub fn temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.temp_dir = dir.into();
        self
    }

    pub fn cleanup_after_days(mut self, days: u32) -> Self {
        self.config.cleanup_after_days = days.max(1);
        self
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.config.author = author.into();
        self
    }

    pub fn layout(mut self, layout: LayoutConfig) -> Self {
        self.config.layout = layout;
        self
    }

    pub fn font_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.font_path = Some(path.into());
        self
    }

    pub fn max_web_width(mut self, px: u32) -> Self {
        self.config.max_web_width = px;
        self
    }

    pub fn pdf_page_size(mut self, width_pt: f32, height_pt: f32) -> Self {
        self.config.pdf_page_size = (width_pt, height_pt);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<GenerationConfig, ComicError> {
        let c = &self.config;
        if c.max_parallel_panels == 0 {
            return Err(ComicError::InvalidConfig(
                "max_parallel_panels must be ≥ 1".into(),
            ));
        }
        if c.api_timeout_secs == 0 {
            return Err(ComicError::InvalidConfig(
                "api_timeout_secs must be ≥ 1".into(),
            ));
        }
        c.layout.validate()?;
        if c.max_web_width < 16 {
            return Err(ComicError::InvalidConfig(format!(
                "max_web_width must be ≥ 16, got {}",
                c.max_web_width
            )));
        }
        let (w, h) = c.pdf_page_size;
        if !(w > 0.0 && h > 0.0) {
            return Err(ComicError::InvalidConfig(format!(
                "pdf_page_size must be positive, got {w}×{h}"
            )));
        }
        Ok(self.config)
    }
}

// ── Image settings ───────────────────────────────────────────────────────

/// Parameters sent with every image-generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSettings {
    /// Model id on the image service. Default: "flux".
    pub model: String,
    pub width: u32,
    pub height: u32,
    pub samples: u32,
    pub steps: u32,
    pub guidance_scale: f32,
    pub negative_prompt: String,
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            model: "flux".to_string(),
            width: 1024,
            height: 1024,
            samples: 1,
            steps: 30,
            guidance_scale: 7.5,
            negative_prompt: "blurry, low quality, distorted, deformed, ugly".to_string(),
        }
    }
}

// ── Layout geometry ──────────────────────────────────────────────────────

/// Page geometry used by the layout engine, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutConfig {
    pub page_width: u32,
    pub page_height: u32,
    /// Blank border around the page interior.
    pub margin: u32,
    /// Space between neighbouring panels.
    pub gutter: u32,
    pub background: [u8; 3],
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            page_width: 1200,
            page_height: 1600,
            margin: 50,
            gutter: 20,
            background: [255, 255, 255],
        }
    }
}

impl LayoutConfig {
    /// The interior must fit two columns and at least one row.
    pub fn validate(&self) -> Result<(), ComicError> {
        let min_width = 2 * self.margin + self.gutter + 2;
        let min_height = 2 * self.margin + 1;
        if self.page_width < min_width || self.page_height < min_height {
            return Err(ComicError::InvalidConfig(format!(
                "page {}×{} too small for margin {} and gutter {}",
                self.page_width, self.page_height, self.margin, self.gutter
            )));
        }
        Ok(())
    }
}

// ── Output formats ───────────────────────────────────────────────────────

/// Output container identifiers.
///
/// The canonical identifiers are `paged-document`, `archive` and `gallery`;
/// the legacy names `pdf`, `cbz` and `web` are accepted when parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    /// A PDF with one comic page per document page.
    #[serde(alias = "pdf")]
    PagedDocument,
    /// A CBZ (ZIP) archive of numbered page images plus a manifest.
    #[serde(alias = "cbz")]
    Archive,
    /// A browsable HTML gallery with web-optimised JPEG pages.
    #[serde(alias = "web")]
    Gallery,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 3] = [
        OutputFormat::PagedDocument,
        OutputFormat::Archive,
        OutputFormat::Gallery,
    ];

    /// Canonical identifier.
    pub fn id(self) -> &'static str {
        match self {
            OutputFormat::PagedDocument => "paged-document",
            OutputFormat::Archive => "archive",
            OutputFormat::Gallery => "gallery",
        }
    }

    /// File extension of the downloadable artifact.
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::PagedDocument => "pdf",
            OutputFormat::Archive => "cbz",
            OutputFormat::Gallery => "html",
        }
    }

    /// Media type reported by downloads.
    pub fn media_type(self) -> &'static str {
        match self {
            OutputFormat::PagedDocument => "application/pdf",
            OutputFormat::Archive => "application/vnd.comicbook+zip",
            OutputFormat::Gallery => "text/html",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for OutputFormat {
    type Err = ComicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "paged-document" | "pdf" => Ok(OutputFormat::PagedDocument),
            "archive" | "cbz" => Ok(OutputFormat::Archive),
            "gallery" | "web" => Ok(OutputFormat::Gallery),
            other => Err(ComicError::InvalidRequest(format!(
                "unknown output format '{other}' (expected paged-document, archive or gallery)"
            ))),
        }
    }
}
