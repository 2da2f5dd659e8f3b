//! # doc2comic
//!
//! Turn a PDF or a block of text into an illustrated comic book.
//!
//! A language model rewrites the source as a story and then as a
//! panel-by-panel script. An image-generation service draws every panel
//! concurrently. The panels are laid out on pages with speech balloons,
//! captions and sound effects, and the pages are exported as a PDF, a CBZ
//! archive, or a static web gallery.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF / text
//!  │
//!  ├─ 1. Intake   extract and normalise text (pdfium, spawn_blocking)
//!  ├─ 2. Content  translate → structure story → write panel script (LLM)
//!  ├─ 3. Visual   one illustration per panel, bounded fan-out, retries
//!  ├─ 4. Layout   grid placement, text overlays, page rendering
//!  └─ 5. Export   pdf / cbz / html gallery, each format isolated
//! ```
//!
//! A panel whose artwork cannot be produced becomes a placeholder and the
//! job still completes. A format that fails to export is reported while the
//! others are delivered.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use doc2comic::{generate, GenerationConfig, GenerationOptions, GenerationRequest, OutputFormat};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Text from OPENAI_API_KEY (or EDGEQUAKE_LLM_PROVIDER), images from MODELSLAB_API_KEY
//!     let config = GenerationConfig::default();
//!     let options = GenerationOptions {
//!         target_pages: 4,
//!         output_formats: [OutputFormat::Archive].into_iter().collect(),
//!         ..Default::default()
//!     };
//!     let result = generate(GenerationRequest::from_file("story.pdf", options), &config).await?;
//!     for book in &result.comic_books {
//!         println!("{}: {}", book.format, book.output_location.display());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! For long-running use, [`JobManager`] runs each request as a background
//! job with pollable status, cancellation and artifact download.
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `doc2comic` binary (clap + anyhow + indicatif + tracing-subscriber) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod jobs;
pub mod model;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod services;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{GenerationConfig, GenerationConfigBuilder, ImageSettings, LayoutConfig, OutputFormat};
pub use error::{ComicError, ExportError, PanelError, ServiceError};
pub use jobs::{Artifact, DownloadError, InMemoryJobStore, Job, JobManager, JobStatus, JobStore, Stage};
pub use model::{
    Character, ComicBook, ComicScript, DialogueLine, ExportResult, GenerationOptions, GenerationRequest, GenerationResult,
    PageLayout, Panel, PanelArtwork, PanelRect, ProcessedDocument, Source, StoryStructure, TextElement, TextKind,
    TranslatedContent,
};
pub use orchestrator::{generate, run_once, Pipeline};
pub use progress::{GenerationObserver, NoopObserver};
