//! End-to-end generation: intake → content → visual → layout → export.
//!
//! [`Pipeline`] owns the long-lived pieces (services, the shared image
//! pool, the layout engine with its font, the export registry) so that many
//! jobs can run against one instance. [`generate`] is the one-shot entry
//! point for callers that do not need a [`crate::JobManager`].

use crate::config::{GenerationConfig, OutputFormat};
use crate::error::ComicError;
use crate::jobs::{InMemoryJobStore, Job, JobStore, JobTracker, Stage};
use crate::model::{ComicBook, GenerationRequest, GenerationResult};
use crate::pipeline::content::ContentStage;
use crate::pipeline::export::{ExportMeta, ExportStage, Exporter};
use crate::pipeline::intake;
use crate::pipeline::layout::{load_font, LayoutEngine, LayoutPolicy};
use crate::pipeline::visual::{SharedContext, VisualStage};
use crate::progress::{noop, Observer};
use crate::services::{ImageService, LlmTextService, ModelsLabImageService, TextService};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// A configured generation pipeline.
pub struct Pipeline {
    config: GenerationConfig,
    text: Arc<dyn TextService>,
    images: Arc<dyn ImageService>,
    /// Shared by every job run on this pipeline.
    pool: Arc<Semaphore>,
    layout: Arc<LayoutEngine>,
    exports: ExportStage,
    observer: Observer,
}

impl Pipeline {
    pub fn new(config: GenerationConfig, text: Arc<dyn TextService>, images: Arc<dyn ImageService>) -> Self {
        let font = load_font(config.font_path.as_deref());
        let layout = Arc::new(LayoutEngine::new(config.layout.clone(), font));
        let pool = Arc::new(Semaphore::new(config.max_parallel_panels.max(1)));
        let exports = ExportStage::from_config(&config);
        Self {
            config,
            text,
            images,
            pool,
            layout,
            exports,
            observer: noop(),
        }
    }

    /// Build the production services from configuration and environment.
    pub fn from_config(config: GenerationConfig) -> Result<Self, ComicError> {
        let text = Arc::new(LlmTextService::from_config(&config)?);
        let images = Arc::new(ModelsLabImageService::from_config(&config)?);
        Ok(Self::new(config, text, images))
    }

    pub fn with_observer(mut self, observer: Observer) -> Self {
        self.observer = observer;
        self
    }

    /// Register (or replace) the converter for one output format.
    pub fn with_exporter(mut self, exporter: Arc<dyn Exporter>) -> Self {
        self.exports = self.exports.with_exporter(exporter);
        self
    }

    pub fn with_layout_policy(mut self, policy: Box<dyn LayoutPolicy>) -> Self {
        let font = load_font(self.config.font_path.as_deref());
        self.layout = Arc::new(LayoutEngine::new(self.config.layout.clone(), font).with_policy(policy));
        self
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    /// The observer given to jobs started through [`run_once`].
    pub fn observer(&self) -> &Observer {
        &self.observer
    }

    /// Run one job to its result. The tracker receives every stage
    /// transition and carries the observer for the run; the caller decides
    /// how to record the final outcome.
    pub async fn run(&self, request: &GenerationRequest, tracker: &JobTracker) -> Result<GenerationResult, ComicError> {
        let started = Instant::now();
        let job_id = tracker.job_id().to_string();
        let observer = tracker.observer();
        let options = &request.options;
        options.validate()?;
        tracker.start();

        let job_dir = self.config.job_dir(&job_id);
        info!("Job {}: starting generation into {}", job_id, job_dir.display());
        let mut warnings = Vec::new();

        // ── Stage 1: Intake ──────────────────────────────────────────────
        self.checkpoint(tracker, Stage::Intake)?;
        let doc = intake::process(&request.source, options).await?;
        debug!("Job {}: {} words of source", job_id, doc.word_count);
        tracker.finish(Stage::Intake);

        // ── Stage 2: Content ─────────────────────────────────────────────
        self.checkpoint(tracker, Stage::Content)?;
        let content = ContentStage::new(Arc::clone(&self.text), &self.config)
            .run(&doc, options)
            .await?;
        let script = content.script;
        tracker.warn(&content.warnings);
        warnings.extend(content.warnings);
        observer.on_script_ready(&job_id, script.panels.len(), script.pages().len());
        tracker.finish(Stage::Content);

        // ── Stage 3: Visual ──────────────────────────────────────────────
        self.checkpoint(tracker, Stage::Visual)?;
        let ctx = SharedContext::new(&script, Some(&content.story), options);
        let artworks = VisualStage::new(Arc::clone(&self.images), Arc::clone(&self.pool), &self.config)
            .generate_all(&job_id, &script.panels, &ctx, &job_dir.join("panels"), observer)
            .await?;
        let degraded_panels: Vec<u32> = artworks
            .iter()
            .filter(|a| a.is_degraded())
            .map(|a| a.panel_number)
            .collect();
        if !degraded_panels.is_empty() {
            let w = format!(
                "{} of {} panel(s) rendered as placeholders: {:?}",
                degraded_panels.len(),
                artworks.len(),
                degraded_panels
            );
            tracker.warn(std::slice::from_ref(&w));
            warnings.push(w);
        }
        tracker.finish(Stage::Visual);

        // ── Stage 4: Layout + export ─────────────────────────────────────
        self.checkpoint(tracker, Stage::LayoutExport)?;
        let pages = self
            .layout
            .compose_all(&job_id, &script, &artworks, &job_dir.join("pages"), observer)
            .await?;
        let page_files: Vec<_> = pages.iter().map(|p| p.rendered_page.clone()).collect();

        let meta = ExportMeta::new(script.title.clone(), self.config.author.clone());
        let results = self
            .exports
            .run(&job_id, &page_files, &meta, &options.output_formats, &job_dir, observer)
            .await;

        let mut comic_books = Vec::new();
        let mut export_failures: Vec<(OutputFormat, String)> = Vec::new();
        for (format, result) in results {
            match result {
                Ok(r) => comic_books.push(ComicBook {
                    title: script.title.clone(),
                    author: self.config.author.clone(),
                    pages: page_files.clone(),
                    total_pages: r.page_count,
                    format,
                    file_size: r.byte_size,
                    output_location: r.output_location,
                }),
                Err(e) => export_failures.push((format, e.to_string())),
            }
        }
        if comic_books.is_empty() {
            return Err(ComicError::AllExportsFailed {
                failures: export_failures,
            });
        }
        for (format, reason) in &export_failures {
            let w = format!("{format} export failed: {reason}");
            warn!("Job {}: {}", job_id, w);
            warnings.push(w);
        }

        let actual_pages = pages.len() as u32;
        let duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "Job {}: '{}' done in {}ms ({} page(s), {} format(s))",
            job_id,
            script.title,
            duration_ms,
            actual_pages,
            comic_books.len()
        );

        Ok(GenerationResult {
            job_id,
            title: script.title.clone(),
            comic_books,
            export_failures,
            pages,
            requested_pages: options.target_pages,
            actual_pages,
            degraded_panels,
            warnings,
            duration_ms,
            script,
        })
    }

    /// Stop before `stage` if the job was cancelled or otherwise finished
    /// elsewhere, then announce the stage.
    fn checkpoint(&self, tracker: &JobTracker, stage: Stage) -> Result<(), ComicError> {
        if tracker.is_terminal() {
            return Err(ComicError::Cancelled);
        }
        tracker.enter(stage);
        Ok(())
    }
}

/// Generate a comic without a job manager.
///
/// Builds the production services from `config`, runs one job, and
/// returns its result.
pub async fn generate(request: GenerationRequest, config: &GenerationConfig) -> Result<GenerationResult, ComicError> {
    let pipeline = Pipeline::from_config(config.clone())?;
    run_once(&pipeline, &request).await
}

/// Run one job on `pipeline` with a private job record.
pub async fn run_once(pipeline: &Pipeline, request: &GenerationRequest) -> Result<GenerationResult, ComicError> {
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let job_id = uuid::Uuid::new_v4().to_string();
    store.put(Job::queued(&job_id));
    let tracker = JobTracker::new(&job_id, store, pipeline.observer().clone());
    let outcome = pipeline.run(request, &tracker).await;
    match &outcome {
        Ok(result) => tracker.complete(result.clone()),
        Err(e) => {
            tracker.fail(e);
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::GenerationOptions;
    use crate::services::mock::{MockImageService, MockTextService};
    use std::collections::BTreeSet;

    fn config(dir: &std::path::Path) -> GenerationConfig {
        GenerationConfig::builder()
            .output_dir(dir.join("out"))
            .temp_dir(dir.join("tmp"))
            .retry_backoff_ms(1)
            .poll_backoff_ms(1)
            .build()
            .unwrap()
    }

    fn options(pages: u32, formats: &[OutputFormat]) -> GenerationOptions {
        GenerationOptions {
            target_pages: pages,
            output_formats: formats.iter().copied().collect::<BTreeSet<_>>(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn run_once_produces_requested_archive() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(
            config(dir.path()),
            Arc::new(MockTextService::comic("Tin Garden", 2, 3)),
            Arc::new(MockImageService::new()),
        );
        let request = GenerationRequest::from_text("A robot tends a garden.", options(2, &[OutputFormat::Archive]));
        let result = run_once(&pipeline, &request).await.unwrap();

        assert_eq!(result.title, "Tin Garden");
        assert_eq!(result.actual_pages, 2);
        assert_eq!(result.comic_books.len(), 1);
        let book = result.book(OutputFormat::Archive).unwrap();
        assert!(book.output_location.exists());
        assert!(result.degraded_panels.is_empty());
        assert!(result.export_failures.is_empty());
    }

    #[tokio::test]
    async fn invalid_options_fail_before_any_service_call() {
        let dir = tempfile::tempdir().unwrap();
        let text = Arc::new(MockTextService::comic("T", 1, 1));
        let pipeline = Pipeline::new(config(dir.path()), text.clone(), Arc::new(MockImageService::new()));
        let request = GenerationRequest::from_text("story", options(1, &[]));
        let err = run_once(&pipeline, &request).await.unwrap_err();
        assert!(matches!(err, ComicError::InvalidRequest(_)));
        assert!(text.calls().is_empty());
    }
}
