//! Integration tests for the full generation pipeline.
//!
//! Every external service is replaced by the scripted mocks in
//! `doc2comic::services::mock`, so these run offline and need no API keys
//! or pdfium library.

use doc2comic::pipeline::export::{ExportMeta, Exporter, MANIFEST_NAME};
use doc2comic::services::mock::{MockImageService, MockTextService};
use doc2comic::{
    DownloadError, ExportError, ExportResult, GenerationConfig, GenerationObserver, GenerationOptions,
    GenerationRequest, JobManager, JobStatus, OutputFormat, Pipeline, Stage,
};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ── Test helpers ─────────────────────────────────────────────────────────

fn config(root: &Path) -> GenerationConfig {
    GenerationConfig::builder()
        .output_dir(root.join("outputs"))
        .temp_dir(root.join("outputs/temp"))
        .retry_backoff_ms(1)
        .poll_backoff_ms(1)
        .max_retries(1)
        .build()
        .unwrap()
}

fn options(pages: u32, formats: &[OutputFormat]) -> GenerationOptions {
    GenerationOptions {
        target_pages: pages,
        output_formats: formats.iter().copied().collect(),
        ..Default::default()
    }
}

fn pipeline(root: &Path, text: MockTextService, images: MockImageService) -> Pipeline {
    Pipeline::new(config(root), Arc::new(text), Arc::new(images))
}

/// Records lifecycle events in arrival order.
#[derive(Default)]
struct Recorder {
    statuses: Mutex<Vec<JobStatus>>,
    stages: Mutex<Vec<Stage>>,
    progress: Mutex<Vec<f32>>,
    exports: Mutex<Vec<(OutputFormat, bool)>>,
}

impl GenerationObserver for Recorder {
    fn on_status_change(&self, _job_id: &str, status: JobStatus) {
        self.statuses.lock().unwrap().push(status);
    }

    fn on_stage_start(&self, _job_id: &str, stage: Stage) {
        self.stages.lock().unwrap().push(stage);
    }

    fn on_stage_complete(&self, _job_id: &str, _stage: Stage, progress: f32) {
        self.progress.lock().unwrap().push(progress);
    }

    fn on_export_result(&self, _job_id: &str, format: OutputFormat, result: Result<&ExportResult, &str>) {
        self.exports.lock().unwrap().push((format, result.is_ok()));
    }
}

struct BrokenExporter(OutputFormat);

impl Exporter for BrokenExporter {
    fn format(&self) -> OutputFormat {
        self.0
    }

    fn export(&self, _: &[PathBuf], _: &ExportMeta, _: &Path) -> Result<ExportResult, ExportError> {
        Err(ExportError::ConverterFailed("disk full".into()))
    }
}

fn read_zip_entry(path: &Path, name: &str) -> String {
    let file = std::fs::File::open(path).unwrap();
    let mut archive = zip::ZipArchive::new(file).unwrap();
    let mut entry = archive.by_name(name).unwrap();
    let mut out = String::new();
    entry.read_to_string(&mut out).unwrap();
    out
}

fn zip_names(path: &Path) -> Vec<String> {
    let file = std::fs::File::open(path).unwrap();
    let archive = zip::ZipArchive::new(file).unwrap();
    let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
    names.sort();
    names
}

// ── Scenarios ────────────────────────────────────────────────────────────

#[tokio::test]
async fn robot_story_becomes_one_page_archive() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Arc::new(Recorder::default());
    let manager = JobManager::new(
        pipeline(
            dir.path(),
            MockTextService::comic("The Robot and the Flower", 1, 4),
            MockImageService::new(),
        )
        .with_observer(recorder.clone()),
    );

    let request = GenerationRequest::from_text(
        "A small robot finds the last flower in a desert and learns to keep it alive.",
        options(1, &[OutputFormat::Archive]),
    );
    let job_id = manager.submit(request).unwrap();
    let job = manager.wait(&job_id).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed, "error: {:?}", job.error);
    assert!((job.progress - 1.0).abs() < f32::EPSILON);
    assert_eq!(
        *recorder.statuses.lock().unwrap(),
        vec![JobStatus::Queued, JobStatus::Processing, JobStatus::Completed]
    );
    assert_eq!(
        *recorder.stages.lock().unwrap(),
        vec![Stage::Intake, Stage::Content, Stage::Visual, Stage::LayoutExport]
    );
    let progress = recorder.progress.lock().unwrap().clone();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {progress:?}");

    let result = job.result.unwrap();
    assert_eq!(result.comic_books.len(), 1);
    assert_eq!(result.actual_pages, 1);
    assert_eq!(result.pages[0].panel_positions.len(), 4);

    let artifact = manager.download(&job_id, OutputFormat::Archive).unwrap();
    assert_eq!(artifact.media_type, OutputFormat::Archive.media_type());
    assert_eq!(artifact.file_name, "The_Robot_and_the_Flower.cbz");
    assert_eq!(artifact.path.file_name().unwrap().to_str(), Some(artifact.file_name.as_str()));
    let manifest = read_zip_entry(&artifact.path, MANIFEST_NAME);
    assert!(manifest.contains("Title: The Robot and the Flower"));
    assert!(manifest.contains("Pages: 1"));
    assert_eq!(zip_names(&artifact.path), vec![MANIFEST_NAME.to_string(), "page_001.png".to_string()]);
}

#[tokio::test]
async fn failed_panel_becomes_placeholder_and_job_completes() {
    let dir = tempfile::tempdir().unwrap();
    let manager = JobManager::new(pipeline(
        dir.path(),
        MockTextService::comic("Dunes", 1, 5),
        MockImageService::new().failing_panels([3]),
    ));
    let job_id = manager
        .submit(GenerationRequest::from_text("story", options(1, &[OutputFormat::Archive])))
        .unwrap();
    let job = manager.wait(&job_id).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed, "error: {:?}", job.error);
    let result = job.result.unwrap();
    assert_eq!(result.degraded_panels, vec![3]);
    assert_eq!(result.pages.len(), 1);
    assert_eq!(result.pages[0].panel_positions.len(), 5);
    assert_eq!(result.pages[0].degraded_panels, vec![3]);
    assert!(job.warnings.iter().any(|w| w.contains("placeholder")));
}

#[tokio::test]
async fn every_export_failing_fails_the_job_naming_each_format() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Arc::new(Recorder::default());
    let p = pipeline(dir.path(), MockTextService::comic("Sandstorm", 1, 2), MockImageService::new())
        .with_exporter(Arc::new(BrokenExporter(OutputFormat::PagedDocument)))
        .with_exporter(Arc::new(BrokenExporter(OutputFormat::Archive)))
        .with_exporter(Arc::new(BrokenExporter(OutputFormat::Gallery)))
        .with_observer(recorder.clone());
    let manager = JobManager::new(p);

    let job_id = manager
        .submit(GenerationRequest::from_text("story", options(1, &OutputFormat::ALL)))
        .unwrap();
    let job = manager.wait(&job_id).await.unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.result.is_none());
    let error = job.error.unwrap();
    for id in ["paged-document", "archive", "gallery"] {
        assert!(error.contains(id), "{id} missing from {error}");
    }
    assert_eq!(recorder.exports.lock().unwrap().len(), 3);
    assert_eq!(manager.download(&job_id, OutputFormat::Archive), Err(DownloadError::NotReady(JobStatus::Failed)));
}

#[tokio::test]
async fn one_failing_export_is_reported_while_others_deliver() {
    let dir = tempfile::tempdir().unwrap();
    let p = pipeline(dir.path(), MockTextService::comic("Oasis", 2, 2), MockImageService::new())
        .with_exporter(Arc::new(BrokenExporter(OutputFormat::PagedDocument)));
    let manager = JobManager::new(p);

    let job_id = manager
        .submit(GenerationRequest::from_text(
            "story",
            options(2, &[OutputFormat::PagedDocument, OutputFormat::Archive, OutputFormat::Gallery]),
        ))
        .unwrap();
    let job = manager.wait(&job_id).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed, "error: {:?}", job.error);
    let result = job.result.unwrap();
    let formats: Vec<_> = result.comic_books.iter().map(|b| b.format).collect();
    assert_eq!(formats, vec![OutputFormat::Archive, OutputFormat::Gallery]);
    assert_eq!(result.export_failures.len(), 1);
    assert_eq!(result.export_failures[0].0, OutputFormat::PagedDocument);
    assert!(manager.download(&job_id, OutputFormat::Gallery).unwrap().path.exists());
    assert_eq!(
        manager.download(&job_id, OutputFormat::PagedDocument),
        Err(DownloadError::FormatNotFound(OutputFormat::PagedDocument))
    );
}

#[tokio::test]
async fn panels_and_pages_come_back_in_order_despite_uneven_latency() {
    let dir = tempfile::tempdir().unwrap();
    // Early panels finish last.
    let images = MockImageService::new().with_delay(|n| Duration::from_millis(u64::from(12 - n) * 5));
    let manager = JobManager::new(pipeline(dir.path(), MockTextService::comic("Order", 3, 4), images));
    let job_id = manager
        .submit(GenerationRequest::from_text("story", options(3, &[OutputFormat::Archive])))
        .unwrap();
    let job = manager.wait(&job_id).await.unwrap();
    let result = job.result.unwrap();

    let pages: Vec<u32> = result.pages.iter().map(|p| p.page_number).collect();
    assert_eq!(pages, vec![1, 2, 3]);
    let panels: Vec<u32> = result.script.panels.iter().map(|p| p.panel_number).collect();
    assert_eq!(panels, (1..=12).collect::<Vec<_>>());
    let archive = manager.download(&job_id, OutputFormat::Archive).unwrap();
    assert!(zip_names(&archive.path).contains(&"page_003.png".to_string()));
}

#[tokio::test]
async fn page_rectangles_stay_inside_the_page_without_overlap() {
    let dir = tempfile::tempdir().unwrap();
    let manager = JobManager::new(pipeline(dir.path(), MockTextService::comic("Grid", 1, 7), MockImageService::new()));
    let job_id = manager
        .submit(GenerationRequest::from_text("story", options(1, &[OutputFormat::Archive])))
        .unwrap();
    let result = manager.wait(&job_id).await.unwrap().result.unwrap();
    let layout = manager_layout_bounds();

    let rects = &result.pages[0].panel_positions;
    assert_eq!(rects.len(), 7);
    for (i, a) in rects.iter().enumerate() {
        assert!(a.right() <= layout.0 && a.bottom() <= layout.1);
        for b in &rects[i + 1..] {
            assert!(!a.overlaps(b), "{a:?} overlaps {b:?}");
        }
    }
}

fn manager_layout_bounds() -> (u32, u32) {
    let layout = doc2comic::LayoutConfig::default();
    (layout.page_width, layout.page_height)
}

#[tokio::test]
async fn cancelled_job_is_failed_and_stays_failed() {
    let dir = tempfile::tempdir().unwrap();
    let images = MockImageService::new().with_delay(|_| Duration::from_secs(30));
    let manager = JobManager::new(pipeline(dir.path(), MockTextService::comic("Slow", 1, 2), images));
    let job_id = manager
        .submit(GenerationRequest::from_text("story", options(1, &[OutputFormat::Archive])))
        .unwrap();

    // Wait until the job reaches the artwork stage.
    for _ in 0..200 {
        let job = manager.status(&job_id).unwrap();
        if job.current_stage == Some(Stage::Visual) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(manager.cancel(&job_id));
    assert!(!manager.cancel(&job_id));

    let job = manager.wait(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().contains("cancelled"));
    assert!(job.result.is_none());
}

#[tokio::test]
async fn cancelling_a_finished_job_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let manager = JobManager::new(pipeline(dir.path(), MockTextService::comic("Done", 1, 1), MockImageService::new()));
    let job_id = manager
        .submit(GenerationRequest::from_text("story", options(1, &[OutputFormat::Archive])))
        .unwrap();
    assert_eq!(manager.wait(&job_id).await.unwrap().status, JobStatus::Completed);

    assert!(!manager.cancel(&job_id));
    let job = manager.status(&job_id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.error.is_none());
    assert!(manager.download(&job_id, OutputFormat::Archive).is_ok());
}

#[tokio::test]
async fn observer_set_while_a_job_runs_sees_later_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let images = MockImageService::new().with_delay(|_| Duration::from_secs(30));
    let manager = JobManager::new(pipeline(dir.path(), MockTextService::comic("Slow", 1, 2), images));
    let first = manager
        .submit(GenerationRequest::from_text("story", options(1, &[OutputFormat::Archive])))
        .unwrap();

    // The first job's task still holds the pipeline.
    let recorder = Arc::new(Recorder::default());
    let manager = manager.with_observer(recorder.clone());
    let second = manager
        .submit(GenerationRequest::from_text("story", options(1, &[OutputFormat::Archive])))
        .unwrap();
    assert_eq!(recorder.statuses.lock().unwrap().first(), Some(&JobStatus::Queued));

    assert!(manager.cancel(&first));
    assert!(manager.cancel(&second));
    let failed = recorder
        .statuses
        .lock()
        .unwrap()
        .iter()
        .filter(|s| **s == JobStatus::Failed)
        .count();
    assert_eq!(failed, 2);
}

#[tokio::test]
async fn download_name_matches_the_file_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let manager = JobManager::new(pipeline(
        dir.path(),
        MockTextService::comic("Sand/Stone \"Tales\"", 1, 1),
        MockImageService::new(),
    ));
    let job_id = manager
        .submit(GenerationRequest::from_text("story", options(1, &[OutputFormat::Archive])))
        .unwrap();
    assert_eq!(manager.wait(&job_id).await.unwrap().status, JobStatus::Completed);

    let artifact = manager.download(&job_id, OutputFormat::Archive).unwrap();
    assert_eq!(artifact.file_name, "Sand_Stone__Tales.cbz");
    assert_eq!(artifact.path.file_name().unwrap().to_str(), Some("Sand_Stone__Tales.cbz"));
}

#[tokio::test]
async fn invalid_request_is_rejected_at_submit() {
    let dir = tempfile::tempdir().unwrap();
    let manager = JobManager::new(pipeline(dir.path(), MockTextService::comic("X", 1, 1), MockImageService::new()));
    let err = manager
        .submit(GenerationRequest::from_text("story", options(0, &[OutputFormat::Archive])))
        .unwrap_err();
    assert!(err.to_string().contains("target_pages"));
    assert!(manager.status("nope").is_none());
    assert_eq!(
        manager.download("nope", OutputFormat::Archive),
        Err(DownloadError::JobNotFound("nope".into()))
    );
}

#[tokio::test]
async fn missing_source_file_fails_the_job() {
    let dir = tempfile::tempdir().unwrap();
    let manager = JobManager::new(pipeline(dir.path(), MockTextService::comic("X", 1, 1), MockImageService::new()));
    let job_id = manager
        .submit(GenerationRequest::from_file(
            dir.path().join("missing.pdf"),
            options(1, &[OutputFormat::Archive]),
        ))
        .unwrap();
    let job = manager.wait(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.current_stage, Some(Stage::Intake));
}

#[tokio::test]
async fn uploaded_text_file_is_a_valid_source() {
    let dir = tempfile::tempdir().unwrap();
    let manager = JobManager::new(pipeline(dir.path(), MockTextService::comic("Upload", 1, 2), MockImageService::new()));
    let staged = manager
        .stage_upload("notes.txt", b"A robot waters a flower every morning.")
        .await
        .unwrap();
    assert!(staged.starts_with(dir.path().join("outputs/temp")));

    let job_id = manager
        .submit(GenerationRequest::from_file(staged, options(1, &[OutputFormat::Gallery])))
        .unwrap();
    let job = manager.wait(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed, "error: {:?}", job.error);

    let gallery = manager.download(&job_id, OutputFormat::Gallery).unwrap();
    let html = std::fs::read_to_string(&gallery.path).unwrap();
    assert!(html.contains("Upload"));
    assert_eq!(manager.cleanup_scratch().await.unwrap(), 0);
}
