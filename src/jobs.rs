//! Job records, their store, and the background job manager.
//!
//! ## Lifecycle
//!
//! ```text
//! queued ──▶ processing ──▶ completed
//!                 │
//!                 └───────▶ failed
//! ```
//!
//! While processing, `current_stage` only moves forward
//! (intake → content → visual → layout+export) and `progress` never
//! decreases. All writes go through a [`JobTracker`]. The job's own task
//! drives it, except for cancellation, which the manager applies. Once a job
//! is terminal, further transitions are ignored.

use crate::config::{GenerationConfig, OutputFormat};
use crate::error::ComicError;
use crate::model::{GenerationRequest, GenerationResult};
use crate::orchestrator::Pipeline;
use crate::pipeline::export::ExportMeta;
use crate::progress::Observer;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Intake,
    Content,
    Visual,
    LayoutExport,
}

impl Stage {
    /// Overall progress once this stage has finished.
    pub fn progress_after(self) -> f32 {
        match self {
            Stage::Intake => 0.1,
            Stage::Content => 0.4,
            Stage::Visual => 0.75,
            Stage::LayoutExport => 1.0,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Stage::Intake => "Reading source",
            Stage::Content => "Writing story and script",
            Stage::Visual => "Generating panel artwork",
            Stage::LayoutExport => "Composing pages and exporting",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: f32,
    pub current_stage: Option<Stage>,
    pub message: String,
    /// Set only when `status == Completed`.
    pub result: Option<GenerationResult>,
    pub error: Option<String>,
    pub warnings: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn queued(job_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.into(),
            status: JobStatus::Queued,
            progress: 0.0,
            current_stage: None,
            message: "Queued".to_string(),
            result: None,
            error: None,
            warnings: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

// ── Store ────────────────────────────────────────────────────────────────

/// Backing store for job records.
pub trait JobStore: Send + Sync {
    fn get(&self, job_id: &str) -> Option<Job>;

    fn put(&self, job: Job);

    /// Apply `mutator` to the stored job. Returns the updated record, or
    /// `None` if the job does not exist.
    fn update(&self, job_id: &str, mutator: &mut dyn FnMut(&mut Job)) -> Option<Job>;
}

#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<String, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().map(|j| j.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl JobStore for InMemoryJobStore {
    fn get(&self, job_id: &str) -> Option<Job> {
        self.jobs.read().ok()?.get(job_id).cloned()
    }

    fn put(&self, job: Job) {
        if let Ok(mut jobs) = self.jobs.write() {
            jobs.insert(job.job_id.clone(), job);
        }
    }

    fn update(&self, job_id: &str, mutator: &mut dyn FnMut(&mut Job)) -> Option<Job> {
        let mut jobs = self.jobs.write().ok()?;
        let job = jobs.get_mut(job_id)?;
        mutator(job);
        job.updated_at = Utc::now();
        Some(job.clone())
    }
}

// ── Tracker ──────────────────────────────────────────────────────────────

/// Applies lifecycle transitions to one job's record.
#[derive(Clone)]
pub struct JobTracker {
    job_id: String,
    store: Arc<dyn JobStore>,
    observer: Observer,
}

impl JobTracker {
    pub fn new(job_id: impl Into<String>, store: Arc<dyn JobStore>, observer: Observer) -> Self {
        Self {
            job_id: job_id.into(),
            store,
            observer,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn observer(&self) -> &Observer {
        &self.observer
    }

    pub fn snapshot(&self) -> Option<Job> {
        self.store.get(&self.job_id)
    }

    pub fn is_terminal(&self) -> bool {
        self.snapshot().is_none_or(|j| j.status.is_terminal())
    }

    /// Apply `f` unless the job is already terminal.
    fn transition(&self, mut f: impl FnMut(&mut Job)) -> Option<Job> {
        self.store.update(&self.job_id, &mut |job| {
            if !job.status.is_terminal() {
                f(job);
            }
        })
    }

    pub fn start(&self) {
        let updated = self.transition(|job| {
            if job.status == JobStatus::Queued {
                job.status = JobStatus::Processing;
                job.message = "Processing".to_string();
            }
        });
        if updated.is_some_and(|j| j.status == JobStatus::Processing) {
            self.observer.on_status_change(&self.job_id, JobStatus::Processing);
        }
    }

    pub fn enter(&self, stage: Stage) {
        self.transition(|job| {
            if job.current_stage.is_none_or(|s| s < stage) {
                job.current_stage = Some(stage);
                job.message = stage.describe().to_string();
            }
        });
        self.observer.on_stage_start(&self.job_id, stage);
    }

    pub fn finish(&self, stage: Stage) {
        let progress = stage.progress_after();
        let updated = self.transition(|job| {
            job.progress = job.progress.max(progress);
        });
        let reported = updated.map(|j| j.progress).unwrap_or(progress);
        self.observer.on_stage_complete(&self.job_id, stage, reported);
    }

    pub fn warn(&self, warnings: &[String]) {
        if warnings.is_empty() {
            return;
        }
        self.transition(|job| job.warnings.extend(warnings.iter().cloned()));
    }

    pub fn complete(&self, result: GenerationResult) {
        let formats = result.comic_books.len();
        let mut applied = false;
        self.transition(|job| {
            applied = true;
            job.status = JobStatus::Completed;
            job.progress = 1.0;
            job.message = format!("Completed with {formats} format(s)");
            for w in &result.warnings {
                if !job.warnings.contains(w) {
                    job.warnings.push(w.clone());
                }
            }
            job.result = Some(result.clone());
        });
        if applied {
            info!("Job {} completed", self.job_id);
            self.observer.on_status_change(&self.job_id, JobStatus::Completed);
        }
    }

    /// Mark the job failed. Returns false if it was already terminal.
    pub fn fail(&self, err: &ComicError) -> bool {
        let reason = err.to_string();
        let mut applied = false;
        self.transition(|job| {
            applied = true;
            job.status = JobStatus::Failed;
            job.message = format!("Failed: {reason}");
            job.error = Some(reason.clone());
        });
        if applied {
            error!("Job {} failed: {}", self.job_id, reason);
            self.observer.on_status_change(&self.job_id, JobStatus::Failed);
        }
        applied
    }
}

// ── Manager ──────────────────────────────────────────────────────────────

/// A downloadable artifact for one format of a completed job.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub path: PathBuf,
    pub media_type: &'static str,
    pub file_name: String,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DownloadError {
    #[error("job '{0}' not found")]
    JobNotFound(String),
    #[error("job is {0:?}, not completed")]
    NotReady(JobStatus),
    #[error("format {0} was not produced for this job")]
    FormatNotFound(OutputFormat),
}

/// Runs each submitted job on its own task.
pub struct JobManager {
    pipeline: Arc<Pipeline>,
    store: Arc<dyn JobStore>,
    observer: Observer,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl JobManager {
    pub fn new(pipeline: Pipeline) -> Self {
        Self::with_store(pipeline, Arc::new(InMemoryJobStore::new()))
    }

    pub fn with_store(pipeline: Pipeline, store: Arc<dyn JobStore>) -> Self {
        Self {
            observer: pipeline.observer().clone(),
            pipeline: Arc::new(pipeline),
            store,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the observer for every job submitted from now on.
    pub fn with_observer(mut self, observer: Observer) -> Self {
        self.observer = observer;
        self
    }

    fn config(&self) -> &GenerationConfig {
        self.pipeline.config()
    }

    /// Validate the request, record it as queued and start it in the
    /// background. Returns the job id immediately.
    pub fn submit(&self, request: GenerationRequest) -> Result<String, ComicError> {
        request.options.validate()?;
        let job_id = uuid::Uuid::new_v4().to_string();
        self.store.put(Job::queued(&job_id));
        self.observer.on_status_change(&job_id, JobStatus::Queued);

        let tracker = self.tracker(&job_id);
        let pipeline = Arc::clone(&self.pipeline);
        let handle = tokio::spawn(async move {
            match pipeline.run(&request, &tracker).await {
                Ok(result) => tracker.complete(result),
                Err(e) => {
                    tracker.fail(&e);
                }
            }
        });

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.retain(|_, h| !h.is_finished());
            tasks.insert(job_id.clone(), handle);
        }
        info!("Job {} queued", job_id);
        Ok(job_id)
    }

    pub fn status(&self, job_id: &str) -> Option<Job> {
        self.store.get(job_id)
    }

    /// Wait for the job's task to end and return the final record.
    pub async fn wait(&self, job_id: &str) -> Option<Job> {
        let handle = self.tasks.lock().ok().and_then(|mut t| t.remove(job_id));
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    let tracker = self.tracker(job_id);
                    tracker.fail(&ComicError::Internal(format!("job task panicked: {e}")));
                }
            }
        }
        self.store.get(job_id)
    }

    /// Mark the job failed and abandon its in-flight work. Returns false if
    /// the job is unknown or reached a terminal state first.
    pub fn cancel(&self, job_id: &str) -> bool {
        if !self.tracker(job_id).fail(&ComicError::Cancelled) {
            return false;
        }
        if let Some(handle) = self.tasks.lock().ok().and_then(|mut t| t.remove(job_id)) {
            handle.abort();
        }
        warn!("Job {} cancelled", job_id);
        true
    }

    /// Locate the artifact for `format` of a completed job.
    pub fn download(&self, job_id: &str, format: OutputFormat) -> Result<Artifact, DownloadError> {
        let job = self
            .store
            .get(job_id)
            .ok_or_else(|| DownloadError::JobNotFound(job_id.to_string()))?;
        let result = match (job.status, job.result) {
            (JobStatus::Completed, Some(result)) => result,
            (status, _) => return Err(DownloadError::NotReady(status)),
        };
        let book = result.book(format).ok_or(DownloadError::FormatNotFound(format))?;
        Ok(Artifact {
            path: book.output_location.clone(),
            media_type: format.media_type(),
            file_name: format!(
                "{}.{}",
                ExportMeta::new(book.title.as_str(), book.author.as_str()).file_stem(),
                format.extension()
            ),
        })
    }

    /// Store an uploaded source under the scratch directory.
    pub async fn stage_upload(&self, file_name: &str, bytes: &[u8]) -> Result<PathBuf, ComicError> {
        let dir = &self.config().temp_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| ComicError::io(dir, e))?;
        let safe: String = file_name
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '.' || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let path = dir.join(format!("{}_{}", uuid::Uuid::new_v4(), safe.trim_start_matches('.')));
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| ComicError::io(&path, e))?;
        Ok(path)
    }

    /// Remove scratch files older than the retention window. Returns how
    /// many were removed.
    pub async fn cleanup_scratch(&self) -> Result<usize, ComicError> {
        let days = u64::from(self.config().cleanup_after_days);
        cleanup_older_than(&self.config().temp_dir, Duration::from_secs(days * 86_400)).await
    }

    fn tracker(&self, job_id: &str) -> JobTracker {
        JobTracker::new(job_id, Arc::clone(&self.store), self.observer.clone())
    }
}

pub(crate) async fn cleanup_older_than(dir: &std::path::Path, max_age: Duration) -> Result<usize, ComicError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(ComicError::io(dir, e)),
    };
    let now = SystemTime::now();
    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await.map_err(|e| ComicError::io(dir, e))? {
        let meta = match entry.metadata().await {
            Ok(m) if m.is_file() => m,
            _ => continue,
        };
        let age = meta
            .modified()
            .ok()
            .and_then(|m| now.duration_since(m).ok())
            .unwrap_or_default();
        if age > max_age {
            let path = entry.path();
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Could not remove {}: {}", path.display(), e),
            }
        }
    }
    Ok(removed)
}
