//! Observer trait for generation events.
//!
//! Attach an [`Arc<dyn GenerationObserver>`] through
//! [`crate::orchestrator::Pipeline::with_observer`] or
//! [`crate::jobs::JobManager::with_observer`] to receive events as a job
//! advances. Every method has a no-op default and [`NoopObserver`] is
//! installed when nothing else is, so the pipeline never checks whether an
//! observer is present.
//!
//! # Example
//!
//! ```rust
//! use doc2comic::{GenerationObserver, Stage};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! #[derive(Default)]
//! struct PanelCounter(AtomicUsize);
//!
//! impl GenerationObserver for PanelCounter {
//!     fn on_panel_complete(&self, _job_id: &str, _panel: u32, _total: usize, _degraded: bool) {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!     }
//! }
//! ```

use crate::config::OutputFormat;
use crate::jobs::{JobStatus, Stage};
use crate::model::ExportResult;
use std::sync::Arc;

/// Receives job events. Implementations must be `Send + Sync`.
///
/// # Thread safety
///
/// `on_panel_complete` is called from concurrent panel tasks in completion
/// order, not panel order. Everything else is called from the job's own
/// task, in stage order.
pub trait GenerationObserver: Send + Sync {
    /// The job moved to a new lifecycle status.
    fn on_status_change(&self, job_id: &str, status: JobStatus) {
        let _ = (job_id, status);
    }

    /// A stage is about to run.
    fn on_stage_start(&self, job_id: &str, stage: Stage) {
        let _ = (job_id, stage);
    }

    /// A stage finished; `progress` is the job's new overall progress.
    fn on_stage_complete(&self, job_id: &str, stage: Stage, progress: f32) {
        let _ = (job_id, stage, progress);
    }

    /// Called once the script is known, before any artwork is requested.
    fn on_script_ready(&self, job_id: &str, total_panels: usize, total_pages: usize) {
        let _ = (job_id, total_panels, total_pages);
    }

    /// One panel's artwork request finished (successfully or degraded).
    fn on_panel_complete(&self, job_id: &str, panel_number: u32, total_panels: usize, degraded: bool) {
        let _ = (job_id, panel_number, total_panels, degraded);
    }

    /// One page was composed.
    fn on_page_rendered(&self, job_id: &str, page_number: u32, total_pages: usize) {
        let _ = (job_id, page_number, total_pages);
    }

    /// One output format finished. `Err` carries the failure reason.
    fn on_export_result(&self, job_id: &str, format: OutputFormat, result: Result<&ExportResult, &str>) {
        let _ = (job_id, format, result);
    }
}

/// The default observer. Ignores everything.
pub struct NoopObserver;

impl GenerationObserver for NoopObserver {}

pub type Observer = Arc<dyn GenerationObserver>;

/// Shorthand for the default observer handle.
pub fn noop() -> Observer {
    Arc::new(NoopObserver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        stages: Mutex<Vec<Stage>>,
        degraded: AtomicUsize,
    }

    impl GenerationObserver for Recording {
        fn on_stage_start(&self, _job_id: &str, stage: Stage) {
            self.stages.lock().unwrap().push(stage);
        }

        fn on_panel_complete(&self, _job_id: &str, _panel: u32, _total: usize, degraded: bool) {
            if degraded {
                self.degraded.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn noop_observer_does_not_panic() {
        let ob = noop();
        ob.on_status_change("j", JobStatus::Processing);
        ob.on_stage_start("j", Stage::Intake);
        ob.on_stage_complete("j", Stage::Intake, 0.1);
        ob.on_panel_complete("j", 1, 3, false);
        ob.on_page_rendered("j", 1, 1);
        ob.on_export_result("j", OutputFormat::Archive, Err("disk full"));
    }

    #[test]
    fn overridden_methods_receive_events() {
        let rec = Recording::default();
        rec.on_stage_start("j", Stage::Content);
        rec.on_stage_start("j", Stage::Visual);
        rec.on_panel_complete("j", 1, 2, true);
        rec.on_panel_complete("j", 2, 2, false);
        assert_eq!(*rec.stages.lock().unwrap(), vec![Stage::Content, Stage::Visual]);
        assert_eq!(rec.degraded.load(Ordering::SeqCst), 1);
    }
}
