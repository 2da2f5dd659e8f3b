//! Error types for the doc2comic library.
//!
//! Four error types reflect four failure scopes:
//!
//! * [`ComicError`]: **Fatal**: the job cannot produce a comic (unreadable
//!   source, malformed model output, every panel or every export failed).
//!   Returned as `Err(ComicError)` from [`crate::orchestrator::Pipeline::run`].
//!
//! * [`PanelError`]: **Non-fatal**: one panel's artwork could not be
//!   generated. Stored inside the degraded [`crate::model::PanelArtwork`] so
//!   the page still renders a placeholder in that position.
//!
//! * [`ExportError`]: **Non-fatal**: one output format failed to serialise.
//!   Stored per format in the export result map; other formats still run.
//!
//! * [`ServiceError`]: a single call to an external model service failed.
//!   Carries the retry classification used by
//!   [`crate::services::retry_with_backoff`].

use crate::config::OutputFormat;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the doc2comic library.
#[derive(Debug, Error)]
pub enum ComicError {
    // ── Intake errors ─────────────────────────────────────────────────────
    /// Source file was not found at the given path.
    #[error("Source file not found: '{path}'")]
    SourceNotFound { path: PathBuf },

    /// The file has a `.pdf` extension but does not start with `%PDF`.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    /// The source was read but contained no usable text.
    #[error("Source contains no text to adapt")]
    EmptySource,

    /// Extraction failed for any other reason (corrupt PDF, pdfium missing, I/O).
    #[error("Document extraction failed for '{path}': {detail}")]
    IntakeFailed { path: PathBuf, detail: String },

    // ── Content errors ────────────────────────────────────────────────────
    /// A content sub-step returned text that does not match its schema.
    #[error("{step} returned malformed output: {detail}")]
    MalformedOutput { step: String, detail: String },

    /// The script parsed but violates the numbering invariants.
    #[error("Generated script is invalid: {0}")]
    InvalidScript(String),

    // ── Service errors ────────────────────────────────────────────────────
    /// An external service kept failing after all retries.
    #[error("{service} failed after {attempts} attempt(s): {detail}")]
    ServiceFailed {
        service: String,
        attempts: u32,
        detail: String,
    },

    /// The service could not be constructed (missing API key etc.).
    #[error("Service '{service}' is not configured.\n{hint}")]
    ServiceNotConfigured { service: String, hint: String },

    // ── Visual / export errors ────────────────────────────────────────────
    /// Every panel fell back to a placeholder.
    #[error("All {total} panels failed to generate.\nFirst error: {first_error}")]
    AllPanelsFailed { total: usize, first_error: String },

    /// Every requested output format failed.
    #[error("All {} export format(s) failed: {}", .failures.len(), describe_failures(.failures))]
    AllExportsFailed { failures: Vec<(OutputFormat, String)> },

    // ── Job errors ────────────────────────────────────────────────────────
    /// The caller cancelled the job.
    #[error("Job cancelled by caller")]
    Cancelled,

    /// The request itself is unusable (e.g. no output formats).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write a file under the job directory.
    #[error("Failed to write '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ComicError {
    /// Wrap an I/O error with the path it concerns.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ComicError::Io {
            path: path.into(),
            source,
        }
    }
}

fn describe_failures(failures: &[(OutputFormat, String)]) -> String {
    failures
        .iter()
        .map(|(format, reason)| format!("{format}: {reason}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// A non-fatal error for a single panel.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize, serde::Deserialize)]
pub enum PanelError {
    /// The image service returned an error after retries.
    #[error("Panel {panel}: image generation failed after {attempts} attempt(s): {detail}")]
    GenerationFailed {
        panel: u32,
        attempts: u32,
        detail: String,
    },

    /// The asynchronous job never finished within the polling ceiling.
    #[error("Panel {panel}: image still processing after {polls} poll(s)")]
    StillProcessing { panel: u32, polls: u32 },

    /// The returned bytes could not be decoded as an image.
    #[error("Panel {panel}: malformed image: {detail}")]
    MalformedImage { panel: u32, detail: String },

    /// The artwork could not be written to the job directory.
    #[error("Panel {panel}: could not store artwork: {detail}")]
    StoreFailed { panel: u32, detail: String },
}

/// A non-fatal error for a single output format.
#[derive(Debug, Error)]
pub enum ExportError {
    /// There were no pages to export.
    #[error("no pages to export")]
    NoPages,

    /// A page image could not be read or decoded.
    #[error("page {page} ('{path}') could not be loaded: {detail}")]
    PageUnreadable {
        page: usize,
        path: PathBuf,
        detail: String,
    },

    /// Writing the container failed.
    #[error("could not write '{path}': {detail}")]
    WriteFailed { path: PathBuf, detail: String },

    /// The converter itself failed (encoder error, task panic, outage).
    #[error("{0}")]
    ConverterFailed(String),
}

/// A single failed call to an external model service.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ServiceError {
    /// HTTP 429 or an equivalent quota message. Retryable.
    #[error("rate limited{}", .retry_after_secs.map(|s| format!(" (retry after {s}s)")).unwrap_or_default())]
    RateLimited { retry_after_secs: Option<u64> },

    /// The call exceeded its bounded wait. Retryable.
    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },

    /// Connection, DNS or 5xx failure. Retryable.
    #[error("transport error: {0}")]
    Transport(String),

    /// The service rejected the credentials. Not retryable.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// The service answered with an explicit error. Not retryable.
    #[error("service error: {0}")]
    Api(String),

    /// The response did not have the expected shape. Not retryable.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ServiceError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServiceError::RateLimited { .. } | ServiceError::Timeout { .. } | ServiceError::Transport(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_exports_failed_names_every_format() {
        let e = ComicError::AllExportsFailed {
            failures: vec![
                (OutputFormat::PagedDocument, "disk full".into()),
                (OutputFormat::Archive, "disk full".into()),
                (OutputFormat::Gallery, "disk full".into()),
            ],
        };
        let msg = e.to_string();
        assert!(msg.contains("All 3"), "got: {msg}");
        assert!(msg.contains("paged-document"), "got: {msg}");
        assert!(msg.contains("archive"), "got: {msg}");
        assert!(msg.contains("gallery"), "got: {msg}");
    }

    #[test]
    fn retry_classification() {
        assert!(ServiceError::RateLimited { retry_after_secs: None }.is_retryable());
        assert!(ServiceError::Timeout { secs: 5 }.is_retryable());
        assert!(ServiceError::Transport("reset".into()).is_retryable());
        assert!(!ServiceError::Auth("bad key".into()).is_retryable());
        assert!(!ServiceError::Malformed("no output".into()).is_retryable());
        assert!(!ServiceError::Api("nsfw".into()).is_retryable());
    }

    #[test]
    fn rate_limit_display_with_retry_after() {
        let e = ServiceError::RateLimited {
            retry_after_secs: Some(30),
        };
        assert!(e.to_string().contains("30s"));
    }

    #[test]
    fn panel_error_display() {
        let e = PanelError::StillProcessing { panel: 3, polls: 10 };
        let msg = e.to_string();
        assert!(msg.contains("Panel 3"));
        assert!(msg.contains("10 poll"));
    }

    #[test]
    fn malformed_output_names_step() {
        let e = ComicError::MalformedOutput {
            step: "scriptwriting".into(),
            detail: "missing field `panels`".into(),
        };
        assert!(e.to_string().starts_with("scriptwriting"));
    }
}
