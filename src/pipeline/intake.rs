//! Document intake: turn a [`Source`] into a [`ProcessedDocument`].
//!
//! PDFs are read through pdfium on a blocking thread, since the library
//! keeps thread-local state and must not run on Tokio workers. Anything
//! else is read as text (UTF-8, falling back to Latin-1). The magic bytes
//! are checked before pdfium sees a file so a mislabelled upload gets a
//! clear error rather than a pdfium failure.
//!
//! Intake never returns partial results: any failure fails the job.

use crate::error::ComicError;
use crate::model::{GenerationOptions, ProcessedDocument, Source};
use pdfium_render::prelude::*;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info};

pub async fn process(source: &Source, options: &GenerationOptions) -> Result<ProcessedDocument, ComicError> {
    let language = options.source_language().to_string();
    match source {
        Source::Text(text) => build(text, language, BTreeMap::new()),
        Source::Pdf(path) => {
            if !path.exists() {
                return Err(ComicError::SourceNotFound { path: path.clone() });
            }
            let is_pdf = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("pdf"));
            if is_pdf {
                check_pdf_magic(path)?;
                let owned = path.clone();
                let (text, metadata) = tokio::task::spawn_blocking(move || extract_pdf_blocking(&owned))
                    .await
                    .map_err(|e| ComicError::Internal(format!("Extraction task panicked: {e}")))??;
                info!("Extracted {} chars from {}", text.len(), path.display());
                build(&text, language, metadata)
            } else {
                let text = read_text_file(path).await?;
                let mut metadata = BTreeMap::new();
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    metadata.insert("filename".to_string(), name.to_string());
                }
                build(&text, language, metadata)
            }
        }
    }
}

fn build(
    raw: &str,
    language: String,
    metadata: BTreeMap<String, String>,
) -> Result<ProcessedDocument, ComicError> {
    let content = normalize_text(raw);
    if content.is_empty() {
        return Err(ComicError::EmptySource);
    }
    let word_count = content.split_whitespace().count();
    debug!("Intake: {} words", word_count);
    Ok(ProcessedDocument {
        content,
        language,
        word_count,
        metadata,
    })
}

/// Trim every line, drop blank ones, and separate the rest by a blank line.
pub fn normalize_text(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn check_pdf_magic(path: &Path) -> Result<(), ComicError> {
    let mut file = std::fs::File::open(path).map_err(|e| ComicError::IntakeFailed {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    let mut magic = [0u8; 4];
    if file.read_exact(&mut magic).is_err() || &magic != b"%PDF" {
        return Err(ComicError::NotAPdf {
            path: path.to_path_buf(),
            magic,
        });
    }
    Ok(())
}

async fn read_text_file(path: &Path) -> Result<String, ComicError> {
    let bytes = tokio::fs::read(path).await.map_err(|e| ComicError::IntakeFailed {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    Ok(decode_text(bytes))
}

/// UTF-8 if valid, otherwise each byte as its Latin-1 code point.
pub fn decode_text(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(s) => s,
        Err(e) => e.into_bytes().iter().map(|&b| b as char).collect(),
    }
}

/// Bind pdfium: `PDFIUM_LIB_PATH`, then the working directory, then the
/// system loader.
fn bind_pdfium() -> Result<Pdfium, PdfiumError> {
    let dir = std::env::var("PDFIUM_LIB_PATH").unwrap_or_else(|_| "./".to_string());
    let bindings = Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(&dir))
        .or_else(|_| Pdfium::bind_to_system_library())?;
    Ok(Pdfium::new(bindings))
}

fn extract_pdf_blocking(path: &Path) -> Result<(String, BTreeMap<String, String>), ComicError> {
    let fail = |detail: String| ComicError::IntakeFailed {
        path: path.to_path_buf(),
        detail,
    };

    let pdfium = bind_pdfium().map_err(|e| fail(format!("pdfium library unavailable: {e:?}")))?;
    let document = pdfium
        .load_pdf_from_file(path, None)
        .map_err(|e| fail(format!("{e:?}")))?;

    let mut metadata = BTreeMap::new();
    let tags = document.metadata();
    for (key, tag) in [
        ("title", PdfDocumentMetadataTagType::Title),
        ("author", PdfDocumentMetadataTagType::Author),
        ("subject", PdfDocumentMetadataTagType::Subject),
        ("creator", PdfDocumentMetadataTagType::Creator),
        ("producer", PdfDocumentMetadataTagType::Producer),
    ] {
        if let Some(value) = tags.get(tag).map(|t| t.value().to_string()) {
            if !value.is_empty() {
                metadata.insert(key.to_string(), value);
            }
        }
    }

    let pages = document.pages();
    metadata.insert("page_count".to_string(), pages.len().to_string());

    let mut parts = Vec::new();
    for (idx, page) in pages.iter().enumerate() {
        let text = page
            .text()
            .map_err(|e| fail(format!("page {}: {e:?}", idx + 1)))?
            .all();
        if !text.trim().is_empty() {
            parts.push(text);
        }
    }
    Ok((parts.join("\n\n"), metadata))
}
