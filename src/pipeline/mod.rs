//! Pipeline stages for document-to-comic generation.
//!
//! Each submodule implements exactly one stage with a typed input and output,
//! so stages can be tested and swapped independently.
//!
//! ## Data Flow
//!
//! ```text
//! intake ──▶ content ──▶ visual ──▶ layout ──▶ export
//! (text)     (script)    (N panels) (pages)    (pdf / cbz / gallery)
//! ```
//!
//! 1. [`intake`]: read a PDF (pdfium, `spawn_blocking`) or text into a
//!    normalised [`crate::model::ProcessedDocument`]
//! 2. [`content`]: translation → story structure → panel script, each step
//!    parsed strictly through [`postprocess`]
//! 3. [`visual`]: bounded fan-out of image requests; the only stage with
//!    per-item partial failure
//! 4. [`layout`]: grid placement, text overlays, page rendering
//! 5. [`export`]: one isolated converter per output format

pub mod content;
pub mod export;
pub mod intake;
pub mod layout;
pub mod postprocess;
pub mod visual;
