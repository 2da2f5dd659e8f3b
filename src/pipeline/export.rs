//! Export stage: serialise composed pages into each requested container.
//!
//! Every format is an isolated [`Exporter`] run on its own blocking thread.
//! A failing format never stops the others; [`ExportStage::run`] returns one
//! result per requested format. Files are written to a temporary sibling and
//! renamed into place, so a failed export never leaves a partial artifact
//! under its final name.

use crate::config::{GenerationConfig, OutputFormat};
use crate::error::ExportError;
use crate::model::ExportResult;
use crate::progress::Observer;
use image::codecs::jpeg::JpegEncoder;
use image::{imageops::FilterType, DynamicImage, RgbImage};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream, StringFormat};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Book-level metadata embedded by the converters.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportMeta {
    pub title: String,
    pub author: String,
    pub subject: String,
}

impl ExportMeta {
    pub fn new(title: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            author: author.into(),
            subject: "AI Generated Comic Book".to_string(),
        }
    }

    /// Filesystem-safe stem derived from the title.
    pub fn file_stem(&self) -> String {
        let stem: String = self
            .title
            .trim()
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let stem = stem.trim_matches('_').to_string();
        if stem.is_empty() {
            "comic".to_string()
        } else {
            stem
        }
    }
}

/// One output container.
pub trait Exporter: Send + Sync {
    fn format(&self) -> OutputFormat;

    fn export(&self, pages: &[PathBuf], meta: &ExportMeta, out_dir: &Path) -> Result<ExportResult, ExportError>;
}

pub type ExportResults = BTreeMap<OutputFormat, Result<ExportResult, ExportError>>;

/// Registry of converters keyed by format.
pub struct ExportStage {
    exporters: BTreeMap<OutputFormat, Arc<dyn Exporter>>,
}

impl ExportStage {
    /// The three built-in converters.
    pub fn from_config(config: &GenerationConfig) -> Self {
        Self::empty()
            .with_exporter(Arc::new(PdfExporter {
                page_size: config.pdf_page_size,
            }))
            .with_exporter(Arc::new(ArchiveExporter))
            .with_exporter(Arc::new(GalleryExporter {
                max_width: config.max_web_width,
            }))
    }

    pub fn empty() -> Self {
        Self {
            exporters: BTreeMap::new(),
        }
    }

    /// Register (or replace) the converter for its format.
    pub fn with_exporter(mut self, exporter: Arc<dyn Exporter>) -> Self {
        self.exporters.insert(exporter.format(), exporter);
        self
    }

    /// Run every requested format concurrently.
    pub async fn run(
        &self,
        job_id: &str,
        pages: &[PathBuf],
        meta: &ExportMeta,
        formats: &BTreeSet<OutputFormat>,
        out_dir: &Path,
        observer: &Observer,
    ) -> ExportResults {
        let tasks = formats.iter().map(|&format| {
            let exporter = self.exporters.get(&format).cloned();
            let pages = pages.to_vec();
            let meta = meta.clone();
            let out_dir = out_dir.to_path_buf();
            async move {
                let result = match exporter {
                    None => Err(ExportError::ConverterFailed(format!("no converter registered for {format}"))),
                    Some(exporter) => {
                        tokio::task::spawn_blocking(move || {
                            std::fs::create_dir_all(&out_dir).map_err(|e| ExportError::WriteFailed {
                                path: out_dir.clone(),
                                detail: e.to_string(),
                            })?;
                            exporter.export(&pages, &meta, &out_dir)
                        })
                        .await
                        .unwrap_or_else(|e| Err(ExportError::ConverterFailed(format!("export task panicked: {e}"))))
                    }
                };
                (format, result)
            }
        });

        let results: ExportResults = futures::future::join_all(tasks).await.into_iter().collect();
        for (format, result) in &results {
            match result {
                Ok(r) => {
                    info!("{}: {} page(s), {} bytes → {}", format, r.page_count, r.byte_size, r.output_location.display());
                    observer.on_export_result(job_id, *format, Ok(r));
                }
                Err(e) => {
                    let reason = e.to_string();
                    warn!("{} export failed: {}", format, reason);
                    observer.on_export_result(job_id, *format, Err(reason.as_str()));
                }
            }
        }
        results
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

fn load_page(index: usize, path: &Path) -> Result<DynamicImage, ExportError> {
    image::open(path).map_err(|e| ExportError::PageUnreadable {
        page: index + 1,
        path: path.to_path_buf(),
        detail: e.to_string(),
    })
}

fn write_failed(path: &Path, e: impl std::fmt::Display) -> ExportError {
    ExportError::WriteFailed {
        path: path.to_path_buf(),
        detail: e.to_string(),
    }
}

/// Composite any alpha channel onto white.
fn flatten_rgb(img: &DynamicImage) -> RgbImage {
    if !img.color().has_alpha() {
        return img.to_rgb8();
    }
    let rgba = img.to_rgba8();
    let mut out = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, p) in rgba.enumerate_pixels() {
        let a = u16::from(p[3]);
        let blend = |c: u8| ((u16::from(c) * a + 255 * (255 - a)) / 255) as u8;
        out.put_pixel(x, y, image::Rgb([blend(p[0]), blend(p[1]), blend(p[2])]));
    }
    out
}

fn encode_jpeg(img: &RgbImage, quality: u8) -> Result<Vec<u8>, String> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality)
        .encode_image(img)
        .map_err(|e| e.to_string())?;
    Ok(buf)
}

fn persist(tmp: NamedTempFile, dest: &Path) -> Result<u64, ExportError> {
    tmp.persist(dest).map_err(|e| write_failed(dest, e.error))?;
    std::fs::metadata(dest)
        .map(|m| m.len())
        .map_err(|e| write_failed(dest, e))
}

fn require_pages(pages: &[PathBuf]) -> Result<(), ExportError> {
    if pages.is_empty() {
        Err(ExportError::NoPages)
    } else {
        Ok(())
    }
}

// ── Paged document (PDF) ─────────────────────────────────────────────────

/// One PDF page per comic page, each image scaled to fit and centred.
pub struct PdfExporter {
    /// Width and height in points.
    pub page_size: (f32, f32),
}

/// Scale `(w, h)` to fit inside `(pw, ph)`, returning `(x, y, w, h)`.
pub fn fit_centered(w: f32, h: f32, pw: f32, ph: f32) -> (f32, f32, f32, f32) {
    let scale = (pw / w).min(ph / h);
    let (dw, dh) = (w * scale, h * scale);
    ((pw - dw) / 2.0, (ph - dh) / 2.0, dw, dh)
}

impl Exporter for PdfExporter {
    fn format(&self) -> OutputFormat {
        OutputFormat::PagedDocument
    }

    fn export(&self, pages: &[PathBuf], meta: &ExportMeta, out_dir: &Path) -> Result<ExportResult, ExportError> {
        require_pages(pages)?;
        let (pw, ph) = self.page_size;
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let mut kids: Vec<Object> = Vec::with_capacity(pages.len());

        for (i, path) in pages.iter().enumerate() {
            let rgb = load_page(i, path)?.to_rgb8();
            let (w, h) = rgb.dimensions();
            let jpeg = encode_jpeg(&rgb, 90).map_err(ExportError::ConverterFailed)?;

            let image_id = doc.add_object(Stream::new(
                dictionary! {
                    "Type" => "XObject",
                    "Subtype" => "Image",
                    "Width" => i64::from(w),
                    "Height" => i64::from(h),
                    "ColorSpace" => "DeviceRGB",
                    "BitsPerComponent" => 8_i64,
                    "Filter" => "DCTDecode",
                },
                jpeg,
            ));

            let (x, y, dw, dh) = fit_centered(w as f32, h as f32, pw, ph);
            let content = Content {
                operations: vec![
                    Operation::new("q", vec![]),
                    Operation::new(
                        "cm",
                        vec![
                            Object::Real(dw as _),
                            Object::Integer(0),
                            Object::Integer(0),
                            Object::Real(dh as _),
                            Object::Real(x as _),
                            Object::Real(y as _),
                        ],
                    ),
                    Operation::new("Do", vec![Object::Name(b"Im0".to_vec())]),
                    Operation::new("Q", vec![]),
                ],
            };
            let encoded = content
                .encode()
                .map_err(|e| ExportError::ConverterFailed(format!("page {}: {e}", i + 1)))?;
            let content_id = doc.add_object(Stream::new(dictionary! {}, encoded));

            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "MediaBox" => vec![
                    Object::Integer(0),
                    Object::Integer(0),
                    Object::Real(pw as _),
                    Object::Real(ph as _),
                ],
                "Contents" => content_id,
                "Resources" => dictionary! {
                    "XObject" => dictionary! { "Im0" => image_id },
                },
            });
            kids.push(page_id.into());
        }

        let count = kids.len() as i64;
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        let info_id = doc.add_object(dictionary! {
            "Title" => pdf_text(&meta.title),
            "Author" => pdf_text(&meta.author),
            "Subject" => pdf_text(&meta.subject),
            "Creator" => pdf_text("doc2comic"),
        });
        doc.trailer.set("Root", catalog_id);
        doc.trailer.set("Info", info_id);

        let dest = out_dir.join(format!("{}.pdf", meta.file_stem()));
        let tmp = NamedTempFile::new_in(out_dir).map_err(|e| write_failed(out_dir, e))?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            doc.save_to(&mut writer).map_err(|e| write_failed(&dest, e))?;
            writer.flush().map_err(|e| write_failed(&dest, e))?;
        }
        let byte_size = persist(tmp, &dest)?;
        debug!("PDF written: {}", dest.display());

        Ok(ExportResult {
            format: self.format(),
            output_location: dest,
            byte_size,
            page_count: pages.len(),
        })
    }
}

/// A PDF text string: UTF-16BE behind a byte-order mark.
fn pdf_text(s: &str) -> Object {
    let mut bytes = vec![0xFE, 0xFF];
    bytes.extend(s.encode_utf16().flat_map(u16::to_be_bytes));
    Object::String(bytes, StringFormat::Hexadecimal)
}

// ── Archive (CBZ) ────────────────────────────────────────────────────────

pub const MANIFEST_NAME: &str = "ComicInfo.txt";

/// Numbered page images plus a plain-text manifest, in a ZIP container.
pub struct ArchiveExporter;

pub fn manifest(meta: &ExportMeta, page_count: usize) -> String {
    format!("Title: {}\nPages: {}\n", meta.title, page_count)
}

impl Exporter for ArchiveExporter {
    fn format(&self) -> OutputFormat {
        OutputFormat::Archive
    }

    fn export(&self, pages: &[PathBuf], meta: &ExportMeta, out_dir: &Path) -> Result<ExportResult, ExportError> {
        require_pages(pages)?;
        let dest = out_dir.join(format!("{}.cbz", meta.file_stem()));
        let tmp = NamedTempFile::new_in(out_dir).map_err(|e| write_failed(out_dir, e))?;
        let file = tmp.reopen().map_err(|e| write_failed(&dest, e))?;

        let mut zip = ZipWriter::new(file);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        for (i, path) in pages.iter().enumerate() {
            let bytes = std::fs::read(path).map_err(|e| ExportError::PageUnreadable {
                page: i + 1,
                path: path.clone(),
                detail: e.to_string(),
            })?;
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("png")
                .to_ascii_lowercase();
            zip.start_file(format!("page_{:03}.{ext}", i + 1), options)
                .map_err(|e| write_failed(&dest, e))?;
            zip.write_all(&bytes).map_err(|e| write_failed(&dest, e))?;
        }
        zip.start_file(MANIFEST_NAME, options)
            .map_err(|e| write_failed(&dest, e))?;
        zip.write_all(manifest(meta, pages.len()).as_bytes())
            .map_err(|e| write_failed(&dest, e))?;
        zip.finish().map_err(|e| write_failed(&dest, e))?;

        let byte_size = persist(tmp, &dest)?;
        Ok(ExportResult {
            format: self.format(),
            output_location: dest,
            byte_size,
            page_count: pages.len(),
        })
    }
}

// ── Gallery (HTML) ───────────────────────────────────────────────────────

/// Web-optimised JPEG pages plus an `index.html` viewer.
pub struct GalleryExporter {
    pub max_width: u32,
}

pub const GALLERY_DIR: &str = "gallery";

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

pub fn gallery_index(meta: &ExportMeta, page_files: &[String]) -> String {
    let title = escape_html(&meta.title);
    let n = page_files.len();
    let mut figures = String::new();
    for (i, file) in page_files.iter().enumerate() {
        figures.push_str(&format!(
            "    <figure class=\"page\">\n      <img src=\"{file}\" alt=\"Page {num}\" loading=\"lazy\">\n      <figcaption>Page {num} of {n}</figcaption>\n    </figure>\n",
            num = i + 1
        ));
    }
    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n  <meta charset=\"utf-8\">\n  <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n  <title>{title}</title>\n  <style>\n    body {{ background: #222; color: #eee; font-family: sans-serif; margin: 0; text-align: center; }}\n    .page img {{ max-width: 100%; height: auto; box-shadow: 0 0 12px #000; }}\n    figure {{ margin: 2em auto; }}\n  </style>\n</head>\n<body>\n  <h1>{title}</h1>\n  <p>by {author}</p>\n{figures}</body>\n</html>\n",
        author = escape_html(&meta.author),
    )
}

impl Exporter for GalleryExporter {
    fn format(&self) -> OutputFormat {
        OutputFormat::Gallery
    }

    fn export(&self, pages: &[PathBuf], meta: &ExportMeta, out_dir: &Path) -> Result<ExportResult, ExportError> {
        require_pages(pages)?;
        let staging = tempfile::Builder::new()
            .prefix(".gallery-")
            .tempdir_in(out_dir)
            .map_err(|e| write_failed(out_dir, e))?;
        let images_dir = staging.path().join("images");
        std::fs::create_dir_all(&images_dir).map_err(|e| write_failed(&images_dir, e))?;

        let mut byte_size = 0u64;
        let mut files = Vec::with_capacity(pages.len());
        for (i, path) in pages.iter().enumerate() {
            let img = load_page(i, path)?;
            let img = if img.width() > self.max_width {
                let h = (u64::from(img.height()) * u64::from(self.max_width) / u64::from(img.width())).max(1) as u32;
                img.resize_exact(self.max_width, h, FilterType::Lanczos3)
            } else {
                img
            };
            let jpeg = encode_jpeg(&flatten_rgb(&img), 85).map_err(ExportError::ConverterFailed)?;
            let name = format!("images/page_{:03}.jpg", i + 1);
            let target = staging.path().join(&name);
            std::fs::write(&target, &jpeg).map_err(|e| write_failed(&target, e))?;
            byte_size += jpeg.len() as u64;
            files.push(name);
        }

        let index = gallery_index(meta, &files);
        let index_path = staging.path().join("index.html");
        File::create(&index_path)
            .and_then(|mut f| f.write_all(index.as_bytes()))
            .map_err(|e| write_failed(&index_path, e))?;
        byte_size += index.len() as u64;

        let dest_dir = out_dir.join(GALLERY_DIR);
        if dest_dir.exists() {
            std::fs::remove_dir_all(&dest_dir).map_err(|e| write_failed(&dest_dir, e))?;
        }
        std::fs::rename(staging.path(), &dest_dir).map_err(|e| write_failed(&dest_dir, e))?;

        Ok(ExportResult {
            format: self.format(),
            output_location: dest_dir.join("index.html"),
            byte_size,
            page_count: pages.len(),
        })
    }
}
