//! Data model shared by every pipeline stage.
//!
//! Each entity is produced by exactly one stage and is read-only downstream:
//!
//! ```text
//! ProcessedDocument ─► TranslatedContent ─► StoryStructure ─► ComicScript
//!                                                                 │
//!                       PanelArtwork[] ◄──────── visual ──────────┤
//!                             │                                   │
//!                             └──────► PageLayout[] ◄─── layout ──┘
//!                                           │
//!                                           └──► ComicBook (per format)
//! ```

use crate::config::OutputFormat;
use crate::error::{ComicError, PanelError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

// ── Request ──────────────────────────────────────────────────────────────

/// Where the source material comes from. The two forms are exclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// A document on disk. `.pdf` files go through pdfium, anything else is
    /// read as plain text.
    Pdf(PathBuf),
    /// Raw text supplied inline.
    Text(String),
}

/// Per-request generation choices, threaded unchanged through every stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationOptions {
    pub art_style: String,
    /// Requested page count (1–100). The achieved count may differ.
    pub target_pages: u32,
    pub target_audience: String,
    pub target_language: String,
    pub source_language: Option<String>,
    /// Overrides the title chosen by the story step.
    pub title: Option<String>,
    pub output_formats: BTreeSet<OutputFormat>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            art_style: "cartoon".to_string(),
            target_pages: 20,
            target_audience: "general".to_string(),
            target_language: "en".to_string(),
            source_language: None,
            title: None,
            output_formats: [OutputFormat::PagedDocument].into_iter().collect(),
        }
    }
}

impl GenerationOptions {
    pub const MAX_TARGET_PAGES: u32 = 100;

    pub fn validate(&self) -> Result<(), ComicError> {
        if self.output_formats.is_empty() {
            return Err(ComicError::InvalidRequest(
                "at least one output format is required".into(),
            ));
        }
        if !(1..=Self::MAX_TARGET_PAGES).contains(&self.target_pages) {
            return Err(ComicError::InvalidRequest(format!(
                "target_pages must be between 1 and {}, got {}",
                Self::MAX_TARGET_PAGES,
                self.target_pages
            )));
        }
        if self.art_style.trim().is_empty() {
            return Err(ComicError::InvalidRequest("art_style must not be empty".into()));
        }
        Ok(())
    }

    /// The language the source is assumed to be written in.
    pub fn source_language(&self) -> &str {
        self.source_language.as_deref().unwrap_or("en")
    }
}

/// One generation request: a source plus the options to apply to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub source: Source,
    #[serde(default)]
    pub options: GenerationOptions,
}

impl GenerationRequest {
    pub fn from_text(text: impl Into<String>, options: GenerationOptions) -> Self {
        Self {
            source: Source::Text(text.into()),
            options,
        }
    }

    pub fn from_file(path: impl Into<PathBuf>, options: GenerationOptions) -> Self {
        Self {
            source: Source::Pdf(path.into()),
            options,
        }
    }
}

// ── Intake ───────────────────────────────────────────────────────────────

/// Normalised source text, produced once by intake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedDocument {
    pub content: String,
    pub language: String,
    pub word_count: usize,
    pub metadata: BTreeMap<String, String>,
}

// ── Content ──────────────────────────────────────────────────────────────

/// Output of the translation/adaptation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslatedContent {
    #[serde(default)]
    pub original_language: String,
    #[serde(default)]
    pub target_language: String,
    pub translated_text: String,
    #[serde(default)]
    pub adaptations: Vec<String>,
    #[serde(default)]
    pub preserved_terms: Vec<String>,
    #[serde(default)]
    pub translation_notes: Vec<String>,
}

/// A character's narrative role. Roles outside the three named ones are
/// kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    Protagonist,
    Antagonist,
    Supporting,
    Other(String),
}

impl From<String> for Role {
    fn from(s: String) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "protagonist" => Role::Protagonist,
            "antagonist" => Role::Antagonist,
            "supporting" => Role::Supporting,
            _ => Role::Other(s),
        }
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        match role {
            Role::Protagonist => "protagonist".to_string(),
            Role::Antagonist => "antagonist".to_string(),
            Role::Supporting => "supporting".to_string(),
            Role::Other(s) => s,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub traits: Vec<String>,
    #[serde(default)]
    pub appearance: String,
    pub role: Role,
}

/// Output of the story-structuring step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryStructure {
    pub title: String,
    #[serde(default)]
    pub genre: String,
    pub summary: String,
    #[serde(default)]
    pub themes: Vec<String>,
    pub characters: Vec<Character>,
    #[serde(default)]
    pub arcs: Vec<String>,
    #[serde(default)]
    pub narrative_style: String,
    #[serde(default)]
    pub target_audience: String,
    #[serde(default)]
    pub estimated_reading_time: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogueLine {
    pub character: String,
    pub text: String,
}

/// One narrative unit of the script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Panel {
    pub panel_number: u32,
    pub page_number: u32,
    pub description: String,
    #[serde(default)]
    pub dialogue: Vec<DialogueLine>,
    #[serde(default)]
    pub captions: Vec<String>,
    #[serde(default)]
    pub sound_effects: Vec<String>,
    #[serde(default)]
    pub camera_angle: String,
    #[serde(default)]
    pub mood: String,
    #[serde(default)]
    pub key_elements: Vec<String>,
}

/// Output of the scriptwriting step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComicScript {
    pub title: String,
    #[serde(default)]
    pub total_pages: u32,
    #[serde(default)]
    pub total_panels: u32,
    pub panels: Vec<Panel>,
    #[serde(default)]
    pub color_palette: Vec<String>,
    #[serde(default)]
    pub style_guide: String,
    #[serde(default)]
    pub notes: Vec<String>,
}

impl ComicScript {
    /// Check the numbering rules: panels numbered 1..=n in order, pages
    /// numbered from 1 without gaps, and each page's panels contiguous.
    pub fn validate(&self) -> Result<(), ComicError> {
        if self.panels.is_empty() {
            return Err(ComicError::InvalidScript("script has no panels".into()));
        }

        let mut expected_page = 1;
        let mut seen_pages = BTreeSet::new();
        for (idx, panel) in self.panels.iter().enumerate() {
            let expected_panel = idx as u32 + 1;
            if panel.panel_number != expected_panel {
                return Err(ComicError::InvalidScript(format!(
                    "panel at position {expected_panel} is numbered {}",
                    panel.panel_number
                )));
            }
            if panel.page_number == 0 {
                return Err(ComicError::InvalidScript(format!(
                    "panel {} has page number 0",
                    panel.panel_number
                )));
            }
            if panel.page_number != expected_page {
                if panel.page_number != expected_page + 1 || seen_pages.contains(&panel.page_number) {
                    return Err(ComicError::InvalidScript(format!(
                        "panel {} jumps from page {expected_page} to page {}",
                        panel.panel_number, panel.page_number
                    )));
                }
                expected_page = panel.page_number;
            }
            seen_pages.insert(panel.page_number);
        }
        if !seen_pages.contains(&1) {
            return Err(ComicError::InvalidScript("first panel is not on page 1".into()));
        }
        Ok(())
    }

    /// Recompute the declared counters from the panels and report any
    /// disagreement. Returns the warnings produced.
    pub fn reconcile_counts(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();
        let panels = self.panels.len() as u32;
        let pages = self.pages().len() as u32;
        if self.total_panels != panels {
            warnings.push(format!(
                "script declared {} panels but contains {panels}",
                self.total_panels
            ));
            self.total_panels = panels;
        }
        if self.total_pages != pages {
            warnings.push(format!(
                "script declared {} pages but its panels cover {pages}",
                self.total_pages
            ));
            self.total_pages = pages;
        }
        warnings
    }

    /// Panels grouped by page, in page order.
    pub fn pages(&self) -> Vec<(u32, &[Panel])> {
        let mut out: Vec<(u32, &[Panel])> = Vec::new();
        let mut start = 0;
        for i in 1..=self.panels.len() {
            if i == self.panels.len() || self.panels[i].page_number != self.panels[start].page_number {
                out.push((self.panels[start].page_number, &self.panels[start..i]));
                start = i;
            }
        }
        out
    }

    /// Names of every character appearing in dialogue, in first-seen order.
    pub fn speaking_characters(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        self.panels
            .iter()
            .flat_map(|p| p.dialogue.iter())
            .filter(|d| seen.insert(d.character.as_str()))
            .map(|d| d.character.as_str())
            .collect()
    }
}

// ── Visual ───────────────────────────────────────────────────────────────

/// What was sent to the image service for one panel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub model: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub guidance_scale: f32,
    pub negative_prompt: String,
    pub seed: Option<u64>,
    /// Submission attempts used (1 = first try succeeded).
    pub attempts: u32,
    /// Status polls used while the job was processing.
    pub polls: u32,
}

/// The illustration for one panel. Degraded when `image_path` is `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelArtwork {
    pub panel_number: u32,
    pub page_number: u32,
    pub image_path: Option<PathBuf>,
    pub prompt_used: String,
    pub generation_params: GenerationParams,
    /// 100 for delivered artwork, 0 for a placeholder.
    pub quality_score: f32,
    pub error: Option<PanelError>,
}

impl PanelArtwork {
    pub fn is_degraded(&self) -> bool {
        self.image_path.is_none()
    }
}

// ── Layout ───────────────────────────────────────────────────────────────

/// An axis-aligned rectangle in page pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PanelRect {
    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    /// True when the two rectangles share any interior area.
    pub fn overlaps(&self, other: &PanelRect) -> bool {
        self.x < other.right() && other.x < self.right() && self.y < other.bottom() && other.y < self.bottom()
    }

    pub fn contains(&self, other: &PanelRect) -> bool {
        other.x >= self.x && other.y >= self.y && other.right() <= self.right() && other.bottom() <= self.bottom()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextKind {
    Dialogue,
    Caption,
    SoundEffect,
}

/// A piece of text overlaid on a panel. `x`/`y` are relative to the panel
/// rectangle's top-left corner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextElement {
    pub kind: TextKind,
    pub panel_number: u32,
    pub x: u32,
    pub y: u32,
    pub text: String,
}

/// One composed page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageLayout {
    pub page_number: u32,
    pub panel_positions: Vec<PanelRect>,
    pub text_elements: Vec<TextElement>,
    pub rendered_page: PathBuf,
    /// Panels drawn as placeholders on this page.
    pub degraded_panels: Vec<u32>,
}

// ── Export ───────────────────────────────────────────────────────────────

/// What one converter produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportResult {
    pub format: OutputFormat,
    pub output_location: PathBuf,
    pub byte_size: u64,
    pub page_count: usize,
}

/// Terminal entity, one per successfully exported format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComicBook {
    pub title: String,
    pub author: String,
    pub pages: Vec<PathBuf>,
    pub total_pages: usize,
    pub format: OutputFormat,
    pub file_size: u64,
    pub output_location: PathBuf,
}

/// Everything a completed job reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub job_id: String,
    pub title: String,
    pub comic_books: Vec<ComicBook>,
    /// Formats that failed while others succeeded.
    pub export_failures: Vec<(OutputFormat, String)>,
    pub pages: Vec<PageLayout>,
    pub script: ComicScript,
    pub requested_pages: u32,
    pub actual_pages: u32,
    pub degraded_panels: Vec<u32>,
    pub warnings: Vec<String>,
    pub duration_ms: u64,
}

impl GenerationResult {
    pub fn book(&self, format: OutputFormat) -> Option<&ComicBook> {
        self.comic_books.iter().find(|b| b.format == format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn panel(n: u32, page: u32) -> Panel {
        Panel {
            panel_number: n,
            page_number: page,
            description: format!("panel {n}"),
            dialogue: vec![],
            captions: vec![],
            sound_effects: vec![],
            camera_angle: String::new(),
            mood: String::new(),
            key_elements: vec![],
        }
    }

    fn script(pages: &[u32]) -> ComicScript {
        ComicScript {
            title: "T".into(),
            total_pages: 0,
            total_panels: 0,
            panels: pages
                .iter()
                .enumerate()
                .map(|(i, &p)| panel(i as u32 + 1, p))
                .collect(),
            color_palette: vec![],
            style_guide: String::new(),
            notes: vec![],
        }
    }

    #[test]
    fn valid_script_groups_pages() {
        let s = script(&[1, 1, 2, 2, 2, 3]);
        s.validate().unwrap();
        let pages = s.pages();
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[1].0, 2);
        assert_eq!(pages[1].1.len(), 3);
        let total: usize = pages.iter().map(|(_, p)| p.len()).sum();
        assert_eq!(total, s.panels.len());
    }

    #[test]
    fn rejects_non_contiguous_pages() {
        assert!(script(&[1, 2, 1]).validate().is_err());
        assert!(script(&[1, 3]).validate().is_err());
        assert!(script(&[2, 2]).validate().is_err());
        assert!(script(&[0]).validate().is_err());
        assert!(script(&[]).validate().is_err());
    }

    #[test]
    fn rejects_misnumbered_panels() {
        let mut s = script(&[1, 1]);
        s.panels[1].panel_number = 5;
        assert!(matches!(s.validate(), Err(ComicError::InvalidScript(_))));
    }

    #[test]
    fn reconcile_counts_overrides_declared_values() {
        let mut s = script(&[1, 1, 2]);
        s.total_panels = 10;
        s.total_pages = 5;
        let warnings = s.reconcile_counts();
        assert_eq!(s.total_panels, 3);
        assert_eq!(s.total_pages, 2);
        assert_eq!(warnings.len(), 2);

        assert!(s.reconcile_counts().is_empty());
    }

    #[test]
    fn rect_overlap_and_containment() {
        let a = PanelRect { x: 0, y: 0, width: 10, height: 10 };
        let b = PanelRect { x: 10, y: 0, width: 10, height: 10 };
        let c = PanelRect { x: 5, y: 5, width: 10, height: 10 };
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        let outer = PanelRect { x: 0, y: 0, width: 20, height: 20 };
        assert!(outer.contains(&c));
        assert!(!a.contains(&c));
    }

    #[test]
    fn options_validation() {
        let mut o = GenerationOptions::default();
        o.validate().unwrap();
        o.output_formats.clear();
        assert!(o.validate().is_err());
        let o = GenerationOptions { target_pages: 0, ..Default::default() };
        assert!(o.validate().is_err());
        let o = GenerationOptions { target_pages: 101, ..Default::default() };
        assert!(o.validate().is_err());
    }

    #[test]
    fn unlisted_role_is_kept_verbatim() {
        let c: Character = serde_json::from_str(r#"{"name":"Bo","role":"mentor"}"#).unwrap();
        assert_eq!(c.role, Role::Other("mentor".into()));
        let back = serde_json::to_value(&c).unwrap();
        assert_eq!(back["role"], "mentor");

        let c: Character = serde_json::from_str(r#"{"name":"Al","role":"Protagonist"}"#).unwrap();
        assert_eq!(c.role, Role::Protagonist);
        assert!(serde_json::from_str::<Character>(r#"{"name":"Cy","role":3}"#).is_err());
    }

    #[test]
    fn source_serialises_as_tagged_union() {
        let s = Source::Text("hi".into());
        assert_eq!(serde_json::to_string(&s).unwrap(), r#"{"text":"hi"}"#);
        let p: Source = serde_json::from_str(r#"{"pdf":"a.pdf"}"#).unwrap();
        assert_eq!(p, Source::Pdf(PathBuf::from("a.pdf")));
    }
}
