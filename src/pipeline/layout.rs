//! Layout engine: place panels on a page and render the composed image.
//!
//! ## Geometry
//!
//! [`GridLayout`] is the only policy. The interior (page minus margin) is
//! split into `cols × rows` cells with `cols = 2` when the page has more than
//! one panel, else 1, and `rows = ceil(n / cols)`. Cells are separated by the
//! gutter and filled in reading order; trailing cells stay empty. When the
//! gutters alone would not fit the interior they collapse to zero so every
//! rectangle stays inside the page.
//!
//! ## Text
//!
//! Text elements are anchored relative to their panel's rectangle. The
//! engine only draws the container around each measured text extent
//! (ellipse balloon, caption box, outlined sound effect). It does not move
//! elements that collide with each other.
//!
//! Rendering is CPU-bound and runs on a blocking thread per page.

use crate::config::LayoutConfig;
use crate::error::ComicError;
use crate::model::{ComicScript, Panel, PanelArtwork, PanelRect, PageLayout, TextElement, TextKind};
use crate::progress::Observer;
use ab_glyph::{FontVec, PxScale};
use image::{imageops, ImageFormat, Rgb, RgbImage};
use imageproc::drawing::{
    draw_filled_ellipse_mut, draw_filled_rect_mut, draw_hollow_ellipse_mut, draw_hollow_rect_mut, draw_text_mut,
    text_size,
};
use imageproc::rect::Rect;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const BLACK: Rgb<u8> = Rgb([0, 0, 0]);
const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
const CAPTION_FILL: Rgb<u8> = Rgb([255, 255, 200]);
const SFX_FILL: Rgb<u8> = Rgb([255, 255, 0]);
const PLACEHOLDER_FILL: Rgb<u8> = Rgb([220, 220, 220]);
const PLACEHOLDER_OUTLINE: Rgb<u8> = Rgb([128, 128, 128]);

const BORDER_PX: u32 = 2;
const BALLOON_PADDING: u32 = 10;
const CAPTION_PADDING: u32 = 5;
const TEXT_INSET: u32 = 10;

const DIALOGUE_SCALE: f32 = 20.0;
const CAPTION_SCALE: f32 = 18.0;
const SFX_SCALE: f32 = 36.0;

/// Common font locations probed when no font path is configured.
pub const FONT_CANDIDATES: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans-Bold.ttf",
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Bold.ttf",
    "/Library/Fonts/Arial.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

// ── Policy ───────────────────────────────────────────────────────────────

/// Computes panel rectangles for one page.
pub trait LayoutPolicy: Send + Sync {
    fn name(&self) -> &str;

    /// One rectangle per panel, in reading order.
    fn place(&self, panel_count: usize, config: &LayoutConfig) -> Vec<PanelRect>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GridLayout;

impl LayoutPolicy for GridLayout {
    fn name(&self) -> &str {
        "grid"
    }

    fn place(&self, panel_count: usize, config: &LayoutConfig) -> Vec<PanelRect> {
        grid_rects(panel_count, config)
    }
}

/// Grid placement for `n` panels.
pub fn grid_rects(n: usize, config: &LayoutConfig) -> Vec<PanelRect> {
    if n == 0 {
        return Vec::new();
    }
    let n = n as u32;
    let cols: u32 = if n > 1 { 2 } else { 1 };
    let rows = n.div_ceil(cols);

    let interior_w = config.page_width.saturating_sub(2 * config.margin);
    let interior_h = config.page_height.saturating_sub(2 * config.margin);

    let gutter_x = fitting_gutter(config.gutter, cols, interior_w);
    let gutter_y = fitting_gutter(config.gutter, rows, interior_h);

    let cell_w = (interior_w - gutter_x * (cols - 1)) / cols;
    let cell_h = (interior_h - gutter_y * (rows - 1)) / rows;

    (0..n)
        .map(|i| {
            let col = i % cols;
            let row = i / cols;
            PanelRect {
                x: config.margin + col * (cell_w + gutter_x),
                y: config.margin + row * (cell_h + gutter_y),
                width: cell_w,
                height: cell_h,
            }
        })
        .collect()
}

fn fitting_gutter(gutter: u32, cells: u32, span: u32) -> u32 {
    let needed = gutter.saturating_mul(cells.saturating_sub(1));
    if needed < span {
        gutter
    } else {
        0
    }
}

// ── Text anchoring ───────────────────────────────────────────────────────

/// Default anchors for a panel's text, relative to its rectangle: captions
/// stacked from the top-left, dialogue below them, sound effects in the
/// lower right.
pub fn text_elements(panel: &Panel, rect: &PanelRect) -> Vec<TextElement> {
    let mut out = Vec::new();
    let mut y = TEXT_INSET;
    for caption in &panel.captions {
        out.push(TextElement {
            kind: TextKind::Caption,
            panel_number: panel.panel_number,
            x: TEXT_INSET,
            y,
            text: caption.clone(),
        });
        y += CAPTION_SCALE as u32 + 2 * CAPTION_PADDING + 6;
    }
    y += BALLOON_PADDING;
    for line in &panel.dialogue {
        out.push(TextElement {
            kind: TextKind::Dialogue,
            panel_number: panel.panel_number,
            x: TEXT_INSET + BALLOON_PADDING,
            y,
            text: format!("{}: {}", line.character, line.text),
        });
        y += DIALOGUE_SCALE as u32 * 2 + 2 * BALLOON_PADDING + 6;
    }
    for (i, sfx) in panel.sound_effects.iter().enumerate() {
        let offset = (i as u32 + 1) * (SFX_SCALE as u32 + 8);
        out.push(TextElement {
            kind: TextKind::SoundEffect,
            panel_number: panel.panel_number,
            x: rect.width * 3 / 5,
            y: rect.height.saturating_sub(offset + TEXT_INSET),
            text: sfx.clone(),
        });
    }
    out
}

// ── Rendering ────────────────────────────────────────────────────────────

/// Load the configured font, or the first readable candidate.
pub fn load_font(path: Option<&Path>) -> Option<FontVec> {
    let candidates: Vec<PathBuf> = match path {
        Some(p) => vec![p.to_path_buf()],
        None => FONT_CANDIDATES.iter().map(PathBuf::from).collect(),
    };
    for candidate in candidates {
        if let Ok(bytes) = std::fs::read(&candidate) {
            match FontVec::try_from_vec(bytes) {
                Ok(font) => {
                    debug!("Using font {}", candidate.display());
                    return Some(font);
                }
                Err(e) => warn!("Font {} unusable: {}", candidate.display(), e),
            }
        }
    }
    warn!("No usable font found; text overlays will show their containers only");
    None
}

/// Places and renders pages.
pub struct LayoutEngine {
    policy: Box<dyn LayoutPolicy>,
    config: LayoutConfig,
    font: Option<FontVec>,
}

impl LayoutEngine {
    pub fn new(config: LayoutConfig, font: Option<FontVec>) -> Self {
        Self {
            policy: Box::new(GridLayout),
            config,
            font,
        }
    }

    pub fn with_policy(mut self, policy: Box<dyn LayoutPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn config(&self) -> &LayoutConfig {
        &self.config
    }

    /// Compose every page of the script, in page order.
    pub async fn compose_all(
        self: &Arc<Self>,
        job_id: &str,
        script: &ComicScript,
        artworks: &[PanelArtwork],
        pages_dir: &Path,
        observer: &Observer,
    ) -> Result<Vec<PageLayout>, ComicError> {
        tokio::fs::create_dir_all(pages_dir)
            .await
            .map_err(|e| ComicError::io(pages_dir, e))?;

        let by_panel: HashMap<u32, &PanelArtwork> = artworks.iter().map(|a| (a.panel_number, a)).collect();
        let pages = script.pages();
        let total = pages.len();
        let mut layouts = Vec::with_capacity(total);

        for (page_number, panels) in pages {
            let panels = panels.to_vec();
            let page_art: Vec<Option<PanelArtwork>> = panels
                .iter()
                .map(|p| by_panel.get(&p.panel_number).map(|a| (*a).clone()))
                .collect();
            let out = pages_dir.join(format!("page_{page_number:03}.png"));
            let engine = Arc::clone(self);
            let layout = tokio::task::spawn_blocking(move || engine.render_page(page_number, &panels, &page_art, &out))
                .await
                .map_err(|e| ComicError::Internal(format!("Layout task panicked: {e}")))??;
            observer.on_page_rendered(job_id, page_number, total);
            layouts.push(layout);
        }
        info!("Composed {} page(s) with the {} policy", layouts.len(), self.policy.name());
        Ok(layouts)
    }

    /// Render one page. `artworks[i]` belongs to `panels[i]`; `None` or a
    /// degraded artwork is drawn as a placeholder.
    pub fn render_page(
        &self,
        page_number: u32,
        panels: &[Panel],
        artworks: &[Option<PanelArtwork>],
        out_path: &Path,
    ) -> Result<PageLayout, ComicError> {
        let rects = self.policy.place(panels.len(), &self.config);
        let mut canvas = RgbImage::from_pixel(
            self.config.page_width,
            self.config.page_height,
            Rgb(self.config.background),
        );

        let mut degraded = Vec::new();
        let mut elements = Vec::new();
        for (i, (panel, rect)) in panels.iter().zip(&rects).enumerate() {
            let art = artworks.get(i).and_then(Option::as_ref);
            let drawn = match art.and_then(|a| a.image_path.as_deref()) {
                Some(path) => self.draw_artwork(&mut canvas, rect, path, panel.panel_number),
                None => false,
            };
            if !drawn {
                draw_placeholder(&mut canvas, rect);
                degraded.push(panel.panel_number);
            }
            draw_border(&mut canvas, rect);

            let panel_text = text_elements(panel, rect);
            for element in &panel_text {
                self.draw_text_element(&mut canvas, rect, element);
            }
            elements.extend(panel_text);
        }

        canvas
            .save_with_format(out_path, ImageFormat::Png)
            .map_err(|e| ComicError::Io {
                path: out_path.to_path_buf(),
                source: std::io::Error::other(e.to_string()),
            })?;
        debug!(
            "Page {}: {} panel(s), {} placeholder(s)",
            page_number,
            rects.len(),
            degraded.len()
        );

        Ok(PageLayout {
            page_number,
            panel_positions: rects,
            text_elements: elements,
            rendered_page: out_path.to_path_buf(),
            degraded_panels: degraded,
        })
    }

    fn draw_artwork(&self, canvas: &mut RgbImage, rect: &PanelRect, path: &Path, panel: u32) -> bool {
        if rect.width == 0 || rect.height == 0 {
            return true;
        }
        match image::open(path) {
            Ok(img) => {
                let fitted = img
                    .resize_exact(rect.width, rect.height, imageops::FilterType::Triangle)
                    .to_rgb8();
                imageops::overlay(canvas, &fitted, i64::from(rect.x), i64::from(rect.y));
                true
            }
            Err(e) => {
                warn!("Panel {}: artwork unreadable ({}), drawing placeholder", panel, e);
                false
            }
        }
    }

    fn measure(&self, scale: f32, text: &str) -> (u32, u32) {
        match &self.font {
            Some(font) => text_size(PxScale::from(scale), font, text),
            None => ((text.chars().count() as f32 * scale * 0.55) as u32, scale as u32),
        }
    }

    fn draw_text_element(&self, canvas: &mut RgbImage, rect: &PanelRect, element: &TextElement) {
        let x = (rect.x + element.x) as i32;
        let y = (rect.y + element.y) as i32;
        match element.kind {
            TextKind::Dialogue => {
                let max_w = rect.width.saturating_sub(element.x + 2 * BALLOON_PADDING + TEXT_INSET).max(40);
                let lines = self.wrap(DIALOGUE_SCALE, &element.text, max_w);
                let (w, h) = self.block_size(DIALOGUE_SCALE, &lines);
                let cx = x + (w / 2) as i32;
                let cy = y + (h / 2) as i32;
                // An ellipse needs ~√2 the box half-extent to enclose it.
                let rw = ((w as f32 / 2.0) * 1.42) as i32 + BALLOON_PADDING as i32;
                let rh = ((h as f32 / 2.0) * 1.42) as i32 + BALLOON_PADDING as i32;
                draw_filled_ellipse_mut(canvas, (cx, cy), rw, rh, WHITE);
                draw_hollow_ellipse_mut(canvas, (cx, cy), rw, rh, BLACK);
                self.draw_lines(canvas, x, y, DIALOGUE_SCALE, &lines, BLACK);
            }
            TextKind::Caption => {
                let max_w = rect.width.saturating_sub(element.x + 2 * CAPTION_PADDING + TEXT_INSET).max(40);
                let lines = self.wrap(CAPTION_SCALE, &element.text, max_w);
                let (w, h) = self.block_size(CAPTION_SCALE, &lines);
                let pad = CAPTION_PADDING as i32;
                let box_w = w + 2 * CAPTION_PADDING;
                let box_h = h + 2 * CAPTION_PADDING;
                if box_w > 0 && box_h > 0 {
                    let frame = Rect::at(x - pad, y - pad).of_size(box_w, box_h);
                    draw_filled_rect_mut(canvas, frame, CAPTION_FILL);
                    draw_hollow_rect_mut(canvas, frame, BLACK);
                }
                self.draw_lines(canvas, x, y, CAPTION_SCALE, &lines, BLACK);
            }
            TextKind::SoundEffect => {
                if let Some(font) = &self.font {
                    let scale = PxScale::from(SFX_SCALE);
                    for (dx, dy) in [(-2, -2), (2, -2), (-2, 2), (2, 2), (0, 2), (2, 0), (-2, 0), (0, -2)] {
                        draw_text_mut(canvas, BLACK, x + dx, y + dy, scale, font, &element.text);
                    }
                    draw_text_mut(canvas, SFX_FILL, x, y, scale, font, &element.text);
                }
            }
        }
    }

    fn draw_lines(&self, canvas: &mut RgbImage, x: i32, y: i32, scale: f32, lines: &[String], color: Rgb<u8>) {
        if let Some(font) = &self.font {
            let line_h = scale as i32 + 2;
            for (i, line) in lines.iter().enumerate() {
                draw_text_mut(canvas, color, x, y + i as i32 * line_h, PxScale::from(scale), font, line);
            }
        }
    }

    fn block_size(&self, scale: f32, lines: &[String]) -> (u32, u32) {
        let width = lines.iter().map(|l| self.measure(scale, l).0).max().unwrap_or(0);
        let height = lines.len() as u32 * (scale as u32 + 2);
        (width, height)
    }

    /// Greedy word wrap to `max_width` pixels.
    fn wrap(&self, scale: f32, text: &str, max_width: u32) -> Vec<String> {
        let mut lines = Vec::new();
        let mut current = String::new();
        for word in text.split_whitespace() {
            let candidate = if current.is_empty() {
                word.to_string()
            } else {
                format!("{current} {word}")
            };
            if !current.is_empty() && self.measure(scale, &candidate).0 > max_width {
                lines.push(std::mem::replace(&mut current, word.to_string()));
            } else {
                current = candidate;
            }
        }
        if !current.is_empty() {
            lines.push(current);
        }
        lines
    }
}

fn draw_placeholder(canvas: &mut RgbImage, rect: &PanelRect) {
    if rect.width == 0 || rect.height == 0 {
        return;
    }
    let r = Rect::at(rect.x as i32, rect.y as i32).of_size(rect.width, rect.height);
    draw_filled_rect_mut(canvas, r, PLACEHOLDER_FILL);
    draw_hollow_rect_mut(canvas, r, PLACEHOLDER_OUTLINE);
}

fn draw_border(canvas: &mut RgbImage, rect: &PanelRect) {
    for inset in 0..BORDER_PX {
        let w = rect.width.saturating_sub(2 * inset);
        let h = rect.height.saturating_sub(2 * inset);
        if w == 0 || h == 0 {
            return;
        }
        let r = Rect::at((rect.x + inset) as i32, (rect.y + inset) as i32).of_size(w, h);
        draw_hollow_rect_mut(canvas, r, BLACK);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DialogueLine, GenerationParams};
    use crate::services::mock::solid_png;

    fn interior(c: &LayoutConfig) -> PanelRect {
        PanelRect {
            x: c.margin,
            y: c.margin,
            width: c.page_width - 2 * c.margin,
            height: c.page_height - 2 * c.margin,
        }
    }

    fn assert_valid(rects: &[PanelRect], c: &LayoutConfig) {
        let inner = interior(c);
        for (i, a) in rects.iter().enumerate() {
            assert!(inner.contains(a), "rect {i} {a:?} escapes interior {inner:?}");
            for b in &rects[i + 1..] {
                assert!(!a.overlaps(b), "{a:?} overlaps {b:?}");
            }
        }
    }

    #[test]
    fn single_panel_fills_interior() {
        let c = LayoutConfig::default();
        let rects = grid_rects(1, &c);
        assert_eq!(rects, vec![interior(&c)]);
    }

    #[test]
    fn grid_properties_hold_for_many_counts() {
        let configs = [
            LayoutConfig::default(),
            LayoutConfig { page_width: 300, page_height: 400, margin: 10, gutter: 30, ..Default::default() },
            LayoutConfig { page_width: 1000, page_height: 120, margin: 5, gutter: 20, ..Default::default() },
        ];
        for c in &configs {
            for n in 1..=40 {
                let rects = grid_rects(n, c);
                assert_eq!(rects.len(), n);
                assert_valid(&rects, c);
            }
        }
    }

    #[test]
    fn reading_order_is_left_to_right_top_to_bottom() {
        let rects = grid_rects(3, &LayoutConfig::default());
        assert_eq!(rects[0].y, rects[1].y);
        assert!(rects[0].x < rects[1].x);
        assert!(rects[2].y > rects[0].y);
        assert_eq!(rects[2].x, rects[0].x);
    }

    #[test]
    fn default_geometry_matches_expected_cells() {
        // 1200×1600, margin 50, gutter 20 → interior 1100×1500.
        let rects = grid_rects(4, &LayoutConfig::default());
        assert_eq!(rects[0], PanelRect { x: 50, y: 50, width: 540, height: 740 });
        assert_eq!(rects[3], PanelRect { x: 610, y: 810, width: 540, height: 740 });
    }

    fn panel(n: u32) -> Panel {
        Panel {
            panel_number: n,
            page_number: 1,
            description: String::new(),
            dialogue: vec![DialogueLine { character: "Unit-7".into(), text: "Beep.".into() }],
            captions: vec!["Meanwhile".into()],
            sound_effects: vec!["WHIRR".into()],
            camera_angle: String::new(),
            mood: String::new(),
            key_elements: vec![],
        }
    }

    fn artwork(n: u32, path: Option<PathBuf>) -> PanelArtwork {
        PanelArtwork {
            panel_number: n,
            page_number: 1,
            image_path: path,
            prompt_used: String::new(),
            generation_params: GenerationParams {
                model: "m".into(),
                width: 8,
                height: 8,
                steps: 1,
                guidance_scale: 1.0,
                negative_prompt: String::new(),
                seed: None,
                attempts: 1,
                polls: 0,
            },
            quality_score: 100.0,
            error: None,
        }
    }

    #[test]
    fn text_anchors_are_inside_panel() {
        let rect = PanelRect { x: 0, y: 0, width: 540, height: 740 };
        let els = text_elements(&panel(1), &rect);
        assert_eq!(els.len(), 3);
        assert!(els.iter().all(|e| e.x < rect.width && e.y < rect.height));
        assert_eq!(els[0].kind, TextKind::Caption);
        assert_eq!(els[1].text, "Unit-7: Beep.");
    }

    #[test]
    fn degraded_panel_renders_placeholder_in_position() {
        let dir = tempfile::tempdir().unwrap();
        let art_path = dir.path().join("a.png");
        std::fs::write(&art_path, solid_png(16, 16, [255, 0, 0])).unwrap();

        let config = LayoutConfig { page_width: 400, page_height: 600, margin: 20, gutter: 10, ..Default::default() };
        let engine = LayoutEngine::new(config, None);
        let panels: Vec<Panel> = (1..=5).map(panel).collect();
        let arts: Vec<Option<PanelArtwork>> = (1..=5)
            .map(|n| Some(artwork(n, if n == 3 { None } else { Some(art_path.clone()) })))
            .collect();
        let out = dir.path().join("page_001.png");
        let layout = engine.render_page(1, &panels, &arts, &out).unwrap();

        assert_eq!(layout.panel_positions.len(), 5);
        assert_eq!(layout.degraded_panels, vec![3]);

        let img = image::open(&out).unwrap().to_rgb8();
        assert_eq!((img.width(), img.height()), (400, 600));
        let r3 = layout.panel_positions[2];
        let r1 = layout.panel_positions[0];
        // Sample near the bottom-left, clear of text overlays.
        let p3 = img.get_pixel(r3.x + 6, r3.bottom() - 6);
        let p1 = img.get_pixel(r1.x + 6, r1.bottom() - 6);
        assert_eq!(*p3, PLACEHOLDER_FILL);
        assert_eq!(*p1, Rgb([255, 0, 0]));
    }

    #[test]
    fn missing_artwork_file_falls_back_to_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let config = LayoutConfig { page_width: 300, page_height: 300, margin: 10, gutter: 10, ..Default::default() };
        let engine = LayoutEngine::new(config, None);
        let arts = vec![Some(artwork(1, Some(dir.path().join("gone.png"))))];
        let layout = engine
            .render_page(1, &[panel(1)], &arts, &dir.path().join("p.png"))
            .unwrap();
        assert_eq!(layout.degraded_panels, vec![1]);
    }

    #[test]
    fn wrap_splits_long_dialogue() {
        let engine = LayoutEngine::new(LayoutConfig::default(), None);
        let lines = engine.wrap(20.0, "one two three four five six seven eight", 60);
        assert!(lines.len() > 1);
        assert_eq!(lines.join(" "), "one two three four five six seven eight");
    }
}
