//! Scripted service implementations for tests and offline runs.
//!
//! [`MockTextService::comic`] answers the three content sub-steps with a
//! consistent translation, story and script. [`MockImageService`] renders a
//! solid-colour PNG per panel and can be told to fail panels, report
//! "processing" first, or respond slowly.

use super::{CompletionRequest, ImageOutcome, ImageRequest, ImageService, TaskKind, TextService};
use crate::error::ServiceError;
use async_trait::async_trait;
use image::{ImageFormat, Rgb, RgbImage};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

// ── Text ─────────────────────────────────────────────────────────────────

/// Answers completions from per-task queues. The last queued answer for a
/// task is repeated once the queue would otherwise run dry.
#[derive(Default)]
pub struct MockTextService {
    responses: Mutex<HashMap<TaskKind, VecDeque<Result<String, ServiceError>>>>,
    calls: Mutex<Vec<TaskKind>>,
}

impl MockTextService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Valid answers for every step: `pages` pages of `panels_per_page`
    /// panels about a robot in a desert.
    pub fn comic(title: &str, pages: u32, panels_per_page: u32) -> Self {
        Self::new()
            .respond(TaskKind::Translation, translation_json())
            .respond(TaskKind::Story, story_json(title))
            .respond(TaskKind::Script, script_json(title, pages, panels_per_page))
    }

    pub fn respond(self, task: TaskKind, text: impl Into<String>) -> Self {
        self.push(task, Ok(text.into()))
    }

    pub fn fail(self, task: TaskKind, err: ServiceError) -> Self {
        self.push(task, Err(err))
    }

    /// Replace every queued answer for `task` with `text`.
    pub fn replace(self, task: TaskKind, text: impl Into<String>) -> Self {
        if let Ok(mut map) = self.responses.lock() {
            map.insert(task, VecDeque::from([Ok(text.into())]));
        }
        self
    }

    fn push(self, task: TaskKind, answer: Result<String, ServiceError>) -> Self {
        if let Ok(mut map) = self.responses.lock() {
            map.entry(task).or_default().push_back(answer);
        }
        self
    }

    /// Tasks completed so far, in call order.
    pub fn calls(&self) -> Vec<TaskKind> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl TextService for MockTextService {
    fn name(&self) -> &str {
        "mock-text"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, ServiceError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.task);
        }
        let mut map = self
            .responses
            .lock()
            .map_err(|_| ServiceError::Transport("mock poisoned".into()))?;
        let queue = map
            .get_mut(&request.task)
            .ok_or_else(|| ServiceError::Api(format!("no mock answer for {}", request.task.label())))?;
        match queue.len() {
            0 => Err(ServiceError::Api("mock queue empty".into())),
            1 => queue.front().cloned().unwrap_or_else(|| Err(ServiceError::Api("mock queue empty".into()))),
            _ => queue.pop_front().unwrap_or_else(|| Err(ServiceError::Api("mock queue empty".into()))),
        }
    }
}

pub fn translation_json() -> String {
    serde_json::json!({
        "original_language": "en",
        "target_language": "en",
        "translated_text": "A robot finds a flower in a desert.",
        "adaptations": [],
        "preserved_terms": [],
        "translation_notes": []
    })
    .to_string()
}

pub fn story_json(title: &str) -> String {
    serde_json::json!({
        "title": title,
        "genre": "fable",
        "summary": "A lonely robot discovers a flower and learns to care for it.",
        "themes": ["hope", "care"],
        "characters": [
            {"name": "Unit-7", "description": "a scavenger robot", "traits": ["curious"],
             "appearance": "rusty orange body, one blue eye", "role": "protagonist"}
        ],
        "arcs": ["loneliness to purpose"],
        "narrative_style": "gentle",
        "target_audience": "general",
        "estimated_reading_time": "2 minutes"
    })
    .to_string()
}

/// A script of `pages × panels_per_page` panels, wrapped in a code fence the
/// way chat models often answer.
pub fn script_json(title: &str, pages: u32, panels_per_page: u32) -> String {
    let mut panels = Vec::new();
    let mut n = 0;
    for page in 1..=pages {
        for _ in 0..panels_per_page {
            n += 1;
            panels.push(serde_json::json!({
                "panel_number": n,
                "page_number": page,
                "description": format!("Unit-7 crosses the dunes, scene {n}"),
                "dialogue": [{"character": "Unit-7", "text": format!("Beep {n}.")}],
                "captions": if n == 1 { vec!["The desert was silent."] } else { vec![] },
                "sound_effects": if n % 2 == 0 { vec!["WHIRR"] } else { vec![] },
                "camera_angle": "wide shot",
                "mood": "hopeful",
                "key_elements": ["red flower"]
            }));
        }
    }
    let script = serde_json::json!({
        "title": title,
        "total_pages": pages,
        "total_panels": n,
        "panels": panels,
        "color_palette": ["ochre", "teal"],
        "style_guide": "thick outlines, flat colours",
        "notes": []
    });
    format!("```json\n{}\n```", serde_json::to_string_pretty(&script).unwrap_or_default())
}

// ── Image ────────────────────────────────────────────────────────────────

/// Scripted image service.
pub struct MockImageService {
    fail_panels: HashSet<u32>,
    fail_all: bool,
    processing_polls: u32,
    delay: Box<dyn Fn(u32) -> Duration + Send + Sync>,
    size: (u32, u32),
    polls_seen: Mutex<HashMap<String, u32>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    submissions: AtomicUsize,
}

impl Default for MockImageService {
    fn default() -> Self {
        Self {
            fail_panels: HashSet::new(),
            fail_all: false,
            processing_polls: 0,
            delay: Box::new(|_| Duration::ZERO),
            size: (64, 64),
            polls_seen: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            submissions: AtomicUsize::new(0),
        }
    }
}

impl MockImageService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject these panels with a non-retryable API error.
    pub fn failing_panels(mut self, panels: impl IntoIterator<Item = u32>) -> Self {
        self.fail_panels.extend(panels);
        self
    }

    pub fn failing_all(mut self) -> Self {
        self.fail_all = true;
        self
    }

    /// Report "processing" this many times before a job is ready.
    pub fn processing_for(mut self, polls: u32) -> Self {
        self.processing_polls = polls;
        self
    }

    /// Sleep inside `submit` for `f(panel_number)`.
    pub fn with_delay(mut self, f: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        self.delay = Box::new(f);
        self
    }

    pub fn image_size(mut self, width: u32, height: u32) -> Self {
        self.size = (width, height);
        self
    }

    /// Highest number of concurrently running `submit` calls observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    fn ready_or_processing(&self, panel: u32) -> ImageOutcome {
        if self.processing_polls == 0 {
            ImageOutcome::Ready {
                url: format!("mock://panel/{panel}"),
            }
        } else {
            ImageOutcome::Processing {
                job_id: format!("job-{panel}"),
                eta_secs: Some(1.0),
            }
        }
    }
}

/// Encode a solid-colour PNG.
pub fn solid_png(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb(color));
    let mut buf = Cursor::new(Vec::new());
    match img.write_to(&mut buf, ImageFormat::Png) {
        Ok(()) => buf.into_inner(),
        Err(_) => Vec::new(),
    }
}

#[async_trait]
impl ImageService for MockImageService {
    fn name(&self) -> &str {
        "mock-image"
    }

    async fn submit(&self, request: &ImageRequest) -> Result<ImageOutcome, ServiceError> {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = (self.delay)(request.panel_number);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail_all || self.fail_panels.contains(&request.panel_number) {
            return Err(ServiceError::Api(format!(
                "mock refused panel {}",
                request.panel_number
            )));
        }
        Ok(self.ready_or_processing(request.panel_number))
    }

    async fn poll(&self, job_id: &str) -> Result<ImageOutcome, ServiceError> {
        let panel = job_id
            .strip_prefix("job-")
            .and_then(|n| n.parse::<u32>().ok())
            .ok_or_else(|| ServiceError::Malformed(format!("unknown job '{job_id}'")))?;
        let mut seen = self
            .polls_seen
            .lock()
            .map_err(|_| ServiceError::Transport("mock poisoned".into()))?;
        let count = seen.entry(job_id.to_string()).or_insert(0);
        *count += 1;
        if *count >= self.processing_polls {
            Ok(ImageOutcome::Ready {
                url: format!("mock://panel/{panel}"),
            })
        } else {
            Ok(ImageOutcome::Processing {
                job_id: job_id.to_string(),
                eta_secs: Some(1.0),
            })
        }
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, ServiceError> {
        let panel = url
            .strip_prefix("mock://panel/")
            .and_then(|n| n.parse::<u32>().ok())
            .ok_or_else(|| ServiceError::Malformed(format!("unknown url '{url}'")))?;
        let shade = (panel * 40 % 200) as u8;
        let (w, h) = self.size;
        Ok(solid_png(w, h, [shade, 120, 200 - shade]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImageSettings;

    fn request(panel: u32) -> ImageRequest {
        ImageRequest::new(panel, "p".into(), &ImageSettings::default())
    }

    #[tokio::test]
    async fn text_mock_repeats_last_answer() {
        let svc = MockTextService::new().respond(TaskKind::Story, "a").respond(TaskKind::Story, "b");
        let req = CompletionRequest {
            task: TaskKind::Story,
            system: String::new(),
            prompt: String::new(),
            temperature: 0.0,
            max_tokens: 1,
        };
        assert_eq!(svc.complete(&req).await.unwrap(), "a");
        assert_eq!(svc.complete(&req).await.unwrap(), "b");
        assert_eq!(svc.complete(&req).await.unwrap(), "b");
        assert_eq!(svc.calls().len(), 3);
    }

    #[tokio::test]
    async fn image_mock_processing_then_ready() {
        let svc = MockImageService::new().processing_for(2);
        let job = match svc.submit(&request(4)).await.unwrap() {
            ImageOutcome::Processing { job_id, .. } => job_id,
            other => panic!("unexpected {other:?}"),
        };
        assert!(matches!(svc.poll(&job).await.unwrap(), ImageOutcome::Processing { .. }));
        assert!(matches!(svc.poll(&job).await.unwrap(), ImageOutcome::Ready { .. }));
    }

    #[tokio::test]
    async fn image_mock_downloads_decodable_png() {
        let svc = MockImageService::new().image_size(8, 4);
        let bytes = svc.download("mock://panel/1").await.unwrap();
        let img = image::load_from_memory(&bytes).unwrap();
        assert_eq!((img.width(), img.height()), (8, 4));
    }

    #[test]
    fn canned_script_is_fenced_json() {
        let s = script_json("T", 2, 3);
        assert!(s.starts_with("```json"));
        assert!(s.contains("\"total_panels\": 6"));
    }
}
