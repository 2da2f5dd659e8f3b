//! Visual stage: one illustration request per panel, fanned out and back in.
//!
//! ## Concurrency
//!
//! Panel futures run through `buffer_unordered(max_parallel_panels)`, and
//! every in-flight request additionally holds a permit from the
//! process-wide [`Semaphore`] shared by all jobs, so concurrent jobs cannot
//! multiply the upstream load. A permit is held from submission until the
//! bytes are downloaded (including any polling in between), and is released
//! on completion, failure or cancellation (drop).
//!
//! ## Partial failure
//!
//! A panel that fails, or is still "processing" after
//! `max_poll_attempts` polls, becomes a degraded [`PanelArtwork`] carrying
//! its [`PanelError`]. The batch only fails when no panel produced artwork.
//! Results are sorted by `panel_number` whatever the completion order.

use crate::config::{GenerationConfig, ImageSettings};
use crate::error::{ComicError, PanelError, ServiceError};
use crate::model::{ComicScript, GenerationOptions, GenerationParams, Panel, PanelArtwork, StoryStructure};
use crate::progress::Observer;
use crate::prompts::illustration_prompt;
use crate::services::{
    poll_delay, retry_with_backoff, ImageOutcome, ImageRequest, ImageService, RetryExhausted, RetryPolicy,
};
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Script-wide context mixed into every panel prompt so independently
/// generated panels stay visually coherent.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SharedContext {
    pub art_style: String,
    pub color_palette: Vec<String>,
    pub characters: Vec<String>,
    pub style_guide: String,
}

impl SharedContext {
    /// Characters come from the story when available, else from whoever
    /// speaks in the script.
    pub fn new(script: &ComicScript, story: Option<&StoryStructure>, options: &GenerationOptions) -> Self {
        let characters = match story {
            Some(s) if !s.characters.is_empty() => s.characters.iter().map(|c| c.name.clone()).collect(),
            _ => script.speaking_characters().into_iter().map(str::to_string).collect(),
        };
        Self {
            art_style: options.art_style.clone(),
            color_palette: script.color_palette.clone(),
            characters,
            style_guide: script.style_guide.clone(),
        }
    }
}

pub struct VisualStage {
    images: Arc<dyn ImageService>,
    pool: Arc<Semaphore>,
    settings: ImageSettings,
    policy: RetryPolicy,
    concurrency: usize,
    max_poll_attempts: u32,
    poll_backoff_ms: u64,
}

struct Delivered {
    bytes: Vec<u8>,
    attempts: u32,
    polls: u32,
}

impl VisualStage {
    pub fn new(images: Arc<dyn ImageService>, pool: Arc<Semaphore>, config: &GenerationConfig) -> Self {
        Self {
            images,
            pool,
            settings: config.image.clone(),
            policy: RetryPolicy::from_config(config),
            concurrency: config.max_parallel_panels.max(1),
            max_poll_attempts: config.max_poll_attempts,
            poll_backoff_ms: config.poll_backoff_ms,
        }
    }

    /// Generate artwork for every panel, in `panel_number` order.
    pub async fn generate_all(
        &self,
        job_id: &str,
        panels: &[Panel],
        ctx: &SharedContext,
        panels_dir: &Path,
        observer: &Observer,
    ) -> Result<Vec<PanelArtwork>, ComicError> {
        tokio::fs::create_dir_all(panels_dir)
            .await
            .map_err(|e| ComicError::io(panels_dir, e))?;

        let total = panels.len();
        info!("Generating artwork for {} panels ({} in flight max)", total, self.concurrency);

        let mut artworks: Vec<PanelArtwork> = stream::iter(panels.iter().cloned().map(|panel| async move {
            let artwork = self.generate_one(&panel, ctx, panels_dir).await;
            observer.on_panel_complete(job_id, artwork.panel_number, total, artwork.is_degraded());
            artwork
        }))
        .buffer_unordered(self.concurrency)
        .collect()
        .await;

        artworks.sort_by_key(|a| a.panel_number);

        let degraded = artworks.iter().filter(|a| a.is_degraded()).count();
        if degraded == total && total > 0 {
            let first_error = artworks
                .iter()
                .find_map(|a| a.error.as_ref().map(|e| e.to_string()))
                .unwrap_or_else(|| "unknown error".to_string());
            return Err(ComicError::AllPanelsFailed { total, first_error });
        }
        if degraded > 0 {
            warn!("{}/{} panels degraded to placeholders", degraded, total);
        }
        Ok(artworks)
    }

    async fn generate_one(&self, panel: &Panel, ctx: &SharedContext, panels_dir: &Path) -> PanelArtwork {
        let prompt = illustration_prompt(panel, ctx);
        let request = ImageRequest::new(panel.panel_number, prompt.clone(), &self.settings);
        let mut params = GenerationParams {
            model: request.model.clone(),
            width: request.width,
            height: request.height,
            steps: request.steps,
            guidance_scale: request.guidance_scale,
            negative_prompt: request.negative_prompt.clone(),
            seed: request.seed,
            attempts: 0,
            polls: 0,
        };

        let outcome = self.request_image(&request).await;
        let stored = match outcome {
            Ok(delivered) => {
                params.attempts = delivered.attempts;
                params.polls = delivered.polls;
                let path = panels_dir.join(format!("panel_{:03}.png", panel.panel_number));
                store_artwork(panel.panel_number, delivered.bytes, path).await
            }
            Err(e) => Err(e),
        };

        match stored {
            Ok(path) => {
                debug!("Panel {}: artwork stored at {}", panel.panel_number, path.display());
                PanelArtwork {
                    panel_number: panel.panel_number,
                    page_number: panel.page_number,
                    image_path: Some(path),
                    prompt_used: prompt,
                    generation_params: params,
                    quality_score: 100.0,
                    error: None,
                }
            }
            Err(e) => {
                warn!("{}", e);
                if let PanelError::GenerationFailed { attempts, .. } = &e {
                    params.attempts = *attempts;
                }
                PanelArtwork {
                    panel_number: panel.panel_number,
                    page_number: panel.page_number,
                    image_path: None,
                    prompt_used: prompt,
                    generation_params: params,
                    quality_score: 0.0,
                    error: Some(e),
                }
            }
        }
    }

    /// Submit, poll while processing, download. Holds one pool permit.
    async fn request_image(&self, request: &ImageRequest) -> Result<Delivered, PanelError> {
        let panel = request.panel_number;
        let failed = |e: RetryExhausted| PanelError::GenerationFailed {
            panel,
            attempts: e.attempts,
            detail: e.last.to_string(),
        };

        let _permit = self
            .pool
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PanelError::GenerationFailed {
                panel,
                attempts: 0,
                detail: "image pool closed".into(),
            })?;

        let label = format!("Panel {panel}");
        let (mut outcome, attempts) = retry_with_backoff(&label, &self.policy, || self.images.submit(request))
            .await
            .map_err(failed)?;

        let mut polls = 0;
        let url = loop {
            match outcome {
                ImageOutcome::Ready { url } => break url,
                ImageOutcome::Processing { job_id, eta_secs } => {
                    if polls >= self.max_poll_attempts {
                        return Err(PanelError::StillProcessing { panel, polls });
                    }
                    polls += 1;
                    let delay = poll_delay(self.poll_backoff_ms, polls);
                    debug!(
                        "Panel {}: processing (eta {:?}s), poll {}/{} in {}ms",
                        panel,
                        eta_secs,
                        polls,
                        self.max_poll_attempts,
                        delay.as_millis()
                    );
                    sleep(delay).await;
                    outcome = retry_with_backoff(&label, &self.policy, || self.images.poll(&job_id))
                        .await
                        .map_err(failed)?
                        .0;
                }
            }
        };

        let (bytes, _) = retry_with_backoff(&label, &self.policy, || self.images.download(&url))
            .await
            .map_err(|e| match e.last {
                ServiceError::Malformed(detail) => PanelError::MalformedImage { panel, detail },
                other => PanelError::GenerationFailed {
                    panel,
                    attempts: e.attempts,
                    detail: other.to_string(),
                },
            })?;

        Ok(Delivered { bytes, attempts, polls })
    }
}

/// Decode the downloaded bytes and save them as PNG.
async fn store_artwork(panel: u32, bytes: Vec<u8>, path: PathBuf) -> Result<PathBuf, PanelError> {
    tokio::task::spawn_blocking(move || {
        let img = image::load_from_memory(&bytes).map_err(|e| PanelError::MalformedImage {
            panel,
            detail: e.to_string(),
        })?;
        img.save_with_format(&path, image::ImageFormat::Png)
            .map_err(|e| PanelError::StoreFailed {
                panel,
                detail: e.to_string(),
            })?;
        Ok(path)
    })
    .await
    .map_err(|e| PanelError::StoreFailed {
        panel,
        detail: format!("store task panicked: {e}"),
    })?
}
