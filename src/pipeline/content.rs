//! Content stage: text → translation → story structure → panel script.
//!
//! The three sub-steps form an explicit typed chain. Each one consumes the
//! previous step's parsed output and must itself parse into its declared
//! type, or the stage fails with [`ComicError::MalformedOutput`] naming the
//! step. Service failures are retried per [`RetryPolicy`] and surface as
//! [`ComicError::ServiceFailed`] once retries run out.

use crate::config::GenerationConfig;
use crate::error::ComicError;
use crate::model::{ComicScript, GenerationOptions, ProcessedDocument, StoryStructure, TranslatedContent};
use crate::pipeline::postprocess::parse_structured;
use crate::prompts;
use crate::services::{retry_with_backoff, CompletionRequest, RetryPolicy, TaskKind, TextService};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Everything the content stage produced.
#[derive(Debug, Clone)]
pub struct ContentOutput {
    pub translated: TranslatedContent,
    pub story: StoryStructure,
    pub script: ComicScript,
    /// Count disagreements between what was asked for and what came back.
    pub warnings: Vec<String>,
}

pub struct ContentStage {
    text: Arc<dyn TextService>,
    policy: RetryPolicy,
    temperature: f32,
    max_tokens: usize,
}

impl ContentStage {
    pub fn new(text: Arc<dyn TextService>, config: &GenerationConfig) -> Self {
        Self {
            text,
            policy: RetryPolicy::from_config(config),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }

    pub async fn run(&self, doc: &ProcessedDocument, options: &GenerationOptions) -> Result<ContentOutput, ComicError> {
        let translated = self.translate(doc, options).await?;
        let story = self.structure(&translated, options).await?;
        let (script, warnings) = self.write_script(&story, options).await?;
        Ok(ContentOutput {
            translated,
            story,
            script,
            warnings,
        })
    }

    pub async fn translate(
        &self,
        doc: &ProcessedDocument,
        options: &GenerationOptions,
    ) -> Result<TranslatedContent, ComicError> {
        let translated: TranslatedContent = self
            .step(
                TaskKind::Translation,
                prompts::TRANSLATION_SYSTEM_PROMPT,
                prompts::translation_prompt(doc, options),
            )
            .await?;
        if translated.translated_text.trim().is_empty() {
            return Err(ComicError::MalformedOutput {
                step: TaskKind::Translation.label().to_string(),
                detail: "translated_text is empty".into(),
            });
        }
        Ok(translated)
    }

    pub async fn structure(
        &self,
        translated: &TranslatedContent,
        options: &GenerationOptions,
    ) -> Result<StoryStructure, ComicError> {
        let story: StoryStructure = self
            .step(
                TaskKind::Story,
                prompts::STORY_SYSTEM_PROMPT,
                prompts::story_prompt(translated, options),
            )
            .await?;
        info!("Story '{}': {} character(s)", story.title, story.characters.len());
        Ok(story)
    }

    /// Generate and check the script. The declared counters are replaced by
    /// the counts the panels actually cover, and a shortfall against
    /// `target_pages` is reported rather than padded or truncated.
    pub async fn write_script(
        &self,
        story: &StoryStructure,
        options: &GenerationOptions,
    ) -> Result<(ComicScript, Vec<String>), ComicError> {
        let mut script: ComicScript = self
            .step(
                TaskKind::Script,
                prompts::SCRIPT_SYSTEM_PROMPT,
                prompts::script_prompt(story, options),
            )
            .await?;
        script.validate()?;

        let mut warnings = script.reconcile_counts();
        if script.total_pages != options.target_pages {
            warnings.push(format!(
                "requested {} page(s), script covers {}",
                options.target_pages, script.total_pages
            ));
        }
        if let Some(title) = &options.title {
            script.title = title.clone();
        }
        for w in &warnings {
            warn!("{}", w);
        }
        info!(
            "Script ready: {} panels over {} page(s)",
            script.total_panels, script.total_pages
        );
        Ok((script, warnings))
    }

    async fn step<T: DeserializeOwned>(&self, task: TaskKind, system: &str, prompt: String) -> Result<T, ComicError> {
        let request = CompletionRequest {
            task,
            system: system.to_string(),
            prompt,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };
        let label = task.label();
        let (raw, attempts) = retry_with_backoff(label, &self.policy, || self.text.complete(&request))
            .await
            .map_err(|e| ComicError::ServiceFailed {
                service: format!("{} ({label})", self.text.name()),
                attempts: e.attempts,
                detail: e.last.to_string(),
            })?;
        debug!("{}: {} chars after {} attempt(s)", label, raw.len(), attempts);
        parse_structured(label, &raw)
    }
}
