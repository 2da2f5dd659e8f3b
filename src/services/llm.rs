//! Text completion through edgequake-llm.
//!
//! The adapter is intentionally thin: prompts come from [`crate::prompts`]
//! and retries from [`super::retry_with_backoff`]. Its only job is turning
//! one [`CompletionRequest`] into a chat call and classifying failures.

use super::{CompletionRequest, TextService};
use crate::config::GenerationConfig;
use crate::error::{ComicError, ServiceError};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

const DEFAULT_MODEL: &str = "gpt-4.1-mini";

pub struct LlmTextService {
    provider: Arc<dyn LLMProvider>,
    /// Reported in [`ServiceError::Timeout`] when the provider gives up.
    timeout_secs: u64,
}

impl LlmTextService {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self {
            provider,
            timeout_secs: GenerationConfig::default().api_timeout_secs,
        }
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Resolve a provider from the configuration, most specific first:
    ///
    /// 1. a pre-built `config.provider`
    /// 2. `config.provider_name` (+ `config.model`)
    /// 3. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`
    /// 4. `OPENAI_API_KEY`, then [`ProviderFactory::from_env`] auto-detection
    pub fn from_config(config: &GenerationConfig) -> Result<Self, ComicError> {
        let service = Self::new(resolve_provider(config)?);
        Ok(service.with_timeout_secs(config.api_timeout_secs))
    }
}

fn create_provider(name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, ComicError> {
    ProviderFactory::create_llm_provider(name, model).map_err(|e| ComicError::ServiceNotConfigured {
        service: name.to_string(),
        hint: format!("{e}"),
    })
}

fn resolve_provider(config: &GenerationConfig) -> Result<Arc<dyn LLMProvider>, ComicError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
    if let Some(ref name) = config.provider_name {
        return create_provider(name, model);
    }

    if let (Ok(prov), Ok(env_model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !env_model.is_empty() {
            return create_provider(&prov, &env_model);
        }
    }

    if std::env::var("OPENAI_API_KEY").is_ok_and(|k| !k.is_empty()) {
        return create_provider("openai", model);
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| ComicError::ServiceNotConfigured {
            service: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                 Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                 Error: {e}"
            ),
        })?;
    Ok(llm_provider)
}

#[async_trait]
impl TextService for LlmTextService {
    fn name(&self) -> &str {
        "llm"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, ServiceError> {
        let start = Instant::now();
        let messages = chat_messages(request);
        let options = CompletionOptions {
            temperature: Some(request.temperature),
            max_tokens: Some(request.max_tokens),
            ..Default::default()
        };

        let response = self
            .provider
            .chat(&messages, Some(&options))
            .await
            .map_err(|e| classify(&e.to_string(), self.timeout_secs))?;

        debug!(
            "{}: {} input tokens, {} output tokens, {:?}",
            request.task.label(),
            response.prompt_tokens,
            response.completion_tokens,
            start.elapsed()
        );

        if response.content.trim().is_empty() {
            return Err(ServiceError::Malformed("empty completion".into()));
        }
        Ok(response.content)
    }
}

/// System prompt then a text-only user turn.
fn chat_messages(request: &CompletionRequest) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(request.system.as_str()),
        ChatMessage::user(request.prompt.as_str()),
    ]
}

/// Map a provider error message onto the retry taxonomy.
pub(crate) fn classify(message: &str, timeout_secs: u64) -> ServiceError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("429") || lower.contains("rate limit") || lower.contains("rate_limit") || lower.contains("quota") {
        ServiceError::RateLimited {
            retry_after_secs: None,
        }
    } else if lower.contains("timed out") || lower.contains("timeout") {
        ServiceError::Timeout { secs: timeout_secs }
    } else if lower.contains("401")
        || lower.contains("403")
        || lower.contains("unauthorized")
        || lower.contains("invalid api key")
        || lower.contains("authentication")
    {
        ServiceError::Auth(message.to_string())
    } else if lower.contains("400") || lower.contains("invalid request") {
        ServiceError::Api(message.to_string())
    } else {
        ServiceError::Transport(message.to_string())
    }
}
