//! ModelsLab text-to-image client.
//!
//! `POST {base}/images/text2img` answers with one of three statuses:
//! `success` (image URL in `output[0]`), `processing` (poll
//! `POST {base}/images/fetch/{id}` later) or `error`. Outputs are usually
//! URLs; some models return `data:image/...;base64,` URIs which
//! [`ImageService::download`] decodes in place.

use super::{ImageOutcome, ImageRequest, ImageService};
use crate::config::GenerationConfig;
use crate::error::{ComicError, ServiceError};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://modelslab.com/api/v6";

pub struct ModelsLabImageService {
    client: Client,
    api_key: String,
    base_url: String,
    timeout_secs: u64,
}

#[derive(Debug, Serialize)]
struct Text2ImgBody<'a> {
    key: &'a str,
    model_id: &'a str,
    prompt: &'a str,
    negative_prompt: &'a str,
    width: String,
    height: String,
    samples: String,
    num_inference_steps: String,
    guidance_scale: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    safety_checker: &'a str,
}

#[derive(Debug, Serialize)]
struct FetchBody<'a> {
    key: &'a str,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: String,
    #[serde(default)]
    output: Vec<String>,
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default)]
    eta: Option<f64>,
    #[serde(default)]
    message: Option<serde_json::Value>,
}

impl ModelsLabImageService {
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: Client::builder().timeout(timeout).build().unwrap_or_default(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_secs: timeout.as_secs().max(1),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Build from `config.image_api_key`, falling back to `MODELSLAB_API_KEY`.
    pub fn from_config(config: &GenerationConfig) -> Result<Self, ComicError> {
        let key = config
            .image_api_key
            .clone()
            .or_else(|| std::env::var("MODELSLAB_API_KEY").ok())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ComicError::ServiceNotConfigured {
                service: "modelslab".to_string(),
                hint: "Set MODELSLAB_API_KEY or GenerationConfig::image_api_key.".to_string(),
            })?;
        Ok(Self::new(key, Duration::from_secs(config.api_timeout_secs)))
    }

    fn transport_error(&self, e: reqwest::Error) -> ServiceError {
        if e.is_timeout() {
            ServiceError::Timeout {
                secs: self.timeout_secs,
            }
        } else {
            ServiceError::Transport(e.to_string())
        }
    }

    async fn post<B: Serialize>(&self, url: &str, body: &B) -> Result<ApiResponse, ServiceError> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, retry_after, text));
        }

        response
            .json::<ApiResponse>()
            .await
            .map_err(|e| ServiceError::Malformed(e.to_string()))
    }
}

fn status_error(status: StatusCode, retry_after: Option<u64>, text: String) -> ServiceError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ServiceError::RateLimited {
            retry_after_secs: retry_after,
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ServiceError::Auth(text),
        s if s.is_server_error() => ServiceError::Transport(format!("{s}: {text}")),
        s => ServiceError::Api(format!("{s}: {text}")),
    }
}

fn interpret(response: ApiResponse) -> Result<ImageOutcome, ServiceError> {
    match response.status.as_str() {
        "success" => response
            .output
            .into_iter()
            .next()
            .map(|url| ImageOutcome::Ready { url })
            .ok_or_else(|| ServiceError::Malformed("success response without output".into())),
        "processing" => {
            let job_id = match response.id {
                Some(serde_json::Value::String(s)) => s,
                Some(serde_json::Value::Number(n)) => n.to_string(),
                _ => return Err(ServiceError::Malformed("processing response without id".into())),
            };
            Ok(ImageOutcome::Processing {
                job_id,
                eta_secs: response.eta,
            })
        }
        _ => {
            let message = match response.message {
                Some(serde_json::Value::String(s)) => s,
                Some(other) => other.to_string(),
                None => format!("status '{}'", response.status),
            };
            let lower = message.to_ascii_lowercase();
            if lower.contains("rate limit") || lower.contains("too many") {
                Err(ServiceError::RateLimited {
                    retry_after_secs: None,
                })
            } else {
                Err(ServiceError::Api(message))
            }
        }
    }
}

/// Decode a `data:<mime>;base64,<payload>` URI.
pub fn decode_data_uri(uri: &str) -> Result<Vec<u8>, ServiceError> {
    let (_, payload) = uri
        .split_once(";base64,")
        .ok_or_else(|| ServiceError::Malformed("data URI is not base64".into()))?;
    BASE64
        .decode(payload.trim())
        .map_err(|e| ServiceError::Malformed(format!("bad base64 payload: {e}")))
}

#[async_trait]
impl ImageService for ModelsLabImageService {
    fn name(&self) -> &str {
        "modelslab"
    }

    async fn submit(&self, request: &ImageRequest) -> Result<ImageOutcome, ServiceError> {
        let body = Text2ImgBody {
            key: &self.api_key,
            model_id: &request.model,
            prompt: &request.prompt,
            negative_prompt: &request.negative_prompt,
            width: request.width.to_string(),
            height: request.height.to_string(),
            samples: request.samples.to_string(),
            num_inference_steps: request.steps.to_string(),
            guidance_scale: request.guidance_scale,
            seed: request.seed,
            safety_checker: "no",
        };
        debug!("Panel {}: submitting to modelslab", request.panel_number);
        let url = format!("{}/images/text2img", self.base_url);
        interpret(self.post(&url, &body).await?)
    }

    async fn poll(&self, job_id: &str) -> Result<ImageOutcome, ServiceError> {
        let url = format!("{}/images/fetch/{}", self.base_url, job_id);
        interpret(self.post(&url, &FetchBody { key: &self.api_key }).await?)
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, ServiceError> {
        if url.starts_with("data:") {
            return decode_data_uri(url);
        }
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, None, text));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| self.transport_error(e))?;
        Ok(bytes.to_vec())
    }
}
