//! External model services and the retry policy around them.
//!
//! The pipeline talks to two collaborators only through the traits here:
//!
//! - [`TextService`]: completions for the content stage
//!   ([`llm::LlmTextService`] wraps any edgequake-llm provider).
//! - [`ImageService`]: illustration jobs for the visual stage
//!   ([`modelslab::ModelsLabImageService`] is the HTTP client).
//!
//! [`mock`] provides scripted implementations of both for tests.
//!
//! ## Retry Strategy
//!
//! Every call goes through [`retry_with_backoff`]: each attempt is bounded by
//! the configured timeout, and only rate-limit, timeout and transport errors
//! are retried. Delays double from `retry_backoff_ms`; with 500 ms and three
//! retries the sequence is 500 ms → 1 s → 2 s. A rate-limit response that
//! names a retry-after longer than the computed delay is honoured instead.

pub mod llm;
pub mod mock;
pub mod modelslab;

use crate::config::{GenerationConfig, ImageSettings, MAX_POLL_DELAY_MS};
use crate::error::ServiceError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::warn;

pub use llm::LlmTextService;
pub use modelslab::ModelsLabImageService;

// ── Text completion ──────────────────────────────────────────────────────

/// Which content sub-step a completion belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Translation,
    Story,
    Script,
}

impl TaskKind {
    pub fn label(self) -> &'static str {
        match self {
            TaskKind::Translation => "translation",
            TaskKind::Story => "story structuring",
            TaskKind::Script => "scriptwriting",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub task: TaskKind,
    pub system: String,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: usize,
}

#[async_trait]
pub trait TextService: Send + Sync {
    /// Short name used in logs and error messages.
    fn name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<String, ServiceError>;
}

// ── Image generation ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageRequest {
    /// Not sent upstream; identifies the panel in logs and mocks.
    #[serde(skip)]
    pub panel_number: u32,
    pub prompt: String,
    pub negative_prompt: String,
    pub model: String,
    pub width: u32,
    pub height: u32,
    pub samples: u32,
    pub steps: u32,
    pub guidance_scale: f32,
    pub seed: Option<u64>,
}

impl ImageRequest {
    pub fn new(panel_number: u32, prompt: String, settings: &ImageSettings) -> Self {
        Self {
            panel_number,
            prompt,
            negative_prompt: settings.negative_prompt.clone(),
            model: settings.model.clone(),
            width: settings.width,
            height: settings.height,
            samples: settings.samples,
            steps: settings.steps,
            guidance_scale: settings.guidance_scale,
            seed: None,
        }
    }
}

/// What the image service said about a job.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageOutcome {
    /// Finished. `url` is an http(s) URL or a `data:` URI.
    Ready { url: String },
    /// Still rendering upstream; poll `job_id` later.
    Processing { job_id: String, eta_secs: Option<f64> },
}

#[async_trait]
pub trait ImageService: Send + Sync {
    fn name(&self) -> &str;

    async fn submit(&self, request: &ImageRequest) -> Result<ImageOutcome, ServiceError>;

    async fn poll(&self, job_id: &str) -> Result<ImageOutcome, ServiceError>;

    /// Fetch the bytes behind a [`ImageOutcome::Ready`] URL.
    async fn download(&self, url: &str) -> Result<Vec<u8>, ServiceError>;
}

// ── Retry ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &GenerationConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_ms: config.retry_backoff_ms,
            timeout: Duration::from_secs(config.api_timeout_secs),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }

    /// Delay before retry number `attempt` after `err`. A server-sent
    /// retry-after longer than the computed delay is honoured, but never
    /// beyond the per-call timeout or [`MAX_POLL_DELAY_MS`].
    pub fn backoff_after(&self, attempt: u32, err: &ServiceError) -> Duration {
        let computed = self.delay(attempt);
        match err {
            ServiceError::RateLimited {
                retry_after_secs: Some(secs),
            } => {
                let ceiling = self.timeout.min(Duration::from_millis(MAX_POLL_DELAY_MS));
                computed.max(Duration::from_secs(*secs).min(ceiling))
            }
            _ => computed,
        }
    }
}

/// Delay before poll number `poll` (1-based), doubling up to the cap.
pub fn poll_delay(base_ms: u64, poll: u32) -> Duration {
    let factor = 2u64.saturating_pow(poll.saturating_sub(1));
    Duration::from_millis(base_ms.saturating_mul(factor).min(MAX_POLL_DELAY_MS))
}

/// Why [`retry_with_backoff`] gave up.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryExhausted {
    pub attempts: u32,
    pub last: ServiceError,
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy runs out of retries. Returns the value and the attempts used.
pub async fn retry_with_backoff<T, F, Fut>(
    label: &str,
    policy: &RetryPolicy,
    mut op: F,
) -> Result<(T, u32), RetryExhausted>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let outcome = match timeout(policy.timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(ServiceError::Timeout {
                secs: policy.timeout.as_secs(),
            }),
        };

        let err = match outcome {
            Ok(value) => return Ok((value, attempt)),
            Err(e) => e,
        };

        let retries_used = attempt - 1;
        if !err.is_retryable() || retries_used >= policy.max_retries {
            return Err(RetryExhausted {
                attempts: attempt,
                last: err,
            });
        }

        let backoff = policy.backoff_after(attempt, &err);
        warn!(
            "{}: retry {}/{} after {}ms: {}",
            label,
            attempt,
            policy.max_retries,
            backoff.as_millis(),
            err
        );
        sleep(backoff).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff_ms: 1,
            timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn backoff_doubles() {
        let p = RetryPolicy {
            max_retries: 3,
            backoff_ms: 500,
            timeout: Duration::from_secs(1),
        };
        assert_eq!(p.delay(1), Duration::from_millis(500));
        assert_eq!(p.delay(2), Duration::from_millis(1000));
        assert_eq!(p.delay(3), Duration::from_millis(2000));
    }

    #[test]
    fn retry_after_is_bounded_by_the_call_timeout() {
        let p = RetryPolicy {
            max_retries: 3,
            backoff_ms: 500,
            timeout: Duration::from_secs(10),
        };
        let limited = |secs| ServiceError::RateLimited {
            retry_after_secs: Some(secs),
        };
        assert_eq!(p.backoff_after(1, &limited(3)), Duration::from_secs(3));
        assert_eq!(p.backoff_after(1, &limited(86_400)), Duration::from_secs(10));
        assert_eq!(p.backoff_after(2, &ServiceError::Transport("reset".into())), Duration::from_millis(1000));

        let long = RetryPolicy {
            timeout: Duration::from_secs(600),
            ..p
        };
        assert_eq!(long.backoff_after(1, &limited(86_400)), Duration::from_millis(MAX_POLL_DELAY_MS));
    }

    #[tokio::test]
    async fn huge_retry_after_does_not_park_the_caller() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let started = std::time::Instant::now();
        let (_, attempts) = retry_with_backoff("test", &fast_policy(1), || {
            let c = Arc::clone(&c);
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ServiceError::RateLimited {
                        retry_after_secs: Some(86_400),
                    })
                } else {
                    Ok(())
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(attempts, 2);
        assert!(started.elapsed() < Duration::from_secs(5), "waited {:?}", started.elapsed());
    }

    #[test]
    fn poll_delay_is_capped() {
        assert_eq!(poll_delay(2000, 1), Duration::from_millis(2000));
        assert_eq!(poll_delay(2000, 2), Duration::from_millis(4000));
        assert_eq!(poll_delay(2000, 10), Duration::from_millis(MAX_POLL_DELAY_MS));
    }

    #[tokio::test]
    async fn retries_transient_errors_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let (value, attempts) = retry_with_backoff("test", &fast_policy(3), || {
            let c = Arc::clone(&c);
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ServiceError::Transport("reset".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 42);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn non_retryable_error_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let err = retry_with_backoff::<(), _, _>("test", &fast_policy(5), || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(ServiceError::Auth("bad key".into()))
            }
        })
        .await
        .unwrap_err();
        assert_eq!(err.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn persistent_failure_uses_every_retry() {
        let err = retry_with_backoff::<(), _, _>("test", &fast_policy(2), || async {
            Err(ServiceError::RateLimited {
                retry_after_secs: None,
            })
        })
        .await
        .unwrap_err();
        assert_eq!(err.attempts, 3);
        assert!(matches!(err.last, ServiceError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn slow_call_times_out() {
        let err = retry_with_backoff::<(), _, _>("test", &fast_policy(0), || async {
            sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err.last, ServiceError::Timeout { .. }));
    }
}
