//! LLM gateway: one grounded prompt in, one answer (or a classified failure)
//! out.
//!
//! The gateway owns the retry/timeout policy; backends only know how to make
//! a single call. [`ModelBackend`] is the seam: [`ProviderBackend`] adapts any
//! `edgequake_llm` provider, and tests plug in in-process fakes.
//!
//! ## Retry Strategy
//!
//! Rate limits and 5xx responses are transient and frequent under concurrent
//! section generation. Exponential backoff (`retry_backoff_ms * 2^(n-1)`)
//! with a 500 ms base and 3 retries waits 500 ms → 1 s → 2 s. Refusals and
//! auth/4xx errors are not retried: asking again gives the same answer.
//!
//! Every attempt is bounded by `api_timeout_ms` and raced against the job's
//! [`Cancellation`]; a timed-out call is dropped, never half-used.

use crate::cancel::Cancellation;
use crate::config::ReportConfig;
use crate::error::SectionError;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, warn};

/// A single model request.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub system: String,
    pub user: String,
    pub images: Vec<ImageData>,
    pub temperature: f32,
    pub max_tokens: usize,
}

impl ModelRequest {
    pub fn new(system: impl Into<String>, user: impl Into<String>, config: &ReportConfig) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            images: Vec::new(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }

    pub fn with_image(mut self, image: ImageData) -> Self {
        self.images.push(image);
        self
    }
}

/// A successful model answer.
#[derive(Debug, Clone, Default)]
pub struct ModelReply {
    pub content: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// How a single backend call failed.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BackendError {
    /// Worth retrying: connection errors, rate limits, 5xx.
    #[error("transient backend error: {0}")]
    Transient(String),
    /// The model or its content filter declined.
    #[error("request refused: {0}")]
    Refusal(String),
    /// Retrying cannot help: auth, bad request, unknown model.
    #[error("permanent backend error: {0}")]
    Permanent(String),
}

/// One call to a language model.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    fn name(&self) -> &str {
        "model"
    }

    async fn complete(&self, request: &ModelRequest) -> Result<ModelReply, BackendError>;
}

/// [`ModelBackend`] over an `edgequake_llm` chat provider.
pub struct ProviderBackend {
    provider: Arc<dyn LLMProvider>,
}

impl ProviderBackend {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl ModelBackend for ProviderBackend {
    fn name(&self) -> &str {
        "edgequake-llm"
    }

    async fn complete(&self, request: &ModelRequest) -> Result<ModelReply, BackendError> {
        let messages = vec![
            ChatMessage::system(request.system.as_str()),
            ChatMessage::user_with_images(request.user.as_str(), request.images.clone()),
        ];
        let options = CompletionOptions {
            temperature: Some(request.temperature),
            max_tokens: Some(request.max_tokens),
            ..Default::default()
        };
        match self.provider.chat(&messages, Some(&options)).await {
            Ok(response) => Ok(ModelReply {
                content: response.content,
                prompt_tokens: response.prompt_tokens as u32,
                completion_tokens: response.completion_tokens as u32,
            }),
            Err(e) => Err(classify_provider_error(&e.to_string())),
        }
    }
}

/// Sort a provider error message into retry classes.
///
/// Providers surface HTTP status and vendor messages only as text, so this
/// matches on well-known fragments. Transport and overload fragments win over
/// everything else ("Connection refused" is not a model refusal). Unknown
/// errors are treated as transient.
pub fn classify_provider_error(message: &str) -> BackendError {
    let m = message.to_ascii_lowercase();
    const TRANSIENT: &[&str] = &[
        "connection",
        "timed out",
        "timeout",
        "429",
        "too many requests",
        "rate limit",
        "rate_limit",
        "internal server error",
        "bad gateway",
        "service unavailable",
        "gateway timeout",
        "overloaded",
        "temporarily",
        "status 500",
        "status 502",
        "status 503",
        "status 504",
    ];
    const REFUSAL: &[&str] = &[
        "content_filter",
        "content filter",
        "content policy",
        "safety system",
        "refused to answer",
        "refused the request",
        "refusal",
    ];
    const PERMANENT: &[&str] = &[
        "401",
        "403",
        "unauthorized",
        "forbidden",
        "invalid api key",
        "invalid_api_key",
        "api key not",
        "model not found",
        "model_not_found",
        "does not exist",
        "400 bad request",
        "invalid_request",
    ];
    if TRANSIENT.iter().any(|p| m.contains(p)) {
        return BackendError::Transient(message.to_string());
    }
    if REFUSAL.iter().any(|p| m.contains(p)) {
        return BackendError::Refusal(message.to_string());
    }
    if PERMANENT.iter().any(|p| m.contains(p)) {
        return BackendError::Permanent(message.to_string());
    }
    BackendError::Transient(message.to_string())
}

/// Upper bound for a single retry pause.
const MAX_BACKOFF_MS: u64 = 60_000;

/// Pause before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
/// capped at [`MAX_BACKOFF_MS`].
fn backoff_ms(base: u64, attempt: u32) -> u64 {
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(MAX_BACKOFF_MS)
}

static RE_REFUSAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*(i'?m sorry,? but )?(i|we) (can(no|')t|am unable to|won'?t|will not) (help|assist|comply|provide|do that)",
    )
    .unwrap()
});

/// A short reply that opens with a stock refusal.
pub fn looks_like_refusal(reply: &str) -> bool {
    reply.len() < 600 && RE_REFUSAL.is_match(reply)
}

/// Retry/timeout policy.
#[derive(Debug, Clone, Copy)]
pub struct GatewayPolicy {
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub api_timeout_ms: u64,
}

impl From<&ReportConfig> for GatewayPolicy {
    fn from(c: &ReportConfig) -> Self {
        Self {
            max_retries: c.max_retries,
            retry_backoff_ms: c.retry_backoff_ms,
            api_timeout_ms: c.api_timeout_ms,
        }
    }
}

/// A model answer plus accounting.
#[derive(Debug, Clone)]
pub struct Generation {
    pub content: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub attempts: u32,
    pub duration_ms: u64,
}

enum LastFailure {
    Timeout,
    Backend(String),
}

/// Retry/timeout/cancellation wrapper around a [`ModelBackend`].
#[derive(Clone)]
pub struct LlmGateway {
    backend: Arc<dyn ModelBackend>,
    policy: GatewayPolicy,
}

impl LlmGateway {
    pub fn new(backend: Arc<dyn ModelBackend>, policy: GatewayPolicy) -> Self {
        Self { backend, policy }
    }

    pub fn policy(&self) -> GatewayPolicy {
        self.policy
    }

    /// Run `request` under the retry policy.
    pub async fn generate(
        &self,
        request: &ModelRequest,
        cancel: &Cancellation,
    ) -> Result<Generation, SectionError> {
        let start = Instant::now();
        let per_call = Duration::from_millis(self.policy.api_timeout_ms);
        let mut last = LastFailure::Backend("no attempt made".into());

        for attempt in 0..=self.policy.max_retries {
            if attempt > 0 {
                let backoff = backoff_ms(self.policy.retry_backoff_ms, attempt);
                warn!(
                    backend = self.backend.name(),
                    "retry {}/{} after {}ms", attempt, self.policy.max_retries, backoff
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(SectionError::Cancelled),
                    _ = sleep(Duration::from_millis(backoff)) => {}
                }
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(SectionError::Cancelled),
                r = timeout(per_call, self.backend.complete(request)) => r,
            };

            match outcome {
                Err(_) => {
                    warn!("attempt {} timed out after {}ms", attempt + 1, self.policy.api_timeout_ms);
                    last = LastFailure::Timeout;
                }
                Ok(Ok(reply)) => {
                    if looks_like_refusal(&reply.content) {
                        return Err(SectionError::ModelRefusal {
                            detail: reply.content.trim().chars().take(200).collect(),
                        });
                    }
                    if reply.content.trim().is_empty() {
                        warn!("attempt {} returned an empty answer", attempt + 1);
                        last = LastFailure::Backend("empty response".into());
                        continue;
                    }
                    debug!(
                        "{} input tokens, {} output tokens, {:?}",
                        reply.prompt_tokens,
                        reply.completion_tokens,
                        start.elapsed()
                    );
                    return Ok(Generation {
                        content: reply.content,
                        prompt_tokens: reply.prompt_tokens,
                        completion_tokens: reply.completion_tokens,
                        attempts: attempt + 1,
                        duration_ms: start.elapsed().as_millis() as u64,
                    });
                }
                Ok(Err(BackendError::Refusal(detail))) => {
                    return Err(SectionError::ModelRefusal { detail });
                }
                Ok(Err(BackendError::Permanent(detail))) => {
                    return Err(SectionError::ModelUnavailable {
                        attempts: attempt + 1,
                        detail,
                    });
                }
                Ok(Err(BackendError::Transient(detail))) => {
                    warn!("attempt {} failed: {}", attempt + 1, detail);
                    last = LastFailure::Backend(detail);
                }
            }
        }

        let attempts = self.policy.max_retries + 1;
        Err(match last {
            LastFailure::Timeout => SectionError::ModelTimeout {
                attempts,
                timeout_ms: self.policy.api_timeout_ms,
            },
            LastFailure::Backend(detail) => SectionError::ModelUnavailable { attempts, detail },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Scripted {
        calls: AtomicU32,
        script: Vec<Result<&'static str, BackendError>>,
        delay_ms: u64,
    }

    #[async_trait]
    impl ModelBackend for Scripted {
        async fn complete(&self, _r: &ModelRequest) -> Result<ModelReply, BackendError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            if self.delay_ms > 0 {
                sleep(Duration::from_millis(self.delay_ms)).await;
            }
            let step = self.script[n.min(self.script.len() - 1)].clone();
            step.map(|text| ModelReply {
                content: text.to_string(),
                prompt_tokens: 10,
                completion_tokens: 5,
            })
        }
    }

    fn gateway(script: Vec<Result<&'static str, BackendError>>, delay_ms: u64, timeout_ms: u64) -> (LlmGateway, Arc<Scripted>) {
        let backend = Arc::new(Scripted {
            calls: AtomicU32::new(0),
            script,
            delay_ms,
        });
        let gw = LlmGateway::new(
            backend.clone(),
            GatewayPolicy {
                max_retries: 2,
                retry_backoff_ms: 1,
                api_timeout_ms: timeout_ms,
            },
        );
        (gw, backend)
    }

    fn request() -> ModelRequest {
        ModelRequest::new("sys", "user", &ReportConfig::default())
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let (gw, backend) = gateway(
            vec![Err(BackendError::Transient("429".into())), Ok("Revenue grew.")],
            0,
            1000,
        );
        let g = gw.generate(&request(), &Cancellation::new()).await.unwrap();
        assert_eq!(g.content, "Revenue grew.");
        assert_eq!(g.attempts, 2);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn refused_connections_are_retried() {
        let (gw, backend) = gateway(
            vec![
                Err(classify_provider_error("tcp connect error: Connection refused (os error 111)")),
                Ok("Costs fell."),
            ],
            0,
            1000,
        );
        let g = gw.generate(&request(), &Cancellation::new()).await.unwrap();
        assert_eq!(g.content, "Costs fell.");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let (gw, backend) = gateway(vec![Err(BackendError::Permanent("401".into()))], 0, 1000);
        let err = gw.generate(&request(), &Cancellation::new()).await.unwrap_err();
        assert!(matches!(err, SectionError::ModelUnavailable { attempts: 1, .. }));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refusal_text_is_classified() {
        let (gw, _) = gateway(vec![Ok("I'm sorry, but I can't help with that.")], 0, 1000);
        let err = gw.generate(&request(), &Cancellation::new()).await.unwrap_err();
        assert!(matches!(err, SectionError::ModelRefusal { .. }));
    }

    #[tokio::test]
    async fn every_attempt_timing_out_is_model_timeout() {
        let (gw, backend) = gateway(vec![Ok("late")], 200, 10);
        let err = gw.generate(&request(), &Cancellation::new()).await.unwrap_err();
        assert_eq!(
            err,
            SectionError::ModelTimeout {
                attempts: 3,
                timeout_ms: 10
            }
        );
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancellation_interrupts_call() {
        let (gw, _) = gateway(vec![Ok("never")], 5_000, 10_000);
        let cancel = Cancellation::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let err = gw.generate(&request(), &cancel).await.unwrap_err();
        assert_eq!(err, SectionError::Cancelled);
    }

    #[test]
    fn provider_errors_are_classified() {
        assert!(matches!(classify_provider_error("HTTP 429 Too Many Requests"), BackendError::Transient(_)));
        assert!(matches!(classify_provider_error("401 Unauthorized"), BackendError::Permanent(_)));
        assert!(matches!(
            classify_provider_error("finish_reason: content_filter"),
            BackendError::Refusal(_)
        ));
        assert!(matches!(classify_provider_error("connection reset"), BackendError::Transient(_)));
        assert!(matches!(
            classify_provider_error("Network error: tcp connect error: Connection refused (os error 111)"),
            BackendError::Transient(_)
        ));
        assert!(matches!(
            classify_provider_error("503 Service Unavailable: upstream overloaded"),
            BackendError::Transient(_)
        ));
        assert!(matches!(
            classify_provider_error("The model refused to answer this prompt"),
            BackendError::Refusal(_)
        ));
    }

    #[test]
    fn backoff_doubles_then_saturates() {
        assert_eq!(backoff_ms(500, 1), 500);
        assert_eq!(backoff_ms(500, 3), 2000);
        assert_eq!(backoff_ms(500, 70), MAX_BACKOFF_MS);
        assert_eq!(backoff_ms(u64::MAX, 2), MAX_BACKOFF_MS);
        assert_eq!(backoff_ms(0, 200), 0);
    }

    #[test]
    fn refusal_detector_ignores_normal_prose() {
        assert!(looks_like_refusal("I cannot help with that request."));
        assert!(!looks_like_refusal("Revenue rose 12% while we cannot help noticing costs."));
    }
}
