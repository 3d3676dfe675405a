//! LLM provider trait — common interface for all backends.
//!
//! Providers speak a two-call contract: `chat` for reply generation and
//! `extract` for structured output. [`LlmHandle`] wraps a provider with the
//! retry/timeout/cancellation policy so callers see crate-level errors only.

use crate::error::{Error, Result};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

// ── Common parameters ──────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct LlmParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }
}

/// Error type internal to the provider layer. The retry policy needs to
/// tell transport failures apart from schema mismatches.
#[derive(Debug)]
pub enum CallError {
    /// Network-level failure (connect, timeout, body read).
    Transport(String),
    /// Non-success HTTP status.
    Http(u16, String),
    /// Output did not conform to the requested schema.
    Schema(String),
}

impl CallError {
    /// Transport failures and 5xx responses are retryable; schema
    /// mismatches and 4xx responses are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            CallError::Transport(_) => true,
            CallError::Http(status, _) => *status >= 500,
            CallError::Schema(_) => false,
        }
    }
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::Transport(msg) => write!(f, "transport: {}", msg),
            CallError::Http(status, msg) => write!(f, "http {}: {}", status, msg),
            CallError::Schema(msg) => write!(f, "schema: {}", msg),
        }
    }
}

/// Common interface for LLM providers (openai, zhipu, mock).
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Non-streaming chat completion.
    async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        params: LlmParams,
    ) -> std::result::Result<String, CallError>;

    /// Structured extraction: the returned value conforms to `schema`
    /// (JSON Schema) or the call fails with [`CallError::Schema`].
    async fn extract(
        &self,
        prompt: &str,
        schema: &serde_json::Value,
    ) -> std::result::Result<serde_json::Value, CallError>;

    /// Provider identifier (e.g. "openai", "zhipu", "mock").
    fn id(&self) -> &str;
}

// ── Shared output parsing ──────────────────────────────

/// Strip markdown code fences if present.
pub(crate) fn strip_code_fences(response: &str) -> &str {
    let trimmed = response.trim();
    if trimmed.starts_with("```") {
        trimmed
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim()
    } else {
        trimmed
    }
}

/// Parse a model reply as JSON and validate it against `schema`.
pub(crate) fn parse_and_validate(
    response: &str,
    schema: &serde_json::Value,
) -> std::result::Result<serde_json::Value, CallError> {
    let text = strip_code_fences(response);
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| CallError::Schema(format!("not valid json: {}", e)))?;

    let compiled = jsonschema::JSONSchema::compile(schema)
        .map_err(|e| CallError::Schema(format!("bad schema: {}", e)))?;
    if let Err(errors) = compiled.validate(&value) {
        let first = errors
            .into_iter()
            .next()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown violation".to_string());
        return Err(CallError::Schema(first));
    }
    Ok(value)
}

// ── Retry policy ───────────────────────────────────────

const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_CAP_MS: u64 = 8_000;

/// Exponential backoff with full jitter up to 50% of the delay.
fn backoff_delay(attempt: u32) -> Duration {
    let base = BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(8)).min(BACKOFF_CAP_MS);
    let jitter = rand::thread_rng().gen_range(0..=base / 2);
    Duration::from_millis((base + jitter).min(BACKOFF_CAP_MS))
}

/// A provider plus the call policy: per-attempt timeout, bounded retries,
/// cancellation observed between attempts.
#[derive(Clone)]
pub struct LlmHandle {
    provider: Arc<dyn LlmProvider>,
    max_retries: u32,
    timeout: Duration,
}

impl LlmHandle {
    pub fn new(provider: Arc<dyn LlmProvider>, max_retries: u32, timeout: Duration) -> Self {
        Self { provider, max_retries, timeout }
    }

    pub fn provider_id(&self) -> &str {
        self.provider.id()
    }

    pub async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        params: LlmParams,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let provider = self.provider.clone();
        self.run(cancel, move || {
            let provider = provider.clone();
            let messages = messages.clone();
            let params = params.clone();
            async move { provider.chat(messages, params).await }
        })
        .await
    }

    pub async fn extract(
        &self,
        prompt: &str,
        schema: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value> {
        let provider = self.provider.clone();
        let prompt = prompt.to_string();
        let schema = schema.clone();
        self.run(cancel, move || {
            let provider = provider.clone();
            let prompt = prompt.clone();
            let schema = schema.clone();
            async move { provider.extract(&prompt, &schema).await }
        })
        .await
    }

    async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, CallError>>,
    {
        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let outcome = tokio::time::timeout(self.timeout, call()).await;
            let err = match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => CallError::Transport(format!("attempt timed out after {:?}", self.timeout)),
            };

            match err {
                CallError::Schema(msg) => return Err(Error::Schema(msg)),
                retryable if retryable.is_retryable() && attempt < self.max_retries => {
                    let delay = backoff_delay(attempt);
                    warn!(
                        provider = self.provider.id(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %retryable,
                        "llm call failed, backing off"
                    );
                    last_err = Some(retryable);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                fatal => return Err(Error::TransientLlm(fatal.to_string())),
            }
        }
        Err(Error::TransientLlm(
            last_err.map(|e| e.to_string()).unwrap_or_else(|| "retries exhausted".to_string()),
        ))
    }
}
