//! LLM capability for the Medic repair engine.
//!
//! The engine sees one function: `LlmClient::generate` (and its JSON
//! variant). Behind it sit two providers: the default Anthropic-style
//! provider and an OpenAI-compatible HTTP fallback with bearer auth.
//! The client owns the retry policy: exponential backoff on 429 and
//! 5xx, no retry on other client errors, one deadline per call.

mod anthropic;
mod openai;
mod parse;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiCompatProvider;
pub use parse::extract_json;

use async_trait::async_trait;
use medic_config::LlmConfig;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors from the LLM capability.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("provider not configured: {0}")]
    NotConfigured(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("rate limited (HTTP {status})")]
    RateLimited { status: u16 },

    #[error("server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },

    #[error("client error (HTTP {status}): {message}")]
    Client { status: u16, message: String },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("response failed validation: {0}")]
    Validation(String),
}

impl LlmError {
    /// Whether the retry policy should try again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::RateLimited { .. } | Self::Server { .. }
        )
    }
}

pub type LlmResult<T> = Result<T, LlmError>;

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Requested response shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseFormat {
    #[default]
    Text,
    /// Ask the provider for `application/json`; the caller validates.
    Json,
}

/// A generation request.
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    /// Model override; the provider default applies when absent.
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub stop_sequences: Vec<String>,
    pub response_format: ResponseFormat,
}

/// Usage and latency accounting attached to every response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmMetrics {
    pub tokens_input: u32,
    pub tokens_output: u32,
    /// Nominal dollar cost, from a flat per-token rate.
    pub cost: f64,
    pub latency_ms: u64,
    pub model: String,
}

/// A completed generation.
#[derive(Debug, Clone)]
pub struct Generation {
    pub text: String,
    pub metrics: LlmMetrics,
}

/// Provider contract. Implementations are stateless beyond their HTTP
/// client and credentials.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn default_model(&self) -> &str;

    async fn generate(&self, request: &GenerateRequest) -> LlmResult<Generation>;
}

/// Retry tuning. Defaults follow the engine policy: up to 4 attempts,
/// 1.5 s base delay, doubling per attempt.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(1500),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Client handed to the engine: a provider plus retry/deadline policy.
#[derive(Clone)]
pub struct LlmClient {
    provider: Arc<dyn LlmProvider>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl LlmClient {
    pub fn new(provider: Arc<dyn LlmProvider>, retry: RetryPolicy, timeout: Duration) -> Self {
        Self {
            provider,
            retry,
            timeout,
        }
    }

    /// Build a client from configuration, selecting the provider.
    pub fn from_config(config: &LlmConfig) -> LlmResult<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let provider: Arc<dyn LlmProvider> = match config.provider.as_str() {
            "anthropic" => Arc::new(AnthropicProvider::from_config(config)),
            "openai_compatible" => Arc::new(OpenAiCompatProvider::from_config(config)?),
            other => {
                return Err(LlmError::NotConfigured(format!(
                    "unknown llm provider '{other}'"
                )))
            }
        };
        Ok(Self::new(provider, RetryPolicy::default(), timeout))
    }

    #[must_use]
    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    /// Generate text, retrying transient failures with exponential
    /// backoff. Client errors (4xx other than 429) surface immediately.
    pub async fn generate(&self, request: &GenerateRequest) -> LlmResult<Generation> {
        let mut last_err = None;
        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                let delay = self.retry.delay_for_attempt(attempt - 1);
                tracing::debug!(attempt, ?delay, "retrying LLM call");
                tokio::time::sleep(delay).await;
            }

            let call = self.provider.generate(request);
            match tokio::time::timeout(self.timeout, call).await {
                Ok(Ok(generation)) => return Ok(generation),
                Ok(Err(err)) if err.is_retryable() => {
                    tracing::warn!(attempt, error = %err, "transient LLM failure");
                    last_err = Some(err);
                }
                Ok(Err(err)) => return Err(err),
                Err(_) => return Err(LlmError::Timeout(self.timeout)),
            }
        }
        Err(last_err.unwrap_or_else(|| LlmError::Transport("retries exhausted".into())))
    }

    /// Generate and parse JSON, re-prompting with the parse error up to
    /// three times before giving up with `Validation`.
    pub async fn generate_json<T>(
        &self,
        request: &GenerateRequest,
        validate: impl Fn(&T) -> Result<(), String>,
    ) -> LlmResult<(T, LlmMetrics)>
    where
        T: for<'de> Deserialize<'de>,
    {
        const JSON_ATTEMPTS: u32 = 3;

        let mut request = GenerateRequest {
            response_format: ResponseFormat::Json,
            ..request.clone()
        };

        let mut last_reason = String::new();
        for attempt in 0..JSON_ATTEMPTS {
            let generation = self.generate(&request).await?;
            let raw = extract_json(&generation.text);
            match serde_json::from_str::<T>(raw) {
                Ok(value) => match validate(&value) {
                    Ok(()) => return Ok((value, generation.metrics)),
                    Err(reason) => last_reason = reason,
                },
                Err(err) => last_reason = err.to_string(),
            }

            tracing::warn!(attempt, reason = %last_reason, "LLM JSON response rejected");
            request.messages.push(ChatMessage::assistant(generation.text));
            request.messages.push(ChatMessage::user(format!(
                "The previous response was rejected: {last_reason}. \
                 Respond again with only a valid JSON object."
            )));
        }

        Err(LlmError::Validation(last_reason))
    }
}

/// Nominal flat pricing used for the `cost` metric.
#[must_use]
pub fn estimate_cost(tokens_input: u32, tokens_output: u32) -> f64 {
    const INPUT_PER_MTOK: f64 = 3.0;
    const OUTPUT_PER_MTOK: f64 = 15.0;
    f64::from(tokens_input) / 1_000_000.0 * INPUT_PER_MTOK
        + f64::from(tokens_output) / 1_000_000.0 * OUTPUT_PER_MTOK
}
