//! OpenAI-compatible fallback provider: plain HTTP with bearer auth.
//!
//! Used for self-hosted gateways and any endpoint speaking the
//! chat-completions dialect. Non-streaming; the engine's calls are
//! request/response.

use async_trait::async_trait;
use medic_config::LlmConfig;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::{
    estimate_cost, GenerateRequest, Generation, LlmError, LlmMetrics, LlmProvider, LlmResult,
    ResponseFormat, Role,
};

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct WireResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<WireResponseFormat>,
}

#[derive(Debug, Deserialize)]
struct WireChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireChoiceMessage,
}

#[derive(Debug, Deserialize, Default)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: WireUsage,
    #[serde(default)]
    model: String,
}

/// OpenAI-compatible provider.
pub struct OpenAiCompatProvider {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
}

impl OpenAiCompatProvider {
    /// Build from config. The base URL is required for this provider.
    pub fn from_config(config: &LlmConfig) -> LlmResult<Self> {
        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| LlmError::NotConfigured("llm.base_url required".into()))?;
        Ok(Self {
            client: Client::new(),
            api_key: config
                .api_key
                .clone()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok()),
            base_url,
            model: config.model.clone(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn name(&self) -> &'static str {
        "openai_compatible"
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &GenerateRequest) -> LlmResult<Generation> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| LlmError::NotConfigured("llm.api_key required".into()))?;

        let model = request.model.as_deref().unwrap_or(&self.model);
        let messages = request
            .messages
            .iter()
            .map(|m| WireMessage {
                role: match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                },
                content: &m.content,
            })
            .collect();

        let wire = WireRequest {
            model,
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stop: request.stop_sequences.clone(),
            response_format: (request.response_format == ResponseFormat::Json)
                .then_some(WireResponseFormat {
                    format_type: "json_object",
                }),
        };

        let started = Instant::now();
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(api_key)
            .json(&wire)
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        if status == 429 {
            return Err(LlmError::RateLimited { status });
        }
        if status >= 500 {
            return Err(LlmError::Server {
                status,
                message: body.chars().take(300).collect(),
            });
        }
        if status >= 400 {
            return Err(LlmError::Client {
                status,
                message: body.chars().take(300).collect(),
            });
        }

        let parsed: WireResponse = serde_json::from_str(&body)
            .map_err(|e| LlmError::Transport(format!("malformed completion body: {e}")))?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        Ok(Generation {
            text,
            metrics: LlmMetrics {
                tokens_input: parsed.usage.prompt_tokens,
                tokens_output: parsed.usage.completion_tokens,
                cost: estimate_cost(parsed.usage.prompt_tokens, parsed.usage.completion_tokens),
                latency_ms: started.elapsed().as_millis() as u64,
                model: if parsed.model.is_empty() {
                    model.to_string()
                } else {
                    parsed.model
                },
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChatMessage;
    use medic_config::LlmConfig;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider_for(server: &MockServer) -> OpenAiCompatProvider {
        OpenAiCompatProvider::from_config(&LlmConfig {
            provider: "openai_compatible".into(),
            model: "gpt-test".into(),
            timeout_secs: 30,
            base_url: Some(server.uri()),
            api_key: Some("sk-test".into()),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_successful_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "npm install lodash"}}],
                "usage": {"prompt_tokens": 12, "completion_tokens": 4},
                "model": "gpt-test"
            })))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let generation = provider
            .generate(&GenerateRequest {
                messages: vec![ChatMessage::user("suggest the fix command")],
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(generation.text, "npm install lodash");
        assert_eq!(generation.metrics.tokens_input, 12);
        assert_eq!(generation.metrics.model, "gpt-test");
    }

    #[tokio::test]
    async fn test_rate_limit_maps_to_typed_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let err = provider
            .generate(&GenerateRequest {
                messages: vec![ChatMessage::user("hi")],
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::RateLimited { status: 429 }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_client_error_not_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such model"))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let err = provider
            .generate(&GenerateRequest {
                messages: vec![ChatMessage::user("hi")],
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Client { status: 404, .. }));
        assert!(!err.is_retryable());
    }
}
