//! Default provider: Anthropic-style messages API with SSE streaming.

use async_trait::async_trait;
use futures::StreamExt;
use medic_config::LlmConfig;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::{
    estimate_cost, ChatMessage, GenerateRequest, Generation, LlmError, LlmMetrics, LlmProvider,
    LlmResult, ResponseFormat, Role,
};

const DEFAULT_API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop_sequences: Vec<String>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct WireErrorEnvelope {
    error: WireError,
}

#[derive(Debug, Deserialize)]
struct StreamUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    model: String,
    usage: StreamUsage,
}

#[derive(Debug, Deserialize)]
struct ContentDelta {
    #[serde(rename = "type")]
    delta_type: String,
    #[serde(default)]
    text: String,
}

/// Server-sent events we care about; everything else is ignored.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum StreamEvent {
    #[serde(rename = "message_start")]
    MessageStart { message: StreamMessage },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { delta: ContentDelta },
    #[serde(rename = "message_delta")]
    MessageDelta { usage: Option<StreamUsage> },
    #[serde(rename = "error")]
    Error { error: WireError },
    #[serde(other)]
    Other,
}

/// Anthropic-style provider.
pub struct AnthropicProvider {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
}

impl AnthropicProvider {
    pub fn from_config(config: &LlmConfig) -> Self {
        Self {
            client: Client::new(),
            api_key: config
                .api_key
                .clone()
                .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok()),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            model: config.model.clone(),
        }
    }

    /// Split out the system prompt; the API takes it as a separate field.
    fn convert(messages: &[ChatMessage], json_mode: bool) -> (Option<String>, Vec<WireMessage>) {
        let mut system = None;
        let mut converted = Vec::new();
        for msg in messages {
            match msg.role {
                Role::System => system = Some(msg.content.clone()),
                Role::User => converted.push(WireMessage {
                    role: "user",
                    content: msg.content.clone(),
                }),
                Role::Assistant => converted.push(WireMessage {
                    role: "assistant",
                    content: msg.content.clone(),
                }),
            }
        }
        if json_mode {
            let hint = "Respond with a single valid JSON object and nothing else.";
            system = Some(match system {
                Some(existing) => format!("{existing}\n\n{hint}"),
                None => hint.to_string(),
            });
        }
        (system, converted)
    }

    fn classify_status(status: u16, body: &str) -> LlmError {
        let message = serde_json::from_str::<WireErrorEnvelope>(body)
            .map(|e| format!("{}: {}", e.error.error_type, e.error.message))
            .unwrap_or_else(|_| body.chars().take(300).collect());

        match status {
            429 => LlmError::RateLimited { status },
            s if s >= 500 => LlmError::Server { status: s, message },
            s => LlmError::Client { status: s, message },
        }
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &GenerateRequest) -> LlmResult<Generation> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| LlmError::NotConfigured("ANTHROPIC_API_KEY not set".into()))?;

        let json_mode = request.response_format == ResponseFormat::Json;
        let (system, messages) = Self::convert(&request.messages, json_mode);
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.model.clone());

        let wire = WireRequest {
            model: model.clone(),
            messages,
            max_tokens: request.max_tokens.unwrap_or(4096),
            system,
            temperature: request.temperature,
            stop_sequences: request.stop_sequences.clone(),
            stream: true,
        };

        let started = Instant::now();
        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&wire)
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status.as_u16(), &body));
        }

        let mut text = String::new();
        let mut tokens_input = 0u32;
        let mut tokens_output = 0u32;
        let mut response_model = model;

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| LlmError::Transport(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(event_end) = buffer.find("\n\n") {
                let event_data = buffer[..event_end].to_string();
                buffer.drain(..event_end + 2);

                for line in event_data.lines() {
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data == "[DONE]" {
                        continue;
                    }
                    let Ok(event) = serde_json::from_str::<StreamEvent>(data) else {
                        continue;
                    };
                    match event {
                        StreamEvent::MessageStart { message } => {
                            response_model = message.model;
                            tokens_input = message.usage.input_tokens;
                        }
                        StreamEvent::ContentBlockDelta { delta } => {
                            if delta.delta_type == "text_delta" {
                                text.push_str(&delta.text);
                            }
                        }
                        StreamEvent::MessageDelta { usage: Some(u) } => {
                            tokens_output = u.output_tokens;
                        }
                        StreamEvent::Error { error } => {
                            return Err(LlmError::Server {
                                status: 500,
                                message: format!("{}: {}", error.error_type, error.message),
                            });
                        }
                        _ => {}
                    }
                }
            }
        }

        Ok(Generation {
            text,
            metrics: LlmMetrics {
                tokens_input,
                tokens_output,
                cost: estimate_cost(tokens_input, tokens_output),
                latency_ms: started.elapsed().as_millis() as u64,
                model: response_model,
            },
        })
    }
}
