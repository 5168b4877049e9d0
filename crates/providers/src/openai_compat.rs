//! OpenAI-compatible chat model.
//!
//! Works with: OpenAI, OpenRouter, Ollama, vLLM and any endpoint exposing
//! `/chat/completions`.
//!
//! Supports:
//! - Non-streaming completions
//! - Streaming completions over SSE (`data:` lines terminated by `[DONE]`)

use async_trait::async_trait;
use chatline_config::ModelConfig;
use chatline_core::error::ModelError;
use chatline_core::model::{ChatModel, ChatTurn, DeltaReceiver};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// A chat model behind an OpenAI-compatible HTTP endpoint.
pub struct OpenAiCompatModel {
    name: String,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
    client: reqwest::Client,
}

impl OpenAiCompatModel {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ModelError::NotConfigured(format!("HTTP client: {e}")))?;

        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            temperature: 0.7,
            max_tokens: 2048,
            stream: true,
            client,
        })
    }

    pub fn from_config(config: &ModelConfig) -> Result<Self, ModelError> {
        let mut model = Self::new(
            config.provider.clone(),
            config.base_url.clone(),
            config.api_key.clone().unwrap_or_default(),
            config.model.clone(),
            config.timeout(),
        )?;
        model.temperature = config.temperature;
        model.max_tokens = config.max_tokens;
        model.stream = config.stream;
        Ok(model)
    }

    fn to_api_messages(turns: &[ChatTurn]) -> Vec<ApiMessage> {
        turns
            .iter()
            .map(|t| ApiMessage {
                role: t.role.as_str().to_string(),
                content: t.content.clone(),
            })
            .collect()
    }

    fn request_body(&self, turns: &[ChatTurn], stream: bool) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "messages": Self::to_api_messages(turns),
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "stream": stream,
        })
    }

    async fn post(&self, turns: &[ChatTurn], stream: bool) -> Result<reqwest::Response, ModelError> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!(provider = %self.name, model = %self.model, stream, "Sending chat request");

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&self.request_body(turns, stream));
        if !self.api_key.is_empty() {
            request = request.header("Authorization", format!("Bearer {}", self.api_key));
        }
        if stream {
            request = request.header("Accept", "text/event-stream");
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ModelError::Timeout(e.to_string())
            } else {
                ModelError::Network(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        if status == 429 {
            return Err(ModelError::RateLimited {
                retry_after_secs: 5,
            });
        }
        if status == 401 || status == 403 {
            return Err(ModelError::AuthenticationFailed(
                "Invalid API key or insufficient permissions".into(),
            ));
        }
        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "Model endpoint returned error");
            return Err(ModelError::ApiError {
                status_code: status,
                message: error_body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatModel for OpenAiCompatModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(&self, turns: &[ChatTurn]) -> Result<String, ModelError> {
        let response = self.post(turns, false).await?;
        let api_response: ApiResponse = response.json().await.map_err(|e| ModelError::ApiError {
            status_code: 200,
            message: format!("Failed to parse response: {e}"),
        })?;
        reply_text(api_response)
    }

    async fn stream_chat(&self, turns: &[ChatTurn]) -> Result<DeltaReceiver, ModelError> {
        if !self.stream {
            let reply = self.chat(turns).await?;
            let (tx, rx) = mpsc::channel(1);
            let _ = tx.send(Ok(reply)).await;
            return Ok(rx);
        }

        let response = self.post(turns, true).await?;
        let (tx, rx) = mpsc::channel(64);
        let provider_name = self.name.clone();

        // Read the SSE byte stream and forward content deltas in order.
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx.send(Err(ModelError::StreamInterrupted(e.to_string()))).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim_end_matches('\r').to_string();
                    buffer.drain(..=line_end);

                    match parse_sse_line(&line) {
                        SseLine::Delta(text) => {
                            if tx.send(Ok(text)).await.is_err() {
                                return; // receiver dropped
                            }
                        }
                        SseLine::Done => return,
                        SseLine::Skip => {}
                        SseLine::Malformed(data) => {
                            trace!(provider = %provider_name, data = %data, "Ignoring unparseable SSE chunk");
                        }
                    }
                }
            }
            debug!(provider = %provider_name, "Stream ended without [DONE]");
        });

        Ok(rx)
    }
}

/// First choice's content, or [`ModelError::EmptyResponse`].
fn reply_text(response: ApiResponse) -> Result<String, ModelError> {
    let content = response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .unwrap_or_default();
    if content.trim().is_empty() {
        return Err(ModelError::EmptyResponse);
    }
    Ok(content)
}

#[derive(Debug, PartialEq, Eq)]
enum SseLine {
    Delta(String),
    Done,
    Skip,
    Malformed(String),
}

/// Classify one line of an SSE body.
fn parse_sse_line(line: &str) -> SseLine {
    // Empty lines separate events; ':' starts a comment.
    if line.is_empty() || line.starts_with(':') {
        return SseLine::Skip;
    }
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }
    match serde_json::from_str::<StreamResponse>(data) {
        Ok(chunk) => match chunk.choices.into_iter().next().and_then(|c| c.delta.content) {
            Some(text) if !text.is_empty() => SseLine::Delta(text),
            _ => SseLine::Skip,
        },
        Err(_) => SseLine::Malformed(data.to_string()),
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    choices: Vec<ApiChoice>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiReply,
}

#[derive(Debug, Deserialize)]
struct ApiReply {
    #[serde(default)]
    content: Option<String>,
}

/// A single SSE `data: {...}` chunk from a streaming response.
#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}
