//! Chat backends
//!
//! Streams completion tokens from an Ollama-compatible `/api/chat` endpoint.
//! The response body is newline-delimited JSON; lines may be split across
//! network chunks, so bytes are buffered until a full line is available.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use parley_config::GenerationConfig;
use parley_core::Message;

use crate::LlmError;

/// LLM configuration
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub model: String,
    /// Base URL, without the `/api` suffix
    pub endpoint: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Whole-request timeout, including the streamed body
    pub timeout: Duration,
    /// How long the server keeps the model loaded between turns
    pub keep_alive: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self::from(&GenerationConfig::default())
    }
}

impl From<&GenerationConfig> for LlmConfig {
    fn from(config: &GenerationConfig) -> Self {
        Self {
            model: config.model.clone(),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            timeout: config.timeout(),
            keep_alive: "5m".to_string(),
        }
    }
}

/// Why a completion ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    /// The token receiver went away
    Cancelled,
}

/// Summary of one streamed completion
#[derive(Debug, Clone)]
pub struct ChatResult {
    pub text: String,
    pub tokens: usize,
    pub time_to_first_token_ms: u64,
    pub total_time_ms: u64,
    pub finish_reason: FinishReason,
}

/// Streaming chat completion
#[async_trait]
pub trait ChatBackend: Send + Sync + 'static {
    /// Stream tokens for `messages` into `tx`. Returns once the model is done
    /// or `tx` is closed.
    async fn stream_chat(
        &self,
        messages: &[Message],
        tx: mpsc::Sender<String>,
    ) -> Result<ChatResult, LlmError>;

    fn model_name(&self) -> &str;
}

/// Splits a byte stream into complete lines
#[derive(Debug, Default)]
pub struct NdjsonLines {
    pending: Vec<u8>,
}

impl NdjsonLines {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and return every line they complete
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line).trim().to_string();
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }

    /// Whatever is left once the stream ends
    pub fn finish(&mut self) -> Option<String> {
        let rest = String::from_utf8_lossy(&std::mem::take(&mut self.pending))
            .trim()
            .to_string();
        (!rest.is_empty()).then_some(rest)
    }
}

#[derive(Clone)]
pub struct OllamaChatBackend {
    client: Client,
    config: LlmConfig,
}

impl OllamaChatBackend {
    pub fn new(config: LlmConfig) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api{}", self.config.endpoint, path)
    }

    fn request(&self, messages: &[Message]) -> OllamaChatRequest {
        OllamaChatRequest {
            model: self.config.model.clone(),
            messages: messages.iter().map(OllamaMessage::from).collect(),
            stream: true,
            options: OllamaOptions {
                temperature: self.config.temperature,
                num_predict: self.config.max_tokens as i32,
            },
            keep_alive: self.config.keep_alive.clone(),
        }
    }

    /// Check whether the server answers
    pub async fn is_available(&self) -> bool {
        self.client
            .get(self.api_url("/tags"))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

#[async_trait]
impl ChatBackend for OllamaChatBackend {
    async fn stream_chat(
        &self,
        messages: &[Message],
        tx: mpsc::Sender<String>,
    ) -> Result<ChatResult, LlmError> {
        let start = Instant::now();
        let mut first_token = None;
        let mut tokens = 0;
        let mut text = String::new();

        let response = self
            .client
            .post(self.api_url("/chat"))
            .json(&self.request(messages))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api(format!("{}: {}", status, body)));
        }

        let finish = |text: String, tokens: usize, first: Option<Duration>, reason| ChatResult {
            text,
            tokens,
            time_to_first_token_ms: first.map(|t| t.as_millis() as u64).unwrap_or(0),
            total_time_ms: start.elapsed().as_millis() as u64,
            finish_reason: reason,
        };

        let mut lines = NdjsonLines::new();
        let mut body = response.bytes_stream();
        let mut done = false;

        while !done {
            let batch = match body.next().await {
                Some(chunk) => lines.push(&chunk?),
                None => {
                    done = true;
                    lines.finish().into_iter().collect()
                }
            };

            for line in batch {
                let chunk: OllamaStreamChunk = serde_json::from_str(&line)
                    .map_err(|e| LlmError::InvalidResponse(format!("{}: {}", e, line)))?;
                if let Some(error) = chunk.error {
                    return Err(LlmError::Api(error));
                }

                if let Some(message) = chunk.message {
                    if !message.content.is_empty() {
                        first_token.get_or_insert_with(|| start.elapsed());
                        tokens += 1;
                        text.push_str(&message.content);
                        if tx.send(message.content).await.is_err() {
                            return Ok(finish(text, tokens, first_token, FinishReason::Cancelled));
                        }
                    }
                }

                if chunk.done {
                    done = true;
                    break;
                }
            }
        }

        tracing::debug!(
            model = %self.config.model,
            tokens,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Chat completion finished"
        );
        Ok(finish(text, tokens, first_token, FinishReason::Stop))
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    options: OllamaOptions,
    keep_alive: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

impl From<&Message> for OllamaMessage {
    fn from(msg: &Message) -> Self {
        Self {
            role: msg.role.as_str().to_string(),
            content: msg.content.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: i32,
}

#[derive(Debug, Deserialize)]
struct OllamaStreamChunk {
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}
