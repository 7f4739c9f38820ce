//! Chat model clients over OpenAI-compatible chat-completion HTTP APIs
//! (llama-server speaks the same surface). A client built with a token sink
//! streams the completion and forwards every delta in arrival order; a
//! client built without one waits for the full response.

use crate::config::LlmConfig;
use crate::models::ChatMessage;
use crate::orchestrator::{ChatModel, ChatModelProvider, ChatModelSpec, TokenSink};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: usize,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    choices: Vec<ChoiceChunk>,
}

#[derive(Debug, Deserialize)]
struct ChoiceChunk {
    delta: Delta,
}

#[derive(Debug, Deserialize)]
struct Delta {
    content: Option<String>,
}

/// One parsed `data:` line of the backend's SSE stream.
#[derive(Debug, PartialEq)]
enum StreamData {
    Delta(String),
    Done,
}

fn parse_data_line(line: &str) -> Option<StreamData> {
    let json_str = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:"))?;
    let json_str = json_str.trim();

    if json_str == "[DONE]" {
        return Some(StreamData::Done);
    }

    let chunk: ChatCompletionChunk = serde_json::from_str(json_str).ok()?;
    let content = chunk.choices.first()?.delta.content.clone()?;
    if content.is_empty() {
        None
    } else {
        Some(StreamData::Delta(content))
    }
}

/// Builds chat model clients; carries the provider-level defaults a model's
/// catalog config may override.
pub struct LlmFactory {
    client: Client,
    defaults: LlmConfig,
}

impl LlmFactory {
    pub fn new(defaults: LlmConfig) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(defaults.timeout_seconds))
                .build()
                .unwrap_or_else(|_| Client::new()),
            defaults,
        }
    }
}

impl ChatModelProvider for LlmFactory {
    fn build(&self, spec: ChatModelSpec) -> Arc<dyn ChatModel> {
        let base_url = spec
            .config
            .get("base_url")
            .and_then(|v| v.as_str())
            .unwrap_or(&self.defaults.base_url)
            .to_string();

        let max_tokens = spec
            .config
            .get("max_tokens")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(self.defaults.max_tokens);

        // The pipeline already capability-checked the per-bot override.
        let api_key = spec.api_key.or_else(|| self.defaults.api_key.clone());

        Arc::new(LlmClient {
            client: self.client.clone(),
            base_url,
            api_key,
            model: spec.model,
            temperature: spec.temperature,
            max_tokens,
            token_sink: spec.token_sink,
        })
    }
}

pub struct LlmClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
    max_tokens: usize,
    token_sink: Option<TokenSink>,
}

impl LlmClient {
    fn request(&self, messages: Vec<ChatMessage>, stream: bool) -> reqwest::RequestBuilder {
        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            stream,
        };

        let mut builder = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&request);

        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        builder
    }

    async fn complete_streaming(&self, messages: Vec<ChatMessage>, sink: &TokenSink) -> Result<String> {
        debug!("Starting chat stream with model {}", self.model);

        let response = self
            .request(messages, true)
            .send()
            .await
            .context("Failed to call LLM API")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("LLM API error: {} - {}", status, body);
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut answer = String::new();

        'frames: while let Some(frame) = stream.next().await {
            let frame = frame.context("LLM stream error")?;
            buffer.push_str(&String::from_utf8_lossy(&frame));

            // SSE lines may be split across frames; only parse whole lines.
            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim_end_matches('\r').to_string();
                buffer.drain(..=pos);

                match parse_data_line(&line) {
                    Some(StreamData::Done) => break 'frames,
                    Some(StreamData::Delta(content)) => {
                        answer.push_str(&content);
                        // A dropped receiver means the turn was cancelled;
                        // the pipeline handles that, not this client.
                        let _ = sink.send(content);
                    }
                    None => {}
                }
            }
        }

        Ok(answer)
    }

    async fn complete_once(&self, messages: Vec<ChatMessage>) -> Result<String> {
        debug!("Starting chat generation with model {}", self.model);

        let response = self
            .request(messages, false)
            .send()
            .await
            .context("Failed to call LLM API")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("LLM API error: {} - {}", status, body);
        }

        #[derive(Deserialize)]
        struct ChatCompletionResponse {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: Message,
        }
        #[derive(Deserialize)]
        struct Message {
            content: String,
        }

        let chat_response: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse LLM response")?;

        chat_response
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| anyhow::anyhow!("No choices returned from LLM"))
    }
}

#[async_trait]
impl ChatModel for LlmClient {
    async fn complete(&self, messages: Vec<ChatMessage>) -> Result<String> {
        match &self.token_sink {
            Some(sink) => self.complete_streaming(messages, sink).await,
            None => self.complete_once(messages).await,
        }
    }
}
