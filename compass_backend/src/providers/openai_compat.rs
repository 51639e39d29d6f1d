use std::collections::VecDeque;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use super::{ChunkStream, CompletionProvider, Message, ProviderKind};
use crate::config::ProviderSettings;

/// Chat-completions client for an OpenAI-compatible endpoint.
#[derive(Clone)]
pub struct OpenAiCompatProvider {
    kind: ProviderKind,
    api_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

impl OpenAiCompatProvider {
    /// Returns `None` when the settings carry no usable API key.
    pub fn from_settings(
        kind: ProviderKind,
        settings: &ProviderSettings,
        client: reqwest::Client,
    ) -> Option<Self> {
        let api_key = settings.credential()?.to_string();
        Some(Self {
            kind,
            api_url: settings.api_url.trim_end_matches('/').to_string(),
            api_key,
            model: settings.model.clone(),
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
            client,
        })
    }

    async fn send(&self, messages: &[Message], stream: bool) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.api_url);
        let request = ChatCompletionRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream,
        };

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .with_context(|| format!("Failed to send {} request", self.kind))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("{} API returned error {}: {}", self.kind, status, body);
        }

        Ok(response)
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompatProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn complete(&self, messages: &[Message]) -> Result<String> {
        let completion: ChatCompletionResponse = self
            .send(messages, false)
            .await?
            .json()
            .await
            .with_context(|| format!("Failed to parse {} response", self.kind))?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| anyhow!("No response from {}", self.kind))
    }

    async fn complete_stream(&self, messages: &[Message]) -> Result<ChunkStream> {
        let response = self.send(messages, true).await?;
        Ok(chunk_stream(response))
    }
}

struct StreamState {
    response: reqwest::Response,
    decoder: SseDecoder,
    pending: VecDeque<Result<String>>,
    finished: bool,
}

fn chunk_stream(response: reqwest::Response) -> ChunkStream {
    let state = StreamState {
        response,
        decoder: SseDecoder::default(),
        pending: VecDeque::new(),
        finished: false,
    };

    futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }
            match state.response.chunk().await {
                Ok(Some(bytes)) => {
                    let decoded = state.decoder.feed(&bytes);
                    state.finished = decoded.done || decoded.failed;
                    state.pending.extend(decoded.items);
                }
                Ok(None) => {
                    let decoded = state.decoder.finish();
                    state.pending.extend(decoded.items);
                    state.finished = true;
                }
                Err(e) => {
                    state
                        .pending
                        .push_back(Err(anyhow!(e).context("Failed reading streaming chunk")));
                    state.finished = true;
                }
            }
        }
    })
    .boxed()
}

/// Output of one decoder step.
#[derive(Debug, Default)]
pub(crate) struct Decoded {
    pub items: Vec<Result<String>>,
    /// The upstream sent `[DONE]`.
    pub done: bool,
    /// A payload failed to parse; nothing after it is trusted.
    pub failed: bool,
}

/// Incremental decoder for the `data:` lines of an upstream completion stream.
///
/// Bytes are buffered until a full line arrives, so a multi-byte character
/// split across network chunks is decoded whole.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    line_buffer: Vec<u8>,
    closed: bool,
}

impl SseDecoder {
    pub fn feed(&mut self, bytes: &[u8]) -> Decoded {
        let mut decoded = Decoded::default();
        if self.closed {
            return decoded;
        }
        self.line_buffer.extend_from_slice(bytes);

        while let Some(newline_idx) = self.line_buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.line_buffer.drain(..=newline_idx).collect();
            self.decode_raw_line(&line, &mut decoded);
            if decoded.done || decoded.failed {
                self.closed = true;
                self.line_buffer.clear();
                break;
            }
        }
        decoded
    }

    /// Flush a trailing line that arrived without a newline.
    pub fn finish(&mut self) -> Decoded {
        let mut decoded = Decoded::default();
        if self.closed {
            return decoded;
        }
        let line = std::mem::take(&mut self.line_buffer);
        self.decode_raw_line(&line, &mut decoded);
        self.closed = true;
        decoded
    }

    fn decode_raw_line(&self, line: &[u8], decoded: &mut Decoded) {
        match std::str::from_utf8(line) {
            Ok(text) => self.decode_line(text.trim(), decoded),
            Err(e) => {
                decoded
                    .items
                    .push(Err(anyhow!(e).context("Stream line is not valid UTF-8")));
                decoded.failed = true;
            }
        }
    }

    fn decode_line(&self, line: &str, decoded: &mut Decoded) {
        if line.is_empty() || line.starts_with(':') {
            return;
        }
        let Some(payload) = line.strip_prefix("data:") else {
            return;
        };
        let payload = payload.trim();
        if payload == "[DONE]" {
            decoded.done = true;
            return;
        }

        match extract_delta(payload) {
            Ok(Some(delta)) => decoded.items.push(Ok(delta)),
            Ok(None) => {}
            Err(e) => {
                decoded.items.push(Err(e));
                decoded.failed = true;
            }
        }
    }
}

fn extract_delta(payload: &str) -> Result<Option<String>> {
    let chunk_json: serde_json::Value = serde_json::from_str(payload)
        .with_context(|| format!("Failed to parse stream payload: {}", payload))?;

    let Some(choice) = chunk_json["choices"].as_array().and_then(|arr| arr.first()) else {
        return Ok(None);
    };

    Ok(choice["delta"]["content"]
        .as_str()
        .filter(|content| !content.is_empty())
        .map(str::to_string))
}
