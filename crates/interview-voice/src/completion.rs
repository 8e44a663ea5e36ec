//! AI completion collaborator: conversation history + role context in, reply text out.
//!
//! [`OpenAiCompletion`] talks to any OpenAI-compatible `/chat/completions` endpoint, either
//! as one JSON response or as an SSE stream whose deltas are concatenated into the reply.

use crate::config::CompletionConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::transcript::ChatMessage;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    /// Finalized transcript, oldest first.
    pub messages: Vec<ChatMessage>,
    /// Interviewer persona, role and interview type; sent as the system message.
    pub role_context: String,
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> VoiceResult<String>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    content: Option<String>,
}

/// Streaming chunk (SSE `data:` payload).
#[derive(Deserialize, Debug)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize, Debug)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// One parsed line of a chat-completions SSE stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine {
    Delta(String),
    Done,
    /// Blank lines, comments, role-only deltas and unparseable payloads.
    Ignore,
}

/// Parse a single SSE line (`data: {...}` or `data: [DONE]`).
pub fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.trim().strip_prefix("data:") else {
        return SseLine::Ignore;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }
    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .filter(|c| !c.is_empty())
            .map(SseLine::Delta)
            .unwrap_or(SseLine::Ignore),
        Err(e) => {
            debug!("Completion: failed to parse SSE chunk: {} - data: {}", e, data);
            SseLine::Ignore
        }
    }
}

/// OpenAI-compatible chat completions client.
#[derive(Clone)]
pub struct OpenAiCompletion {
    config: CompletionConfig,
    client: reqwest::Client,
}

impl OpenAiCompletion {
    pub fn new(config: CompletionConfig) -> VoiceResult<Self> {
        if config.api_key.is_empty() {
            return Err(VoiceError::Config(
                "completion requires COMPLETION_API_KEY or OPENAI_API_KEY".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { config, client })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.api_url.trim_end_matches('/'))
    }

    fn build_messages(request: CompletionRequest) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        messages.push(ChatMessage {
            role: "system".to_string(),
            content: request.role_context,
        });
        messages.extend(request.messages);
        messages
    }

    async fn send(&self, request: CompletionRequest, stream: bool) -> VoiceResult<reqwest::Response> {
        let body = ChatRequest {
            model: &self.config.model,
            messages: Self::build_messages(request),
            temperature: Some(self.config.temperature),
            max_tokens: Some(self.config.max_tokens),
            stream: stream.then_some(true),
        };
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::Completion(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(VoiceError::Completion(format!("API error ({}): {}", status, error_text)));
        }
        Ok(response)
    }

    async fn complete_batch(&self, request: CompletionRequest) -> VoiceResult<String> {
        let response = self.send(request, false).await?;
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| VoiceError::Completion(format!("malformed response: {}", e)))?;
        Ok(parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }

    async fn complete_stream(&self, request: CompletionRequest) -> VoiceResult<String> {
        let response = self.send(request, true).await?;
        collect_sse(response.bytes_stream()).await
    }
}

/// Concatenate the deltas of an SSE byte stream. Lines are split on raw bytes and decoded only
/// once complete, so a multi-byte character split across network chunks survives intact.
pub async fn collect_sse<S, B, E>(stream: S) -> VoiceResult<String>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    futures::pin_mut!(stream);
    let mut buffer: Vec<u8> = Vec::new();
    let mut reply = String::new();

    'read: while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| VoiceError::Completion(e.to_string()))?;
        buffer.extend_from_slice(chunk.as_ref());
        while let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=newline).collect();
            match decode_line(&line) {
                SseLine::Delta(delta) => reply.push_str(&delta),
                SseLine::Done => break 'read,
                SseLine::Ignore => {}
            }
        }
    }
    if let SseLine::Delta(delta) = decode_line(&buffer) {
        reply.push_str(&delta);
    }
    Ok(reply)
}

fn decode_line(line: &[u8]) -> SseLine {
    match std::str::from_utf8(line) {
        Ok(line) => parse_sse_line(line),
        Err(e) => {
            debug!("Completion: dropping non UTF-8 SSE line: {}", e);
            SseLine::Ignore
        }
    }
}

impl std::fmt::Debug for OpenAiCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompletion").field("config", &self.config).finish()
    }
}

#[async_trait]
impl CompletionClient for OpenAiCompletion {
    async fn complete(&self, request: CompletionRequest) -> VoiceResult<String> {
        info!(model = %self.config.model, messages = request.messages.len(), stream = self.config.stream,
            "Completion: requesting reply");
        let reply = if self.config.stream {
            self.complete_stream(request).await?
        } else {
            self.complete_batch(request).await?
        };
        let reply = reply.trim().to_string();
        if reply.is_empty() {
            return Err(VoiceError::Completion("empty reply".to_string()));
        }
        Ok(reply)
    }
}

/// Canned interviewer replies, served in order and then repeating the last one.
#[derive(Debug)]
pub struct PlaceholderCompletion {
    replies: Vec<String>,
    next: AtomicUsize,
}

impl PlaceholderCompletion {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: replies.into_iter().map(Into::into).collect(),
            next: AtomicUsize::new(0),
        }
    }
}

impl Default for PlaceholderCompletion {
    fn default() -> Self {
        Self::new([
            "Thanks. Can you walk me through a specific example?",
            "What was the outcome, and what would you do differently?",
            "How did you work with your team on that?",
        ])
    }
}

#[async_trait]
impl CompletionClient for PlaceholderCompletion {
    async fn complete(&self, _request: CompletionRequest) -> VoiceResult<String> {
        if self.replies.is_empty() {
            return Err(VoiceError::Completion("no scripted replies".to_string()));
        }
        let i = self.next.fetch_add(1, Ordering::SeqCst).min(self.replies.len() - 1);
        Ok(self.replies[i].clone())
    }
}
