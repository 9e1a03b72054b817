//! Chat-completion client, streaming decoder, and the shared rate limiter.

use crate::config::ModelConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Inline image attached to a user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagePart {
    /// `data:image/jpeg;base64,...`
    pub data_url: String,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub text: String,
    #[serde(default)]
    pub images: Vec<ImagePart>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            text: text.into(),
            images: Vec::new(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            images: Vec::new(),
        }
    }

    /// Attach a low-detail image.
    pub fn with_image(mut self, data_url: impl Into<String>) -> Self {
        self.images.push(ImagePart {
            data_url: data_url.into(),
            detail: "low".into(),
        });
        self
    }

    fn to_wire(&self) -> Value {
        if self.images.is_empty() {
            return json!({ "role": self.role, "content": self.text });
        }
        let mut parts = vec![json!({ "type": "text", "text": self.text })];
        for image in &self.images {
            parts.push(json!({
                "type": "image_url",
                "image_url": { "url": image.data_url, "detail": image.detail },
            }));
        }
        json!({ "role": self.role, "content": parts })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    /// Overrides the client's default model.
    pub model: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Ask the provider for a JSON object response.
    pub json_mode: bool,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            model: None,
            max_tokens: 1500,
            temperature: 0.3,
            json_mode: false,
        }
    }
}

/// Anything that can answer a chat request.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, request: ChatRequest) -> Result<String>;

    /// Stream the answer, calling `on_delta` for each fragment. Returns the
    /// full text. The default delivers the whole answer as one fragment.
    async fn stream(
        &self,
        request: ChatRequest,
        on_delta: &(dyn for<'a> Fn(&'a str) + Send + Sync),
    ) -> Result<String> {
        let text = self.complete(request).await?;
        on_delta(&text);
        Ok(text)
    }
}

static SECRET_RE: OnceLock<Regex> = OnceLock::new();

/// Replace API-key-looking tokens and bearer values with `[REDACTED]`.
pub fn redact_secrets(message: &str) -> String {
    let re = SECRET_RE.get_or_init(|| {
        Regex::new(r"(?i)(\bsk-[A-Za-z0-9_\-]+|\bbearer\s+[A-Za-z0-9_\-\.=]+)").unwrap()
    });
    re.replace_all(message, "[REDACTED]").into_owned()
}

/// Enforces a minimum spacing between calls, across every caller sharing it.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    /// Wait until a call is allowed, then claim the slot.
    pub async fn acquire(&self) {
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// A model behind a shared [`RateLimiter`].
pub struct Throttled {
    inner: Arc<dyn ChatModel>,
    limiter: Arc<RateLimiter>,
}

impl Throttled {
    pub fn new(inner: Arc<dyn ChatModel>, limiter: Arc<RateLimiter>) -> Self {
        Self { inner, limiter }
    }
}

#[async_trait]
impl ChatModel for Throttled {
    async fn complete(&self, request: ChatRequest) -> Result<String> {
        self.limiter.acquire().await;
        self.inner.complete(request).await
    }

    async fn stream(
        &self,
        request: ChatRequest,
        on_delta: &(dyn for<'a> Fn(&'a str) + Send + Sync),
    ) -> Result<String> {
        self.limiter.acquire().await;
        self.inner.stream(request, on_delta).await
    }
}

/// Incremental decoder for `data: {...}` server-sent-event lines.
///
/// Buffers raw bytes so a UTF-8 sequence split across network chunks is
/// decoded only once its line is complete.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    /// Feed raw bytes; returns the content deltas completed by this chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut deltas = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(delta) = Self::decode_line(&String::from_utf8_lossy(&line)) {
                deltas.push(delta);
            }
        }
        deltas
    }

    /// Flush a trailing line that arrived without a newline.
    pub fn finish(&mut self) -> Option<String> {
        let line = std::mem::take(&mut self.buffer);
        Self::decode_line(&String::from_utf8_lossy(&line))
    }

    fn decode_line(line: &str) -> Option<String> {
        let data = line.trim_end().strip_prefix("data:")?.trim();
        if data.is_empty() || data == "[DONE]" {
            return None;
        }
        match serde_json::from_str::<Value>(data) {
            Ok(v) => v["choices"][0]["delta"]["content"]
                .as_str()
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            Err(_) => {
                trace!("sse: skipping undecodable line");
                None
            }
        }
    }
}

/// Client for OpenAI-style `/chat/completions` endpoints (OpenRouter by default).
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
}

impl OpenAiCompatClient {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            model: model.into(),
            api_key: api_key.into(),
        })
    }

    /// Build from config. Fails with [`Error::MissingCredentials`] when no key
    /// is configured.
    pub fn from_config(config: &ModelConfig) -> Result<Self> {
        let key = config.resolve_api_key()?;
        Self::new(
            &config.endpoint,
            &config.model,
            key,
            Duration::from_millis(config.timeout_ms),
        )
    }

    fn body(&self, request: &ChatRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": request.model.as_deref().unwrap_or(&self.model),
            "messages": request.messages.iter().map(ChatMessage::to_wire).collect::<Vec<_>>(),
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "stream": stream,
        });
        if request.json_mode {
            body["response_format"] = json!({ "type": "json_object" });
        }
        body
    }

    fn scrub(&self, message: &str) -> String {
        let message = if self.api_key.is_empty() {
            message.to_string()
        } else {
            message.replace(&self.api_key, "[REDACTED]")
        };
        redact_secrets(&message)
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response> {
        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Model(self.scrub(&e.to_string())))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let text = resp.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
            .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
        Err(Error::Model(self.scrub(&detail)))
    }
}

#[async_trait]
impl ChatModel for OpenAiCompatClient {
    async fn complete(&self, request: ChatRequest) -> Result<String> {
        let body = self.body(&request, false);
        debug!("model: completion request ({} messages)", request.messages.len());
        let resp = self.send(&body).await?;
        let value: Value = resp
            .json()
            .await
            .map_err(|e| Error::Model(self.scrub(&e.to_string())))?;
        value["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::Model("response had no message content".into()))
    }

    async fn stream(
        &self,
        request: ChatRequest,
        on_delta: &(dyn for<'a> Fn(&'a str) + Send + Sync),
    ) -> Result<String> {
        let body = self.body(&request, true);
        debug!("model: streaming request ({} messages)", request.messages.len());
        let resp = self.send(&body).await?;

        let mut decoder = SseDecoder::default();
        let mut full = String::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::Model(self.scrub(&e.to_string())))?;
            for delta in decoder.push(&chunk) {
                on_delta(&delta);
                full.push_str(&delta);
            }
        }
        if let Some(delta) = decoder.finish() {
            on_delta(&delta);
            full.push_str(&delta);
        }
        Ok(full)
    }
}
