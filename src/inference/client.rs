//! LLM backends behind a trait. The production backend speaks the
//! OpenAI-compatible streaming API that the local llama.cpp-style
//! server exposes; tests use a scripted backend.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::InferenceError;

/// What a call is for. Budgets and prompts differ per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferKind {
    Chat,
    Extract,
    Classify,
    VisionOcr,
}

impl InferKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Extract => "extract",
            Self::Classify => "classify",
            Self::VisionOcr => "vision_ocr",
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub kind: InferKind,
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    /// Whether the system-prompt prefix was served from cache.
    pub cached_prefix: bool,
}

/// Events on a token stream. `Done` and `Cancelled` are terminal.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Token(String),
    Done(Usage),
    Cancelled,
    Failed(String),
}

/// Receiver half of a generation stream.
#[derive(Debug)]
pub struct TokenStream {
    rx: mpsc::Receiver<StreamEvent>,
}

impl TokenStream {
    pub fn new(rx: mpsc::Receiver<StreamEvent>) -> Self {
        Self { rx }
    }

    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Drain to completion, concatenating tokens.
    pub async fn collect_text(mut self) -> Result<(String, Usage), InferenceError> {
        let mut text = String::new();
        while let Some(event) = self.next_event().await {
            match event {
                StreamEvent::Token(t) => text.push_str(&t),
                StreamEvent::Done(usage) => return Ok((text, usage)),
                StreamEvent::Cancelled => return Err(InferenceError::Cancelled),
                StreamEvent::Failed(reason) => {
                    return Err(InferenceError::Transient(reason));
                }
            }
        }
        Err(InferenceError::Transient("stream ended without completion".into()))
    }
}

#[async_trait]
pub trait LlmBackend: Send + Sync {
    fn model_id(&self) -> String;

    /// Start a generation; tokens arrive on the returned stream in
    /// generation order.
    async fn generate(&self, request: GenerateRequest) -> Result<TokenStream, InferenceError>;

    /// Cheap liveness probe used on startup and after a swap.
    async fn probe(&self) -> Result<(), InferenceError>;
}

// ── HTTP backend ────────────────────────────────────────────

pub struct HttpLlmBackend {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl HttpLlmBackend {
    pub fn new(base_url: &str, model: &str) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()
            .expect("HTTP client");
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client,
        }
    }
}

#[derive(Deserialize)]
struct ChatChunk {
    choices: Vec<ChunkChoice>,
    usage: Option<ChunkUsage>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    delta: Option<ChunkDelta>,
}

#[derive(Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChunkUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[async_trait]
impl LlmBackend for HttpLlmBackend {
    fn model_id(&self) -> String {
        self.model.clone()
    }

    async fn generate(&self, request: GenerateRequest) -> Result<TokenStream, InferenceError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "stream": true,
            "max_tokens": request.max_tokens,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.prompt },
            ],
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| InferenceError::Transient(e.to_string()))?;

        if !response.status().is_success() {
            return Err(InferenceError::Transient(format!(
                "inference endpoint returned {}",
                response.status()
            )));
        }

        let (tx, rx) = mpsc::channel::<StreamEvent>(64);
        let approx_prompt = (request.system.len() + request.prompt.len()) as u32 / 4;

        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut usage = Usage {
                prompt_tokens: approx_prompt,
                completion_tokens: 0,
                cached_prefix: false,
            };

            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(StreamEvent::Failed(e.to_string())).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                // SSE framing: one `data: {json}` payload per line.
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);

                    let Some(payload) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if payload == "[DONE]" {
                        let _ = tx.send(StreamEvent::Done(usage.clone())).await;
                        return;
                    }
                    if let Ok(parsed) = serde_json::from_str::<ChatChunk>(payload) {
                        if let Some(u) = parsed.usage {
                            usage.prompt_tokens = u.prompt_tokens;
                            usage.completion_tokens = u.completion_tokens;
                        }
                        if let Some(content) = parsed
                            .choices
                            .first()
                            .and_then(|c| c.delta.as_ref())
                            .and_then(|d| d.content.clone())
                        {
                            usage.completion_tokens += 1;
                            if tx.send(StreamEvent::Token(content)).await.is_err() {
                                return; // caller went away
                            }
                        }
                    }
                }
            }

            let _ = tx.send(StreamEvent::Done(usage)).await;
        });

        Ok(TokenStream::new(rx))
    }

    async fn probe(&self) -> Result<(), InferenceError> {
        let url = format!("{}/v1/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(std::time::Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| InferenceError::Transient(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(InferenceError::Transient(format!(
                "probe returned {}",
                response.status()
            )))
        }
    }
}

// ── Scripted backend (tests, dry runs) ──────────────────────

/// Deterministic backend that replays a fixed response per call kind,
/// one whitespace-token at a time.
pub struct ScriptedBackend {
    model: String,
    responses: std::collections::HashMap<InferKind, String>,
    fail_first: std::sync::atomic::AtomicU32,
    pub calls: std::sync::atomic::AtomicU32,
}

impl ScriptedBackend {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            responses: std::collections::HashMap::new(),
            fail_first: std::sync::atomic::AtomicU32::new(0),
            calls: std::sync::atomic::AtomicU32::new(0),
        }
    }

    pub fn with_response(mut self, kind: InferKind, response: &str) -> Self {
        self.responses.insert(kind, response.to_string());
        self
    }

    /// Make the first `n` generate calls fail transiently (retry tests).
    pub fn failing_first(self, n: u32) -> Self {
        self.fail_first.store(n, std::sync::atomic::Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl LlmBackend for ScriptedBackend {
    fn model_id(&self) -> String {
        self.model.clone()
    }

    async fn generate(&self, request: GenerateRequest) -> Result<TokenStream, InferenceError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);

        let remaining = self.fail_first.load(std::sync::atomic::Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first
                .store(remaining - 1, std::sync::atomic::Ordering::SeqCst);
            return Err(InferenceError::Transient("scripted stall".into()));
        }

        let response = self
            .responses
            .get(&request.kind)
            .cloned()
            .unwrap_or_else(|| "ok".to_string());

        let (tx, rx) = mpsc::channel::<StreamEvent>(64);
        let prompt_tokens = (request.system.len() + request.prompt.len()) as u32 / 4;

        tokio::spawn(async move {
            let mut completion_tokens = 0;
            for token in response.split_inclusive(' ') {
                completion_tokens += 1;
                if tx.send(StreamEvent::Token(token.to_string())).await.is_err() {
                    return;
                }
                // Yield between tokens so concurrent streams interleave.
                tokio::task::yield_now().await;
            }
            let _ = tx
                .send(StreamEvent::Done(Usage {
                    prompt_tokens,
                    completion_tokens,
                    cached_prefix: false,
                }))
                .await;
        });

        Ok(TokenStream::new(rx))
    }

    async fn probe(&self) -> Result<(), InferenceError> {
        Ok(())
    }
}
