//! Inference orchestrator (C6).
//!
//! Multiplexes all callers onto one long-lived primary model and an
//! on-demand vision model. A semaphore bounds concurrent slots, a second
//! semaphore meters prompt tokens in flight, and a bounded wait counter
//! turns overflow into `Overloaded` instead of unbounded queueing.
//! Cooperative scheduling only: ordering is guaranteed within a single
//! request's stream, never across requests.

pub mod client;

pub use self::client::{
    GenerateRequest, HttpLlmBackend, InferKind, LlmBackend, ScriptedBackend, StreamEvent,
    TokenStream, Usage,
};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("inference queue full, retry after {retry_after_secs}s")]
    Overloaded { retry_after_secs: u64 },
    #[error("request cancelled")]
    Cancelled,
    #[error("deadline elapsed before completion")]
    DeadlineExceeded,
    #[error("prompt exceeds budget for {kind}: {tokens} > {budget}")]
    PromptTooLarge {
        kind: &'static str,
        tokens: u32,
        budget: u32,
    },
    #[error("vision model unavailable: {0}")]
    VisionUnavailable(String),
    #[error("transient inference fault: {0}")]
    Transient(String),
    #[error("inference failed ({kind}): {reason}")]
    Failed { kind: &'static str, reason: String },
    #[error("model swap failed: {0}")]
    SwapFailed(String),
}

/// Per-kind prompt budgets (tokens, ~4 chars each).
pub fn prompt_budget(kind: InferKind) -> u32 {
    match kind {
        InferKind::Chat => 4096,
        InferKind::Extract => 8192,
        InferKind::Classify => 2048,
        InferKind::VisionOcr => 8192,
    }
}

fn estimate_tokens(request: &GenerateRequest) -> u32 {
    ((request.system.len() + request.prompt.len()) as u32 / 4).max(1)
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Concurrent inference slots (S).
    pub max_sessions: usize,
    /// Callers allowed to wait for a slot before `Overloaded`.
    pub max_queue_depth: usize,
    /// Total prompt tokens in flight (T).
    pub prompt_token_budget: u32,
    /// Unload the vision model after this much idleness.
    pub vision_idle: Duration,
    /// System prompts kept in the prefix cache.
    pub prompt_cache_size: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_sessions: 3,
            max_queue_depth: 50,
            prompt_token_budget: 32_768,
            vision_idle: Duration::from_secs(300),
            prompt_cache_size: 16,
        }
    }
}

/// A completed (non-streaming) inference result.
#[derive(Debug, Clone)]
pub struct Completed {
    pub text: String,
    pub usage: Usage,
}

/// A live stream holding its slot and token reservations until dropped.
pub struct ActiveStream {
    inner: TokenStream,
    deadline: Instant,
    _slot: OwnedSemaphorePermit,
    _tokens: OwnedSemaphorePermit,
}

impl ActiveStream {
    /// Next event, honoring the request deadline. After the deadline the
    /// stream yields `Cancelled` and the slot is released on drop.
    pub async fn next_event(&mut self) -> StreamEvent {
        let now = Instant::now();
        if now >= self.deadline {
            return StreamEvent::Cancelled;
        }
        match tokio::time::timeout(self.deadline - now, self.inner.next_event()).await {
            Ok(Some(event)) => event,
            Ok(None) => StreamEvent::Failed("stream closed".into()),
            Err(_) => StreamEvent::Cancelled,
        }
    }
}

/// Simple LRU of system-prompt hashes standing in for the backend's
/// prefix KV reuse: a hit marks the usage record so TTFT accounting and
/// the cache-size cap behave like the real thing.
struct PromptCache {
    entries: Vec<u64>,
    cap: usize,
}

impl PromptCache {
    fn new(cap: usize) -> Self {
        Self {
            entries: Vec::new(),
            cap,
        }
    }

    fn touch(&mut self, system: &str) -> bool {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(system.as_bytes());
        let key = u64::from_le_bytes(digest[..8].try_into().expect("8 bytes"));

        if let Some(pos) = self.entries.iter().position(|e| *e == key) {
            self.entries.remove(pos);
            self.entries.push(key);
            return true;
        }
        if self.entries.len() >= self.cap {
            self.entries.remove(0);
        }
        self.entries.push(key);
        false
    }
}

type VisionFactory =
    Box<dyn Fn() -> Result<Arc<dyn LlmBackend>, InferenceError> + Send + Sync>;

pub struct InferenceOrchestrator {
    primary: RwLock<Arc<dyn LlmBackend>>,
    vision_factory: VisionFactory,
    vision: tokio::sync::Mutex<Option<(Arc<dyn LlmBackend>, Instant)>>,
    slots: Arc<Semaphore>,
    tokens: Arc<Semaphore>,
    waiting: AtomicUsize,
    prompt_cache: std::sync::Mutex<PromptCache>,
    config: OrchestratorConfig,
}

impl InferenceOrchestrator {
    pub fn new(
        primary: Arc<dyn LlmBackend>,
        vision_factory: VisionFactory,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            primary: RwLock::new(primary),
            vision_factory,
            vision: tokio::sync::Mutex::new(None),
            slots: Arc::new(Semaphore::new(config.max_sessions)),
            tokens: Arc::new(Semaphore::new(config.prompt_token_budget as usize)),
            waiting: AtomicUsize::new(0),
            prompt_cache: std::sync::Mutex::new(PromptCache::new(config.prompt_cache_size)),
            config,
        }
    }

    pub fn current_model(&self) -> String {
        // try_read never blocks long: writers hold the lock only for the
        // handle swap itself.
        self.primary
            .try_read()
            .map(|b| b.model_id())
            .unwrap_or_else(|_| "swapping".into())
    }

    /// Queue saturation, the pipeline's backpressure signal.
    pub fn is_saturated(&self) -> bool {
        self.slots.available_permits() == 0
            && self.waiting.load(Ordering::SeqCst) >= self.config.max_queue_depth
    }

    /// Streaming inference (chat). The stream owns its reservations.
    pub async fn infer_stream(
        &self,
        request: GenerateRequest,
        deadline: Duration,
    ) -> Result<ActiveStream, InferenceError> {
        let (slot, tokens) = self.admit(&request, deadline).await?;
        let backend = self.backend_for(request.kind).await?;

        let stream = self.generate_with_retry(&*backend, request).await?;
        Ok(ActiveStream {
            inner: stream,
            deadline: Instant::now() + deadline,
            _slot: slot,
            _tokens: tokens,
        })
    }

    /// Completed inference (extract / classify / vision OCR).
    pub async fn infer(
        &self,
        request: GenerateRequest,
        deadline: Duration,
    ) -> Result<Completed, InferenceError> {
        let kind = request.kind;
        let (_slot, _tokens) = self.admit(&request, deadline).await?;
        let backend = self.backend_for(kind).await?;

        let stream = self.generate_with_retry(&*backend, request).await?;
        let collected = tokio::time::timeout(deadline, stream.collect_text())
            .await
            .map_err(|_| InferenceError::DeadlineExceeded)?;

        if kind == InferKind::VisionOcr {
            self.touch_vision().await;
        }

        match collected {
            Ok((text, usage)) => Ok(Completed { text, usage }),
            Err(InferenceError::Cancelled) => Err(InferenceError::Cancelled),
            Err(e) => Err(InferenceError::Failed {
                kind: kind.as_str(),
                reason: e.to_string(),
            }),
        }
    }

    /// Drain in-flight work, swap the primary handle, probe liveness.
    pub async fn swap_to(&self, new_backend: Arc<dyn LlmBackend>) -> Result<(), InferenceError> {
        // Taking every slot waits out in-flight requests and blocks new
        // admissions until the swap completes.
        let drained = self
            .slots
            .acquire_many(self.config.max_sessions as u32)
            .await
            .map_err(|_| InferenceError::SwapFailed("slot semaphore closed".into()))?;

        new_backend
            .probe()
            .await
            .map_err(|e| InferenceError::SwapFailed(format!("probe failed: {e}")))?;

        let old_model = {
            let mut primary = self.primary.write().await;
            let old = primary.model_id();
            *primary = new_backend;
            old
        };
        drop(drained);

        tracing::info!(old = %old_model, new = %self.current_model(), "Model swapped");
        Ok(())
    }

    /// Drop the vision handle if it has been idle past the window.
    pub async fn unload_idle_vision(&self) {
        let mut vision = self.vision.lock().await;
        if let Some((_, last_used)) = vision.as_ref() {
            if last_used.elapsed() >= self.config.vision_idle {
                *vision = None;
                tracing::info!("Vision model unloaded after idle window");
            }
        }
    }

    // ── internals ───────────────────────────────────────────

    async fn admit(
        &self,
        request: &GenerateRequest,
        deadline: Duration,
    ) -> Result<(OwnedSemaphorePermit, OwnedSemaphorePermit), InferenceError> {
        let estimate = estimate_tokens(request);
        let budget = prompt_budget(request.kind);
        if estimate > budget {
            return Err(InferenceError::PromptTooLarge {
                kind: request.kind.as_str(),
                tokens: estimate,
                budget,
            });
        }

        // FIFO wait up to the queue bound; beyond it callers are shed
        // immediately with a retry hint.
        let would_wait = self.slots.available_permits() == 0;
        if would_wait && self.waiting.load(Ordering::SeqCst) >= self.config.max_queue_depth {
            return Err(InferenceError::Overloaded {
                retry_after_secs: 5,
            });
        }
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let result = tokio::time::timeout(deadline, async {
            let slot = self
                .slots
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| InferenceError::Cancelled)?;
            let tokens = self
                .tokens
                .clone()
                .acquire_many_owned(estimate)
                .await
                .map_err(|_| InferenceError::Cancelled)?;
            Ok::<_, InferenceError>((slot, tokens))
        })
        .await;
        self.waiting.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(inner) => inner,
            Err(_) => Err(InferenceError::DeadlineExceeded),
        }
    }

    async fn backend_for(&self, kind: InferKind) -> Result<Arc<dyn LlmBackend>, InferenceError> {
        if kind != InferKind::VisionOcr {
            return Ok(self.primary.read().await.clone());
        }

        let mut vision = self.vision.lock().await;
        if let Some((backend, _)) = vision.as_ref() {
            let backend = backend.clone();
            *vision = Some((backend.clone(), Instant::now()));
            return Ok(backend);
        }

        // Lazy load; failure affects only vision calls.
        match (self.vision_factory)() {
            Ok(backend) => {
                tracing::info!(model = %backend.model_id(), "Vision model loaded");
                *vision = Some((backend.clone(), Instant::now()));
                Ok(backend)
            }
            Err(e) => Err(InferenceError::VisionUnavailable(e.to_string())),
        }
    }

    async fn touch_vision(&self) {
        let mut vision = self.vision.lock().await;
        if let Some((backend, _)) = vision.take() {
            *vision = Some((backend, Instant::now()));
        }
    }

    async fn generate_with_retry(
        &self,
        backend: &dyn LlmBackend,
        mut request: GenerateRequest,
    ) -> Result<TokenStream, InferenceError> {
        {
            let mut cache = self.prompt_cache.lock().expect("cache lock");
            if cache.touch(&request.system) {
                tracing::trace!("System prompt prefix cache hit");
            }
        }

        match backend.generate(request.clone()).await {
            Ok(stream) => Ok(stream),
            Err(InferenceError::Transient(first)) => {
                let jitter = rand::thread_rng().gen_range(50..250);
                tokio::time::sleep(Duration::from_millis(jitter)).await;
                tracing::warn!(reason = %first, "Transient inference fault, retrying once");
                request.max_tokens = request.max_tokens.max(1);
                backend.generate(request).await.map_err(|e| match e {
                    InferenceError::Transient(second) => InferenceError::Failed {
                        kind: "generate",
                        reason: second,
                    },
                    other => other,
                })
            }
            Err(other) => Err(other),
        }
    }
}
