//! Backend client: transport to the text-generation host.
//!
//! The gateway speaks to one backend kind: a local model host with an
//! Ollama-compatible HTTP API (generate, tags, health). The [`BackendClient`]
//! trait is the seam the pipeline depends on, so tests can stub generation
//! without a network.
//!
//! Retries live entirely in this module; higher layers never double-retry.

pub mod ollama;
pub mod retry;

use async_trait::async_trait;

pub use ollama::OllamaClient;

/// Effective decoding options forwarded to the backend.
#[derive(Debug, Clone)]
pub struct GenerationOptions {
    pub temperature: f64,
    pub max_tokens: u32,
    pub top_p: f64,
    pub top_k: u32,
    pub repeat_penalty: f64,
    pub stop: Vec<String>,
    pub seed: Option<i64>,
}

impl GenerationOptions {
    pub fn from_request(request: &crate::api_types::GenerationRequest) -> Self {
        Self {
            temperature: request.effective_temperature(),
            max_tokens: request.effective_max_tokens(),
            top_p: request.effective_top_p(),
            top_k: request.effective_top_k(),
            repeat_penalty: request.effective_repeat_penalty(),
            stop: request.stop.clone(),
            seed: request.seed,
        }
    }
}

/// A completed generation as reported by the backend. Token counts are
/// `None` when the backend omits them; the pipeline tolerates that.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub text: String,
    /// Backend-reported model identifier.
    pub model: String,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
}

/// Backend failure, classified for the error taxonomy.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// Connection failures, timeouts, and 5xx with the retry budget spent.
    #[error("transient backend failure: {0}")]
    Transient(String),

    /// 4xx (except 429): the request itself is bad for this backend.
    #[error("backend rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The total wall-clock deadline across attempts expired.
    #[error("backend deadline exceeded")]
    DeadlineExceeded,
}

/// Transport contract the pipeline depends on. Implementations must be
/// concurrency-safe and must not serialize unrelated requests.
#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<GenerationResult, BackendError>;

    /// Names of the models the backend currently serves.
    async fn list_models(&self) -> Result<Vec<String>, BackendError>;

    /// Cheap reachability probe for readiness.
    async fn health(&self) -> bool;
}
