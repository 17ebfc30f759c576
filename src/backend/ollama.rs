//! HTTP client for an Ollama-compatible model host.
//!
//! Endpoints used: `POST /api/generate` (stream disabled), `GET /api/tags`
//! for the model list, and `GET /` for reachability. The per-attempt timeout
//! sits on the `reqwest` client; the total deadline wraps the whole retry
//! loop, so a request can never outlive `total_deadline_secs` regardless of
//! how the attempts are spent.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{
    BackendClient, BackendError, GenerationOptions, GenerationResult,
    retry::with_retry,
};
use crate::{config::BackendConfig, observability::metrics};

pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
    max_retries: u32,
    retry: crate::config::RetryConfig,
    total_deadline: Duration,
}

impl OllamaClient {
    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| BackendError::Transient(format!("failed to build http client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
            retry: config.retry.clone(),
            total_deadline: Duration::from_secs(config.total_deadline_secs),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn generate_inner(
        &self,
        model: &str,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<GenerationResult, BackendError> {
        let request = GenerateRequestBody {
            model,
            prompt,
            stream: false,
            options: WireOptions {
                temperature: options.temperature,
                num_predict: options.max_tokens,
                top_p: options.top_p,
                top_k: options.top_k,
                repeat_penalty: options.repeat_penalty,
                stop: &options.stop,
                seed: options.seed,
            },
        };

        // Pre-serialize so retries clone bytes instead of re-serializing.
        let body = serde_json::to_vec(&request)
            .map_err(|e| BackendError::Transient(format!("request serialization: {e}")))?;
        let url = self.url("/api/generate");

        let started = Instant::now();
        let result = with_retry(self.max_retries, &self.retry, "generate", || async {
            self.http
                .post(&url)
                .header(http::header::CONTENT_TYPE, "application/json")
                .body(body.clone())
                .send()
                .await
        })
        .await;
        metrics::record_backend_request(model, started.elapsed().as_secs_f64());

        let response = result.map_err(|e| BackendError::Transient(e.to_string()))?;
        let status = response.status();
        metrics::record_backend_response(status.as_u16());

        if status.is_success() {
            let parsed: GenerateResponseBody = response
                .json()
                .await
                .map_err(|e| BackendError::Transient(format!("response decode: {e}")))?;
            return Ok(GenerationResult {
                text: parsed.response,
                model: parsed.model,
                prompt_tokens: parsed.prompt_eval_count,
                completion_tokens: parsed.eval_count,
            });
        }

        let message = read_error_message(response).await;
        if status.is_client_error() && status != http::StatusCode::TOO_MANY_REQUESTS {
            Err(BackendError::Rejected {
                status: status.as_u16(),
                message,
            })
        } else {
            // 5xx or a 429 that survived the retry budget.
            Err(BackendError::Transient(format!("{status}: {message}")))
        }
    }
}

#[async_trait]
impl BackendClient for OllamaClient {
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<GenerationResult, BackendError> {
        match tokio::time::timeout(
            self.total_deadline,
            self.generate_inner(model, prompt, options),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    model,
                    deadline_secs = self.total_deadline.as_secs(),
                    "Backend total deadline exceeded"
                );
                Err(BackendError::DeadlineExceeded)
            }
        }
    }

    async fn list_models(&self) -> Result<Vec<String>, BackendError> {
        let response = self
            .http
            .get(self.url("/api/tags"))
            .send()
            .await
            .map_err(|e| BackendError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = read_error_message(response).await;
            return Err(BackendError::Transient(format!("{status}: {message}")));
        }

        let parsed: TagsResponseBody = response
            .json()
            .await
            .map_err(|e| BackendError::Transient(format!("tags decode: {e}")))?;
        Ok(parsed.models.into_iter().map(|m| m.name).collect())
    }

    async fn health(&self) -> bool {
        match self.http.get(self.url("/")).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

/// Ollama error bodies look like `{"error": "..."}`; fall back to raw text.
async fn read_error_message(response: reqwest::Response) -> String {
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorBody>(&body) {
        Ok(parsed) => parsed.error,
        Err(_) if body.is_empty() => "no error detail".to_string(),
        Err(_) => body,
    }
}

#[derive(Serialize)]
struct GenerateRequestBody<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: WireOptions<'a>,
}

#[derive(Serialize)]
struct WireOptions<'a> {
    temperature: f64,
    num_predict: u32,
    top_p: f64,
    top_k: u32,
    repeat_penalty: f64,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    stop: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<i64>,
}

#[derive(Deserialize)]
struct GenerateResponseBody {
    model: String,
    response: String,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[derive(Deserialize)]
struct TagsResponseBody {
    models: Vec<TagModel>,
}

#[derive(Deserialize)]
struct TagModel {
    name: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}
