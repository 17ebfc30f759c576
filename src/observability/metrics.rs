//! Prometheus metrics for the gateway.
//!
//! Provides metrics for:
//! - Request counts and end-to-end latency, by model and outcome
//! - Backend latency, retries, and response status classes
//! - Cache events and single-flight coalescing
//! - Rate-limit rejections and token usage
//!
//! Recording goes through free functions so call sites stay one line; the
//! exporter is installed once at startup.

use std::sync::OnceLock;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Global Prometheus handle for the metrics endpoint.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Failed to set up metrics: {0}")]
    Setup(String),
}

/// Install the Prometheus recorder with gateway-appropriate buckets.
pub fn init_metrics() -> Result<(), MetricsError> {
    let builder = PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
            &[
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
            ],
        )
        .map_err(|e| MetricsError::Setup(e.to_string()))?;

    let handle = builder
        .install_recorder()
        .map_err(|e| MetricsError::Setup(e.to_string()))?;

    PROMETHEUS_HANDLE
        .set(handle)
        .map_err(|_| MetricsError::Setup("Metrics already initialized".to_string()))?;

    Ok(())
}

/// Get the Prometheus handle for rendering the scrape endpoint.
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

// ─────────────────────────────────────────────────────────────────────────────
// Metric Recording Functions
// ─────────────────────────────────────────────────────────────────────────────

/// Record a completed generation request: outcome is the error kind or
/// "success".
pub fn record_request(model: &str, outcome: &str, duration_secs: f64) {
    counter!(
        "gateway_requests_total",
        "model" => model.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!(
        "gateway_request_duration_seconds",
        "model" => model.to_string()
    )
    .record(duration_secs);
}

/// Record one backend generate exchange (all retry attempts included).
pub fn record_backend_request(model: &str, duration_secs: f64) {
    histogram!(
        "backend_request_duration_seconds",
        "model" => model.to_string()
    )
    .record(duration_secs);
}

/// Record the final HTTP status of a backend exchange, by class.
pub fn record_backend_response(status: u16) {
    let status_class = format!("{}xx", status / 100);
    counter!(
        "backend_responses_total",
        "status_class" => status_class
    )
    .increment(1);
}

/// Record one backend retry, by cause (connect, timeout, status_5xx,
/// status_429, request).
pub fn record_backend_retry(cause: &'static str) {
    counter!("backend_retries_total", "cause" => cause).increment(1);
}

/// Record how a request interacted with the cache
/// (hit/miss/refresh/bypass/negative_hit).
pub fn record_cache_status(status: &str) {
    counter!(
        "gateway_cache_events_total",
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a raw cache store operation and its result.
pub fn record_cache_operation(operation: &'static str, result: &'static str) {
    counter!(
        "gateway_cache_operations_total",
        "operation" => operation,
        "result" => result
    )
    .increment(1);
}

/// Record a request that coalesced onto another request's backend call.
pub fn record_singleflight_coalesced() {
    counter!("gateway_singleflight_coalesced_total").increment(1);
}

/// Record a rate-limit rejection.
pub fn record_rate_limited(identity: &str) {
    counter!(
        "gateway_rate_limited_total",
        "identity" => identity.to_string()
    )
    .increment(1);
}

/// Record a client-visible gateway error, by kind.
pub fn record_gateway_error(kind: &'static str) {
    counter!("gateway_errors_total", "kind" => kind).increment(1);
}

/// Record backend-reported token usage.
pub fn record_tokens(model: &str, prompt: Option<u64>, completion: Option<u64>) {
    if let Some(prompt) = prompt {
        counter!(
            "gateway_tokens_total",
            "model" => model.to_string(),
            "kind" => "prompt"
        )
        .increment(prompt);
    }
    if let Some(completion) = completion {
        counter!(
            "gateway_tokens_total",
            "model" => model.to_string(),
            "kind" => "completion"
        )
        .increment(completion);
    }
}

/// Track the number of pipelines currently in flight.
pub fn record_pipeline_started() {
    gauge!("gateway_inflight_pipelines").increment(1.0);
}

pub fn record_pipeline_finished() {
    gauge!("gateway_inflight_pipelines").decrement(1.0);
}
