//! HTTP surface: route handlers and application state.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tower_http::{
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::{
    api_types::{
        BatchGenerateRequest, BatchGenerateResponse, BatchOutcome, GenerateResponse,
        GenerationRequest, ModelInfo, ModelsResponse,
    },
    auth::Admission,
    backend::BackendClient,
    error::{ErrorResponse, GatewayError},
    middleware::admission_middleware,
    observability::metrics,
    pipeline::{RequestPipeline, batch::BatchCoordinator},
    ratelimit::RateLimiter,
    router::ModelRouter,
};

/// Shared application state, cheap to clone into every handler.
#[derive(Clone)]
pub struct AppState {
    pub admission: Arc<Admission>,
    pub limiter: Arc<RateLimiter>,
    pub pipeline: Arc<RequestPipeline>,
    pub batch: Arc<BatchCoordinator>,
    pub router: Arc<ModelRouter>,
    pub backend: Arc<dyn BackendClient>,
}

/// Assemble the application router. `serve_metrics` is false when a
/// dedicated metrics listener is configured.
pub fn build_router(state: AppState, body_limit_bytes: usize, serve_metrics: bool) -> Router {
    let admitted = Router::new()
        .route("/generate", post(generate))
        .route("/batch/generate", post(batch_generate))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            admission_middleware,
        ));

    let mut router = Router::new()
        .merge(admitted)
        .route("/models", get(models))
        .route("/health", get(health))
        .route("/ready", get(ready));

    if serve_metrics {
        router = router.route("/metrics", get(metrics_endpoint));
    }

    router
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(body_limit_bytes))
        .with_state(state)
}

/// Router for the dedicated metrics listener, when one is configured.
pub fn metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics_endpoint))
}

async fn generate(
    State(state): State<AppState>,
    Json(request): Json<GenerationRequest>,
) -> Result<Json<GenerateResponse>, GatewayError> {
    state.pipeline.execute(request).await.map(Json)
}

async fn batch_generate(
    State(state): State<AppState>,
    Json(body): Json<BatchGenerateRequest>,
) -> Result<Json<BatchGenerateResponse>, GatewayError> {
    let results = state.batch.execute(body.requests).await?;

    let responses = results
        .into_iter()
        .map(|result| match result {
            Ok(response) => BatchOutcome::Success(response),
            Err(e) => BatchOutcome::Failure(ErrorResponse::from_error(&e)),
        })
        .collect();

    Ok(Json(BatchGenerateResponse { responses }))
}

async fn models(State(state): State<AppState>) -> Json<ModelsResponse> {
    let snapshot = state.router.snapshot();
    let mut models: Vec<ModelInfo> = snapshot
        .models
        .values()
        .map(|record| ModelInfo {
            name: record
                .backend_name
                .split_once(':')
                .map(|(base, _)| base.to_string())
                .unwrap_or_else(|| record.backend_name.clone()),
            backend_name: record.backend_name.clone(),
            health: record.health.as_str().to_string(),
        })
        .collect();
    models.sort_by(|a, b| a.backend_name.cmp(&b.backend_name));

    Json(ModelsResponse { models })
}

/// Liveness: the process loop is alive if this handler runs at all.
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Readiness: the backend answers its health endpoint and at least one
/// model resolves.
async fn ready(State(state): State<AppState>) -> Response {
    let backend_healthy = state.backend.health().await;
    let model_available = state.router.any_model_available();

    if backend_healthy && model_available {
        (StatusCode::OK, Json(serde_json::json!({ "status": "ready" }))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "backend_healthy": backend_healthy,
                "model_available": model_available,
            })),
        )
            .into_response()
    }
}

async fn metrics_endpoint() -> Response {
    match metrics::prometheus_handle() {
        Some(handle) => handle.render().into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics recorder not installed",
        )
            .into_response(),
    }
}
