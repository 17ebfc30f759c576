//! Gateway error taxonomy.
//!
//! Every failure a client can observe is one of the kinds below. The pipeline
//! surfaces these as structured outcomes; the single-flight machinery clones
//! the same outcome to every waiter, so the type is `Clone`. Retries happen
//! only inside the backend client; by the time an error reaches this type,
//! the retry budget is already spent.

use axum::{
    Json,
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use crate::observability::metrics;

/// Structured gateway error, mapped to an HTTP status and a stable `kind`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// Request violates the payload constraints. Never retried, never cached.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Missing or unknown API key.
    #[error("invalid or missing API key")]
    Unauthorized,

    /// Per-key token bucket exhausted.
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// The router cannot resolve the model, or its health is bad.
    #[error("model '{model}' is not available")]
    ModelUnavailable { model: String },

    /// Transient backend failure with the retry budget exhausted.
    #[error("backend error: {0}")]
    BackendError(String),

    /// The backend rejected the request outright (4xx, not 429).
    #[error("backend rejected request ({status}): {message}")]
    BackendRejected { status: u16, message: String },

    /// Overall deadline exceeded.
    #[error("deadline exceeded during {stage}")]
    Timeout { stage: &'static str },

    /// Invariant violation. Logged with full context, reported opaquely.
    #[error("internal error")]
    Internal(String),
}

impl GatewayError {
    /// Stable machine-readable kind, used in response bodies and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Unauthorized => "unauthorized",
            Self::RateLimited { .. } => "rate_limited",
            Self::ModelUnavailable { .. } => "model_unavailable",
            Self::BackendError(_) => "backend_error",
            Self::BackendRejected { .. } => "backend_error",
            Self::Timeout { .. } => "timeout",
            Self::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::ModelUnavailable { .. } => StatusCode::NOT_FOUND,
            Self::BackendError(_) | Self::BackendRejected { .. } => StatusCode::BAD_GATEWAY,
            Self::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether a negative cache entry may be written for this outcome.
    ///
    /// Only deterministic rejections qualify; transient failures and
    /// timeouts must never be cached.
    pub fn is_negative_cacheable(&self) -> bool {
        matches!(self, Self::BackendRejected { .. })
    }
}

/// Wire shape for error responses: `{"error": {"kind", "message", "retry_after"}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ErrorResponse {
    pub fn from_error(err: &GatewayError) -> Self {
        let message = match err {
            // Internal details stay in the logs.
            GatewayError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        Self {
            error: ErrorBody {
                kind: err.kind().to_string(),
                message,
                retry_after: match err {
                    GatewayError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
                    _ => None,
                },
            },
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        if let GatewayError::Internal(detail) = &self {
            tracing::error!(detail = %detail, "Internal gateway error");
        }
        metrics::record_gateway_error(self.kind());

        let status = self.status_code();
        let body = ErrorResponse::from_error(&self);
        let mut response = (status, Json(body)).into_response();

        if let GatewayError::RateLimited { retry_after_secs } = self
            && let Ok(v) = HeaderValue::try_from(retry_after_secs.to_string())
        {
            response.headers_mut().insert("Retry-After", v);
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_and_status_codes_line_up() {
        let cases: [(GatewayError, &str, StatusCode); 8] = [
            (
                GatewayError::Validation("empty prompt".into()),
                "validation",
                StatusCode::BAD_REQUEST,
            ),
            (
                GatewayError::Unauthorized,
                "unauthorized",
                StatusCode::UNAUTHORIZED,
            ),
            (
                GatewayError::RateLimited {
                    retry_after_secs: 3,
                },
                "rate_limited",
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                GatewayError::ModelUnavailable {
                    model: "ghost".into(),
                },
                "model_unavailable",
                StatusCode::NOT_FOUND,
            ),
            (
                GatewayError::BackendError("connect refused".into()),
                "backend_error",
                StatusCode::BAD_GATEWAY,
            ),
            (
                GatewayError::BackendRejected {
                    status: 400,
                    message: "bad prompt".into(),
                },
                "backend_error",
                StatusCode::BAD_GATEWAY,
            ),
            (
                GatewayError::Timeout { stage: "backend" },
                "timeout",
                StatusCode::REQUEST_TIMEOUT,
            ),
            (
                GatewayError::Internal("bug".into()),
                "internal",
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, kind, status) in cases {
            assert_eq!(err.kind(), kind);
            assert_eq!(err.status_code(), status);
        }
    }

    #[test]
    fn internal_detail_not_exposed() {
        let err = GatewayError::Internal("secret stack detail".into());
        let body = ErrorResponse::from_error(&err);
        assert_eq!(body.error.message, "internal error");
    }

    #[test]
    fn rate_limited_carries_retry_after() {
        let err = GatewayError::RateLimited {
            retry_after_secs: 5,
        };
        let body = ErrorResponse::from_error(&err);
        assert_eq!(body.error.retry_after, Some(5));
    }

    #[test]
    fn only_rejections_are_negative_cacheable() {
        assert!(
            GatewayError::BackendRejected {
                status: 422,
                message: "malformed".into()
            }
            .is_negative_cacheable()
        );
        assert!(!GatewayError::BackendError("timeout".into()).is_negative_cacheable());
        assert!(!GatewayError::Timeout { stage: "backend" }.is_negative_cacheable());
        assert!(
            !GatewayError::ModelUnavailable {
                model: "m".into()
            }
            .is_negative_cacheable()
        );
    }
}
