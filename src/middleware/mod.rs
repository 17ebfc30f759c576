//! Request middleware: admission and rate limiting.
//!
//! Every generation route passes through here before the pipeline. The
//! order is fixed (authenticate first, then charge the key's token bucket)
//! so an unauthorized caller can never drain a bucket.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::{error::GatewayError, routes::AppState};

/// Header carrying the quota identity.
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Validate the API key and charge the rate limiter; the quota identity is
/// attached to the request for handlers that want it.
pub async fn admission_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let presented = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(GatewayError::Unauthorized)?;

    let identity = state
        .admission
        .authenticate(presented)
        .ok_or(GatewayError::Unauthorized)?;

    state.limiter.check(identity.as_str())?;

    tracing::trace!(identity = %identity.as_str(), "Request admitted");
    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}
