//! Retry loop for backend HTTP requests.
//!
//! Handles transient failures: connection errors, per-attempt timeouts, 429,
//! and 5xx responses excluding 501 (a Not Implemented backend will not
//! change its mind). Other 4xx responses are returned as-is, never retried.
//!
//! Between attempts the loop sleeps an exponentially growing, jittered,
//! capped delay, except after a 429 carrying a parseable `Retry-After`,
//! which is honored instead. The caller bounds the whole loop with the
//! total deadline.

use http::StatusCode;
use tracing::{debug, warn};

use crate::{config::RetryConfig, observability::metrics};

/// Determines if a reqwest error is retryable.
///
/// Connection errors, timeouts, and other transport-level issues are
/// retryable; anything that reached the server and came back 4xx is not.
pub fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_connect() || error.is_timeout() || error.is_request()
}

/// Whether a response status should be retried.
pub fn should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || (status.is_server_error() && status != StatusCode::NOT_IMPLEMENTED)
}

fn retry_cause(status: StatusCode) -> &'static str {
    if status == StatusCode::TOO_MANY_REQUESTS {
        "status_429"
    } else {
        "status_5xx"
    }
}

fn error_cause(error: &reqwest::Error) -> &'static str {
    if error.is_timeout() {
        "timeout"
    } else if error.is_connect() {
        "connect"
    } else {
        "request"
    }
}

/// Parse a numeric `Retry-After` header, seconds form only.
fn retry_after_hint(response: &reqwest::Response) -> Option<std::time::Duration> {
    response
        .headers()
        .get(http::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(std::time::Duration::from_secs)
}

/// Execute an HTTP operation with retry.
///
/// `make_request` is called once per attempt; attempts never exceed
/// `max_retries + 1`. Returns the last response or error once the budget is
/// spent or a non-retryable outcome appears.
pub async fn with_retry<F, Fut>(
    max_retries: u32,
    config: &RetryConfig,
    operation: &str,
    make_request: F,
) -> Result<reqwest::Response, reqwest::Error>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<reqwest::Response, reqwest::Error>>,
{
    let max_attempts = max_retries + 1;

    for attempt in 0..max_attempts {
        let result = make_request().await;

        match result {
            Ok(response) => {
                let status = response.status();

                if should_retry_status(status) && attempt < max_attempts - 1 {
                    metrics::record_backend_retry(retry_cause(status));

                    // A 429 with a numeric Retry-After overrides the backoff
                    // schedule; the attempt still counts.
                    let delay = if status == StatusCode::TOO_MANY_REQUESTS
                        && let Some(hint) = retry_after_hint(&response)
                    {
                        hint
                    } else {
                        config.delay_for_attempt(attempt)
                    };

                    warn!(
                        operation,
                        status = %status,
                        attempt = attempt + 1,
                        max_attempts,
                        delay_ms = delay.as_millis(),
                        "Retryable backend status, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }

                if attempt > 0 {
                    debug!(
                        operation,
                        status = %status,
                        attempt = attempt + 1,
                        "Backend request succeeded on retry"
                    );
                }

                return Ok(response);
            }
            Err(error) => {
                if is_retryable_error(&error) && attempt < max_attempts - 1 {
                    metrics::record_backend_retry(error_cause(&error));
                    let delay = config.delay_for_attempt(attempt);
                    warn!(
                        operation,
                        error = %error,
                        attempt = attempt + 1,
                        max_attempts,
                        delay_ms = delay.as_millis(),
                        "Retryable transport error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }

                if attempt > 0 {
                    warn!(
                        operation,
                        error = %error,
                        attempts = attempt + 1,
                        "Backend request failed with retries spent"
                    );
                }

                return Err(error);
            }
        }
    }

    unreachable!("retry loop always returns within max_attempts")
}
