//! Rate limiting middleware for axum routers.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::SecondsFormat;
use tracing::{debug, error, instrument, warn};

use super::extractor::KeyExtractor;
use crate::config::FailurePolicy;
use crate::ratelimit::{AdmissionRequest, AdmissionResult, AdmissionState, Strategy};

/// Total activity recorded in the caller's window.
pub const TOTAL_REQUESTS_HEADER: &str = "rate-limiting-total-requests";
/// `Allow` or `Deny`.
pub const STATE_HEADER: &str = "rate-limiting-state";
/// RFC 3339 expiry hint.
pub const EXPIRES_AT_HEADER: &str = "rate-limiting-expires-at";

/// Everything the middleware needs to evaluate a request.
#[derive(Clone)]
pub struct RateLimitState {
    pub extractor: Arc<dyn KeyExtractor>,
    pub strategy: Arc<dyn Strategy>,
    pub max_requests: u64,
    pub window: Duration,
    pub failure_policy: FailurePolicy,
}

impl RateLimitState {
    pub fn new(
        extractor: Arc<dyn KeyExtractor>,
        strategy: Arc<dyn Strategy>,
        max_requests: u64,
        window: Duration,
    ) -> Self {
        Self {
            extractor,
            strategy,
            max_requests,
            window,
            failure_policy: FailurePolicy::default(),
        }
    }

    pub fn with_failure_policy(mut self, failure_policy: FailurePolicy) -> Self {
        self.failure_policy = failure_policy;
        self
    }
}

fn text_response(status: StatusCode, message: String) -> Response {
    (status, [(CONTENT_TYPE, "text/plain")], message).into_response()
}

fn apply_headers(headers: &mut HeaderMap, result: &AdmissionResult) {
    headers.insert(TOTAL_REQUESTS_HEADER, HeaderValue::from(result.total_requests));
    headers.insert(STATE_HEADER, HeaderValue::from_static(result.state.as_str()));
    let expires_at = result.expires_at.to_rfc3339_opts(SecondsFormat::Secs, true);
    if let Ok(value) = HeaderValue::from_str(&expires_at) {
        headers.insert(EXPIRES_AT_HEADER, value);
    }
}

/// Admit or reject a request before it reaches the wrapped handler.
///
/// Rate limiting headers are set on both allowed and denied responses. A
/// denied request gets `429` and never reaches `next`. When the key cannot be
/// extracted the response is `400`. When the store fails, the failure policy
/// decides between `500` and letting the request through; any other
/// evaluation error is a `500`.
#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
pub async fn rate_limit(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();

    let key = match state.extractor.extract(&parts) {
        Ok(key) => key,
        Err(e) => {
            debug!(error = %e, "Could not derive rate limiting key");
            return text_response(
                StatusCode::BAD_REQUEST,
                format!("failed to collect rate limiting key from request: {}", e),
            );
        }
    };
    let request = Request::from_parts(parts, body);

    let evaluation = match AdmissionRequest::new(key.as_str(), state.max_requests, state.window) {
        Ok(admission) => state.strategy.evaluate(&admission).await,
        Err(e) => Err(e),
    };

    let result = match evaluation {
        Ok(result) => result,
        // Only store failures are subject to the failure policy.
        Err(e) if !e.is_store_error() => {
            error!(key = %key, error = %e, "Rate limiting misconfigured, rejecting request");
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to run rate limiting for request: {}", e),
            );
        }
        Err(e) => match state.failure_policy {
            FailurePolicy::Closed => {
                error!(key = %key, error = %e, "Rate limiting failed, rejecting request");
                return text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("failed to run rate limiting for request: {}", e),
                );
            }
            FailurePolicy::Open => {
                warn!(key = %key, error = %e, "Rate limiting failed, letting request through");
                return next.run(request).await;
            }
        },
    };

    if result.state == AdmissionState::Deny {
        debug!(key = %key, total = result.total_requests, "Request denied");
        let mut response = text_response(
            StatusCode::TOO_MANY_REQUESTS,
            "you have sent too many requests to this service, slow down please".to_string(),
        );
        apply_headers(response.headers_mut(), &result);
        return response;
    }

    let mut response = next.run(request).await;
    apply_headers(response.headers_mut(), &result);
    response
}
