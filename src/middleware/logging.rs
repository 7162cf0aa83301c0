//! Request and response logging middleware
//!
//! Logs method, matched route, status and duration of every HTTP request,
//! correlated by `x-request-id`. Slow requests are logged at WARN.

use axum::{
    extract::{MatchedPath, Request},
    middleware::Next,
    response::Response,
};
use std::time::Instant;
use tower_http::request_id::{MakeRequestId, RequestId};
use tracing::{info, warn, Instrument};
use uuid::Uuid;

const SLOW_REQUEST_MS: u128 = 200;

/// Generate request IDs using UUIDv4
#[derive(Clone, Default)]
pub struct UuidRequestId;

impl MakeRequestId for UuidRequestId {
    fn make_request_id<B>(&mut self, _request: &http::Request<B>) -> Option<RequestId> {
        let id = Uuid::new_v4().to_string();
        Some(RequestId::new(id.parse().ok()?))
    }
}

/// Log each request and its outcome inside an `http_request` span.
///
/// Install below `SetRequestIdLayer` so the id is already present:
/// ```no_run
/// use axum::{routing::get, Router};
/// use tower::ServiceBuilder;
/// use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
/// # use prize_payout::middleware::logging::{request_logging_middleware, UuidRequestId};
/// # async fn handler() -> &'static str { "ok" }
/// let app: Router = Router::new().route("/", get(handler)).layer(
///     ServiceBuilder::new()
///         .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
///         .layer(axum::middleware::from_fn(request_logging_middleware))
///         .layer(PropagateRequestIdLayer::x_request_id()),
/// );
/// ```
pub async fn request_logging_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();

    let method = request.method().clone();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let client_ip = extract_client_ip(&request).unwrap_or_else(|| "-".to_string());

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        client_ip = %client_ip,
        "Request started"
    );

    let span = tracing::info_span!(
        "http_request",
        request_id = %request_id,
        method = %method,
        path = %path,
    );
    let response = next.run(request).instrument(span).await;

    let duration_ms = start.elapsed().as_millis();
    let status = response.status().as_u16();

    if duration_ms > SLOW_REQUEST_MS {
        warn!(request_id = %request_id, method = %method, path = %path, status, duration_ms = %duration_ms, "Slow request completed");
    } else if response.status().is_server_error() {
        tracing::error!(request_id = %request_id, method = %method, path = %path, status, duration_ms = %duration_ms, "Request failed with server error");
    } else if response.status().is_client_error() {
        warn!(request_id = %request_id, method = %method, path = %path, status, duration_ms = %duration_ms, "Request completed with client error");
    } else {
        info!(request_id = %request_id, method = %method, path = %path, status, duration_ms = %duration_ms, "Request completed");
    }

    response
}

/// Client address from `X-Forwarded-For` or `X-Real-IP`.
pub fn extract_client_ip<B>(request: &http::Request<B>) -> Option<String> {
    if let Some(forwarded) = request.headers().get("x-forwarded-for") {
        if let Ok(forwarded_str) = forwarded.to_str() {
            if let Some(first_ip) = forwarded_str.split(',').next() {
                return Some(first_ip.trim().to_string());
            }
        }
    }

    request
        .headers()
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}
