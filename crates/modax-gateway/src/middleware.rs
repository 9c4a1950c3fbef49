//! Request-context and error-envelope middleware
//!
//! Outermost layers of the chain: request-id injection + structured access
//! log + API metrics, and the envelope that gives every non-2xx response the
//! standard JSON body.

use std::time::Instant;

use axum::extract::{MatchedPath, Request};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use uuid::Uuid;

use modax_core::metrics_names;

use crate::error::ApiError;

/// Per-request id, injected before anything else runs and echoed back in
/// the `x-request-id` response header.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

pub async fn request_context(mut req: Request, next: Next) -> Response {
    let request_id = Uuid::now_v7().to_string();
    req.extensions_mut().insert(RequestId(request_id.clone()));

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    // Matched route pattern keeps metric cardinality bounded; raw path goes
    // to the access log only.
    let endpoint = req
        .extensions()
        .get::<MatchedPath>()
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| path.clone());

    let start = Instant::now();
    let mut response = next.run(req).await;
    let elapsed = start.elapsed();
    let status = response.status().as_u16();

    metrics::counter!(
        metrics_names::API_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "endpoint" => endpoint,
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!(metrics_names::API_REQUEST_DURATION_SECONDS)
        .record(elapsed.as_secs_f64());

    tracing::info!(
        target: "modax::access",
        method = %method,
        path = %path,
        status,
        latency_ms = elapsed.as_millis() as u64,
        request_id = %request_id,
        "request"
    );

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Rewrite every non-2xx response into the standard error envelope:
/// `{error, message, status_code, timestamp, details: {path, method}}`.
pub async fn error_envelope(req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();

    let response = next.run(req).await;
    let status = response.status();
    if !(status.is_client_error() || status.is_server_error()) {
        return response;
    }

    let (kind, message) = match response.extensions().get::<ApiError>() {
        Some(err) => (err.kind.as_str().to_string(), err.message.clone()),
        // Responses produced outside our handlers: router 404/405,
        // extractor rejections, panics caught by hyper.
        None => {
            let kind = match status {
                StatusCode::NOT_FOUND => "NotFound",
                StatusCode::METHOD_NOT_ALLOWED
                | StatusCode::BAD_REQUEST
                | StatusCode::UNSUPPORTED_MEDIA_TYPE
                | StatusCode::PAYLOAD_TOO_LARGE
                | StatusCode::UNPROCESSABLE_ENTITY => "ValidationError",
                StatusCode::UNAUTHORIZED => "AuthError",
                StatusCode::FORBIDDEN => "PermissionError",
                s if s.is_server_error() => "InternalError",
                _ => "Error",
            };
            let message = status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string();
            (kind.to_string(), message)
        }
    };

    let body = json!({
        "error": kind,
        "message": message,
        "status_code": status.as_u16(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "details": { "path": path, "method": method },
    });

    let mut enveloped = (status, axum::Json(body)).into_response();
    // Carry over headers like Retry-After; the body headers are rebuilt.
    for (name, value) in response.headers() {
        if name != &header::CONTENT_TYPE && name != &header::CONTENT_LENGTH {
            enveloped.headers_mut().insert(name.clone(), value.clone());
        }
    }
    enveloped
}
