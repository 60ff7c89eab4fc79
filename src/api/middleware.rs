//! API Middleware
//!
//! Request context extraction and request logging.

use axum::{
    body::Body,
    http::{HeaderMap, Request},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use crate::domain::OperationContext;

/// Header naming the user on whose behalf the request is made
pub const REQUEST_USER_HEADER: &str = "X-Request-User";

/// Header carrying the caller's correlation id
pub const CORRELATION_ID_HEADER: &str = "X-Correlation-Id";

// =========================================================================
// Request context
// =========================================================================

/// Build the `OperationContext` for a request from its headers.
///
/// The request user is taken verbatim from `X-Request-User`; the correlation
/// id is reused when the caller sent a valid one and generated otherwise.
pub fn context_from_headers(headers: &HeaderMap) -> OperationContext {
    let correlation_id = headers
        .get(CORRELATION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or_else(Uuid::new_v4);

    let context = OperationContext::new().with_correlation_id(correlation_id);

    match headers
        .get(REQUEST_USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|user| !user.is_empty())
    {
        Some(user) => context.with_request_user(user),
        None => context,
    }
}

/// Attach an `OperationContext` to every request
pub async fn request_context_middleware(mut request: Request<Body>, next: Next) -> Response {
    let context = context_from_headers(request.headers());
    request.extensions_mut().insert(context);

    next.run(request).await
}

// =========================================================================
// mask_headers_for_logging
// =========================================================================

/// Headers that should be masked in logs
const SENSITIVE_HEADERS: &[&str] = &["authorization", "cookie", "set-cookie"];

/// Mask sensitive headers for logging
pub fn mask_headers_for_logging(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            let name_lower = name.as_str().to_lowercase();
            let masked_value = if SENSITIVE_HEADERS.contains(&name_lower.as_str()) {
                "[REDACTED]".to_string()
            } else {
                value.to_str().unwrap_or("[invalid utf8]").to_string()
            };
            (name.to_string(), masked_value)
        })
        .collect()
}

// =========================================================================
// Request logging
// =========================================================================

/// Log every request and its outcome
pub async fn logging_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();

    let headers = mask_headers_for_logging(request.headers());

    let correlation_id = request
        .extensions()
        .get::<OperationContext>()
        .and_then(|ctx| ctx.correlation_id);

    let start = std::time::Instant::now();

    tracing::info!(
        method = %method,
        uri = %uri,
        correlation_id = ?correlation_id,
        headers = ?headers,
        "Incoming request"
    );

    let response = next.run(request).await;

    let duration = start.elapsed();
    let status = response.status();

    tracing::info!(
        method = %method,
        uri = %uri,
        status = %status,
        duration_ms = %duration.as_millis(),
        correlation_id = ?correlation_id,
        "Request completed"
    );

    response
}
