// ARCHITECTURE: HTTP Security Helpers
//
// Credential extraction for handlers and a response-header layer applied to
// every route. Authentication and rate limiting themselves run inside the
// gateway so that every outcome produces exactly one audit event.

use axum::{
    extract::Request,
    http::{
        header::{self, HeaderName},
        HeaderMap, HeaderValue,
    },
    middleware::Next,
    response::Response,
};

/// Reads the caller's key from `Authorization: Bearer <key>`, falling back to `X-API-Key`.
pub fn extract_credential(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or_else(|| headers.get("x-api-key").and_then(|v| v.to_str().ok()))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

const SECURITY_HEADERS: [(&str, &str); 5] = [
    ("x-content-type-options", "nosniff"),
    ("x-frame-options", "DENY"),
    ("referrer-policy", "no-referrer"),
    ("content-security-policy", "default-src 'none'"),
    ("cache-control", "no-store"),
];

pub fn add_security_headers(headers: &mut HeaderMap) {
    for (name, value) in SECURITY_HEADERS {
        headers.insert(HeaderName::from_static(name), HeaderValue::from_static(value));
    }
}

/// `axum::middleware::from_fn` layer that stamps security headers on every response.
pub async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    add_security_headers(response.headers_mut());
    response
}
