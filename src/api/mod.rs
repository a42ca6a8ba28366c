// ARCHITECTURE: API Module - HTTP Surface of the Gateway
//
// ROUTES:
// - POST /detect                 detection call (bearer key)
// - GET  /health                 liveness and model state (public)
// - GET  /api/v1/model/status    model handle and rate limiter snapshot
// - POST /api/v1/model/reload    re-run the backend readiness probe
// - GET  /api/v1/audit/recent    tail of the audit trail
//
// Handlers stay thin: decoding and HTTP mapping only. Every decision lives in
// DetectionGateway.

pub mod admin;
pub mod detect;
pub mod health;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::{gateway::DetectionGateway, security::middleware::security_headers};

/// Slack for the JSON envelope around the base64 image.
const BODY_OVERHEAD_BYTES: usize = 64 * 1024;

pub fn create_router(gateway: Arc<DetectionGateway>) -> Router {
    let max_image_bytes = gateway.validator().config().max_bytes;
    let body_limit = max_image_bytes.div_ceil(3) * 4 + BODY_OVERHEAD_BYTES;

    Router::new()
        .route("/health", get(health::health_check))
        .route("/detect", post(detect::detect_defects))
        .route("/api/v1/model/status", get(admin::model_status))
        .route("/api/v1/model/reload", post(admin::reload_model))
        .route("/api/v1/audit/recent", get(admin::recent_audit_events))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn(security_headers))
        .layer(TraceLayer::new_for_http())
        .with_state(gateway)
}
