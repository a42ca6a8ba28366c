// Operator endpoints. Each call authenticates and leaves one auth_success
// (or auth_failure) event in the audit trail.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::{error::GatewayError, gateway::DetectionGateway, security::middleware::extract_credential};

const DEFAULT_AUDIT_LIMIT: usize = 100;
const MAX_AUDIT_LIMIT: usize = 1000;

pub async fn model_status(
    State(gateway): State<Arc<DetectionGateway>>,
    headers: HeaderMap,
) -> Result<Json<Value>, GatewayError> {
    gateway
        .authorize(extract_credential(&headers).as_deref(), "model_status")
        .await?;

    let fallback = gateway.fallback();
    Ok(Json(json!({
        "model": gateway.model().status().await,
        "fallback": {
            "available_slots": fallback.available_slots(),
            "max_concurrent": fallback.max_concurrent(),
        },
        "rate_limiter": gateway.rate_limiter().get_metrics().await,
    })))
}

pub async fn reload_model(
    State(gateway): State<Arc<DetectionGateway>>,
    headers: HeaderMap,
) -> Result<Json<Value>, GatewayError> {
    let client_id = gateway
        .authorize(extract_credential(&headers).as_deref(), "model_reload")
        .await?;

    info!(client_id = %client_id, "Model reload requested");
    let state = gateway.model().reload().await;

    Ok(Json(json!({
        "state": state,
        "runtime_available": gateway.model().runtime_available(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub limit: Option<usize>,
}

pub async fn recent_audit_events(
    State(gateway): State<Arc<DetectionGateway>>,
    headers: HeaderMap,
    Query(query): Query<RecentQuery>,
) -> Result<Json<Value>, GatewayError> {
    gateway
        .authorize(extract_credential(&headers).as_deref(), "audit_recent")
        .await?;

    let audit = gateway.audit();
    audit
        .flush()
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))?;

    let limit = query.limit.unwrap_or(DEFAULT_AUDIT_LIMIT).min(MAX_AUDIT_LIMIT);
    let events = audit.recent(limit).await;
    Ok(Json(json!({ "count": events.len(), "events": events })))
}
