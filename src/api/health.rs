use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::Json};
use serde_json::{json, Value};

use crate::{gateway::DetectionGateway, models::ModelState};

/// Liveness plus the model state. Always 200: a FAILED model still serves
/// simulated results.
pub async fn health_check(State(gateway): State<Arc<DetectionGateway>>) -> (StatusCode, Json<Value>) {
    let model = gateway.model();
    let state = model.state().await;

    let response = json!({
        "status": if state == ModelState::Ready { "healthy" } else { "degraded" },
        "service": "qc-inference-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "model_state": state,
        "runtime_available": model.runtime_available(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    });

    (StatusCode::OK, Json(response))
}
