// ================================================================================================
// HTTP API INTEGRATION TESTS
// ================================================================================================
//
// PURPOSE:
// Exercises the axum router in-process with tower::ServiceExt::oneshot:
// - /detect status codes, error bodies and Retry-After
// - Credential extraction from Authorization and X-API-Key
// - Security headers on every response
// - /health and the operator endpoints
//
// ================================================================================================

mod common;

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    response::Response,
    Router,
};
use common::*;
use qc_inference_gateway::{
    api::create_router, audit::AuditEventKind, models::SimulatorConfig, security::RateLimiterConfig,
    DetectionGateway,
};
use serde_json::{json, Value};
use tower::ServiceExt;

fn router(gateway: &Arc<DetectionGateway>) -> Router {
    create_router(gateway.clone())
}

fn detect_request(key: Option<&str>, body: &Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/detect")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(key) = key {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {key}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn json_body(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

// ================================================================================================
// TEST SUITE 1: DETECT ENDPOINT
// ================================================================================================

#[tokio::test]
async fn test_1_1_detect_returns_simulated_result_without_runtime() {
    let gateway = TestGateway::default().build().await;

    let response = router(&gateway)
        .oneshot(detect_request(Some(KEY_A), &png_body(64, 64, 1)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["source"], "SIMULATED");
    assert!(body["verdict"] == "ACCEPT" || body["verdict"] == "REJECT");
    assert!(body["defects"].is_array());
    assert!(body["request_id"].is_string());
}

#[tokio::test]
async fn test_1_2_real_backend_result_over_http() {
    let gateway = TestGateway::with_backend(FixedBackend {
        detections: vec![raw("puncture", 0.88, [8.0, 8.0, 40.0, 40.0])],
    })
    .build()
    .await;

    let response = router(&gateway)
        .oneshot(detect_request(Some(KEY_A), &png_body(64, 64, 1)))
        .await
        .unwrap();
    let body = json_body(response).await;

    assert_eq!(body["source"], "REAL");
    assert_eq!(body["verdict"], "REJECT");
    assert_eq!(body["defects"][0]["label"], "puncture");
    assert_eq!(body["defects"][0]["bbox"], json!([8, 8, 40, 40]));
    assert_eq!(body["defects"][0]["severity"], "high");
    assert!(body["recommendations"][0]
        .as_str()
        .unwrap()
        .starts_with("Inspect the puncture"));
}

#[tokio::test]
async fn test_1_3_missing_key_is_401_with_challenge() {
    let gateway = TestGateway::default().build().await;

    let response = router(&gateway)
        .oneshot(detect_request(None, &png_body(64, 64, 1)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(response.headers().get(header::WWW_AUTHENTICATE).unwrap(), "Bearer");

    let body = json_body(response).await;
    assert_eq!(body["error_kind"], "unauthorized");
    assert_eq!(body["status"], 401);
}

#[tokio::test]
async fn test_1_4_x_api_key_header_is_accepted() {
    let gateway = TestGateway::default().build().await;

    let request = Request::builder()
        .method("POST")
        .uri("/detect")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-api-key", KEY_B)
        .body(Body::from(png_body(64, 64, 1).to_string()))
        .unwrap();

    let response = router(&gateway).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_1_5_rate_limited_call_is_429_with_retry_after() {
    let gateway = TestGateway {
        rate_limit: RateLimiterConfig {
            window_seconds: 60,
            max_requests: 1,
            ..Default::default()
        },
        ..Default::default()
    }
    .build()
    .await;
    let app = router(&gateway);

    let first = app
        .clone()
        .oneshot(detect_request(Some(KEY_A), &png_body(64, 64, 1)))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app
        .oneshot(detect_request(Some(KEY_A), &png_body(64, 64, 2)))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);

    let retry_after: u64 = second
        .headers()
        .get(header::RETRY_AFTER)
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=60).contains(&retry_after));

    let body = json_body(second).await;
    assert_eq!(body["error_kind"], "rate_limited");
    assert_eq!(body["retry_after_seconds"], retry_after);
}

#[tokio::test]
async fn test_1_8_saturated_fallback_is_503_with_retry_after() {
    let gateway = TestGateway {
        fallback: SimulatorConfig { max_concurrent: 1 },
        ..Default::default()
    }
    .build()
    .await;
    let _slot = gateway.fallback().try_reserve().unwrap();

    let response = router(&gateway)
        .oneshot(detect_request(Some(KEY_A), &png_body(64, 64, 1)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "1");

    let body = json_body(response).await;
    assert_eq!(body["error_kind"], "resource_exhausted");
    assert_eq!(body["retry_after_seconds"], 1);

    gateway.audit().flush().await.unwrap();
    let kinds: Vec<_> = gateway.audit().recent(10).await.into_iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![AuditEventKind::ResourceExhausted]);
}

#[tokio::test]
async fn test_1_6_undecodable_bodies_are_400_and_audited() {
    let gateway = TestGateway::default().build().await;
    let app = router(&gateway);

    let mut bad_base64 = png_body(64, 64, 1);
    bad_base64["image"] = json!("%%% not base64 %%%");
    let response = app
        .clone()
        .oneshot(detect_request(Some(KEY_A), &bad_base64))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error_kind"], "invalid_input");

    let malformed = Request::builder()
        .method("POST")
        .uri("/detect")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, format!("Bearer {KEY_A}"))
        .body(Body::from("{\"image\": "))
        .unwrap();
    let response = app.clone().oneshot(malformed).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let mut gif = png_body(64, 64, 1);
    gif["format"] = json!("gif");
    let response = app.oneshot(detect_request(Some(KEY_A), &gif)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    gateway.audit().flush().await.unwrap();
    let events = gateway.audit().recent(10).await;
    assert_eq!(events.len(), 3);
    assert_eq!(events[0].metadata["reason"], "encoding");
    assert_eq!(events[2].metadata["reason"], "unsupported_format");
    assert!(events.iter().all(|e| e.client_id == CLIENT_A));
}

#[tokio::test]
async fn test_1_7_undecodable_body_without_key_is_still_401() {
    let gateway = TestGateway::default().build().await;

    let response = router(&gateway)
        .oneshot(detect_request(None, &json!({ "image": 42 })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

// ================================================================================================
// TEST SUITE 2: HEALTH, HEADERS AND OPERATOR ENDPOINTS
// ================================================================================================

#[tokio::test]
async fn test_2_1_health_reports_model_state_and_security_headers() {
    let gateway = TestGateway::default().build().await;

    let response = router(&gateway)
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("x-content-type-options").unwrap(), "nosniff");
    assert_eq!(response.headers().get("x-frame-options").unwrap(), "DENY");
    assert_eq!(response.headers().get("cache-control").unwrap(), "no-store");

    let body = json_body(response).await;
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["model_state"], "FAILED");
    assert_eq!(body["runtime_available"], false);
}

#[tokio::test]
async fn test_2_2_health_is_healthy_with_ready_backend() {
    let gateway = TestGateway::with_backend(FixedBackend { detections: Vec::new() })
        .build()
        .await;

    let response = router(&gateway)
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["model_state"], "READY");
}

#[tokio::test]
async fn test_2_3_operator_endpoints_require_a_key() {
    let gateway = TestGateway::default().build().await;

    for (method, uri) in [
        ("GET", "/api/v1/model/status"),
        ("POST", "/api/v1/model/reload"),
        ("GET", "/api/v1/audit/recent"),
    ] {
        let response = router(&gateway)
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{method} {uri}");
    }
}

#[tokio::test]
async fn test_2_4_model_status_and_reload() {
    let gateway = TestGateway::with_backend(FixedBackend { detections: Vec::new() })
        .build()
        .await;
    gateway.model().force_failed("maintenance").await;
    let app = router(&gateway);

    let status = app
        .clone()
        .oneshot(
            Request::get("/api/v1/model/status")
                .header(header::AUTHORIZATION, format!("Bearer {KEY_A}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = json_body(status).await;
    assert_eq!(body["model"]["state"], "FAILED");
    assert_eq!(body["model"]["last_error"], "maintenance");
    assert_eq!(body["fallback"]["available_slots"], 64);

    let reload = app
        .oneshot(
            Request::post("/api/v1/model/reload")
                .header(header::AUTHORIZATION, format!("Bearer {KEY_A}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(reload.status(), StatusCode::OK);
    assert_eq!(json_body(reload).await["state"], "READY");
}

#[tokio::test]
async fn test_2_5_recent_audit_events_include_admin_access() {
    let gateway = TestGateway::default().build().await;
    let app = router(&gateway);

    app.clone()
        .oneshot(detect_request(Some(KEY_A), &png_body(64, 64, 1)))
        .await
        .unwrap();

    let response = app
        .oneshot(
            Request::get("/api/v1/audit/recent?limit=5")
                .header("x-api-key", KEY_B)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["count"], 2);
    assert_eq!(body["events"][0]["kind"], "inference_fallback");
    assert_eq!(body["events"][0]["client_id"], CLIENT_A);
    assert_eq!(body["events"][1]["kind"], "auth_success");
    assert_eq!(body["events"][1]["metadata"]["action"], "audit_recent");
}
