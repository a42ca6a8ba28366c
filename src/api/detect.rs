use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::HeaderMap,
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;

use crate::{
    detection::DetectionResult,
    error::GatewayError,
    gateway::{DetectionGateway, DetectionRequest},
    security::{
        middleware::extract_credential,
        validator::{ImageFormat, ImagePayload, ValidationError},
    },
};

/// JSON body of `POST /detect`. The image travels base64 encoded.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectRequestBody {
    pub image: String,
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub format: String,
    #[serde(default)]
    pub confidence_threshold: Option<f32>,
}

impl DetectRequestBody {
    pub fn into_request(self) -> Result<DetectionRequest, ValidationError> {
        let format: ImageFormat = self.format.parse()?;
        let bytes = STANDARD
            .decode(self.image.trim())
            .map_err(|e| ValidationError::Encoding(format!("image is not valid base64: {e}")))?;

        Ok(DetectionRequest {
            image: ImagePayload {
                bytes,
                width: self.width,
                height: self.height,
                channels: self.channels,
                format,
            },
            confidence_threshold: self.confidence_threshold,
        })
    }
}

pub async fn detect_defects(
    State(gateway): State<Arc<DetectionGateway>>,
    headers: HeaderMap,
    body: Result<Json<DetectRequestBody>, JsonRejection>,
) -> Result<Json<DetectionResult>, GatewayError> {
    let credential = extract_credential(&headers);

    let decoded = body
        .map_err(|rejection| ValidationError::Encoding(rejection.body_text()))
        .and_then(|Json(body)| body.into_request());

    match decoded {
        Ok(request) => gateway.detect(credential.as_deref(), request).await.map(Json),
        Err(reason) => Err(gateway.reject_undecodable(credential.as_deref(), reason).await),
    }
}
