// ARCHITECTURE: Remote Vision Backend - HTTP Client for the Vision Runtime
//
// PROTOCOL:
// - GET  {base}/health  -> any 2xx means the runtime is loaded and warm
// - POST {base}/infer   -> {image: base64, width, height, channels, format}
//                          <- {detections: [{label, confidence, bbox}]}
//
// ERROR MAPPING:
// - connect errors, client timeouts, 5xx and 429 are transient
// - any other 4xx or an undecodable body means the runtime speaks a
//   different protocol, which no retry will fix

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::traits::{InferenceBackend, InferenceError};
use crate::{
    detection::RawDetection,
    security::validator::{ImageFormat, ValidatedImage},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteBackendConfig {
    pub base_url: String,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,  // Backstop only; the model handle enforces the real deadline
}

impl RemoteBackendConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            connect_timeout_ms: 2_000,
            request_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Serialize)]
struct InferRequest {
    image: String,
    width: u32,
    height: u32,
    channels: u8,
    format: ImageFormat,
}

#[derive(Debug, Deserialize)]
struct InferResponse {
    detections: Vec<RawDetection>,
}

#[derive(Debug)]
pub struct RemoteVisionBackend {
    base_url: String,
    client: reqwest::Client,
}

impl RemoteVisionBackend {
    pub fn new(config: RemoteBackendConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .context("failed to build vision runtime HTTP client")?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn transport_error(e: reqwest::Error) -> InferenceError {
    if e.is_timeout() {
        InferenceError::Transient(format!("vision runtime timed out: {e}"))
    } else if e.is_connect() {
        InferenceError::Transient(format!("vision runtime unreachable: {e}"))
    } else {
        InferenceError::Transient(format!("vision runtime request failed: {e}"))
    }
}

fn status_error(status: StatusCode) -> InferenceError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        InferenceError::Transient(format!("vision runtime answered {status}"))
    } else {
        InferenceError::Unrecoverable(format!("incompatible runtime: answered {status}"))
    }
}

#[async_trait]
impl InferenceBackend for RemoteVisionBackend {
    fn name(&self) -> &str {
        "remote-vision"
    }

    async fn load(&self) -> Result<(), InferenceError> {
        let response = self
            .client
            .get(self.url("/health"))
            .send()
            .await
            .map_err(|e| InferenceError::Unrecoverable(format!("vision runtime unreachable: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(InferenceError::Unrecoverable(format!(
                "vision runtime health check answered {status}"
            )));
        }

        info!(base_url = %self.base_url, "Vision runtime is ready");
        Ok(())
    }

    async fn infer(&self, image: &ValidatedImage) -> Result<Vec<RawDetection>, InferenceError> {
        let body = InferRequest {
            image: STANDARD.encode(&image.bytes),
            width: image.width,
            height: image.height,
            channels: image.channels,
            format: image.format,
        };

        let response = self
            .client
            .post(self.url("/infer"))
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let err = status_error(status);
            warn!(status = %status, error = %err, "Vision runtime rejected inference");
            return Err(err);
        }

        let parsed: InferResponse = response
            .json()
            .await
            .map_err(|e| InferenceError::Unrecoverable(format!("incompatible runtime: {e}")))?;

        debug!(detections = parsed.detections.len(), "Vision runtime answered");
        Ok(parsed.detections)
    }
}
