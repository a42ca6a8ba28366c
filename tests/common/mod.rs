// Shared fixtures for the integration suites: encoded test images, scripted
// inference backends and a fully wired gateway.
#![allow(dead_code)]

use std::{io::Cursor, sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{DynamicImage, RgbImage};
use tokio::sync::Mutex;

use qc_inference_gateway::{
    audit::{AuditConfig, AuditLogger},
    detection::{RawDetection, ResultProcessor},
    gateway::{DetectionGateway, DetectionRequest, GatewayComponents, ThresholdPolicy},
    models::{FallbackSimulator, InferenceBackend, InferenceError, ModelHandle, ModelHandleConfig, SimulatorConfig},
    security::{
        AuthConfig, AuthService, ConfiguredKey, ImageFormat, ImagePayload, InputValidator, RateLimiter,
        RateLimiterConfig, ValidatedImage,
    },
};

pub const KEY_A: &str = "key-line-a";
pub const KEY_B: &str = "key-line-b";
pub const CLIENT_A: &str = "line-a";
pub const CLIENT_B: &str = "line-b";

fn noise(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed.wrapping_mul(747_796_405).wrapping_add(2_891_336_453) | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 24) as u8
        })
        .collect()
}

/// RGB image encoded in `format`, filled with seeded noise so it clears the byte floor.
pub fn encoded_image(width: u32, height: u32, format: image::ImageFormat, seed: u32) -> Vec<u8> {
    let pixels = RgbImage::from_raw(width, height, noise((width * height * 3) as usize, seed))
        .expect("buffer matches dimensions");
    let mut out = Vec::new();
    DynamicImage::ImageRgb8(pixels)
        .write_to(&mut Cursor::new(&mut out), format)
        .expect("encode test image");
    out
}

pub fn png_payload(width: u32, height: u32, seed: u32) -> ImagePayload {
    ImagePayload {
        bytes: encoded_image(width, height, image::ImageFormat::Png, seed),
        width,
        height,
        channels: 3,
        format: ImageFormat::Png,
    }
}

pub fn png_request(width: u32, height: u32, seed: u32) -> DetectionRequest {
    DetectionRequest {
        image: png_payload(width, height, seed),
        confidence_threshold: None,
    }
}

/// JSON body accepted by `POST /detect`.
pub fn png_body(width: u32, height: u32, seed: u32) -> serde_json::Value {
    serde_json::json!({
        "image": STANDARD.encode(encoded_image(width, height, image::ImageFormat::Png, seed)),
        "width": width,
        "height": height,
        "channels": 3,
        "format": "png",
    })
}

pub fn raw(label: &str, confidence: f32, bbox: [f32; 4]) -> RawDetection {
    RawDetection {
        label: label.to_string(),
        confidence,
        bbox,
    }
}

// BACKENDS: scripted stand-ins for the vision runtime

#[derive(Debug)]
pub struct FixedBackend {
    pub detections: Vec<RawDetection>,
}

#[async_trait]
impl InferenceBackend for FixedBackend {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn load(&self) -> Result<(), InferenceError> {
        Ok(())
    }

    async fn infer(&self, _image: &ValidatedImage) -> Result<Vec<RawDetection>, InferenceError> {
        Ok(self.detections.clone())
    }
}

#[derive(Debug)]
pub struct SlowBackend {
    pub delay: Duration,
}

#[async_trait]
impl InferenceBackend for SlowBackend {
    fn name(&self) -> &str {
        "slow"
    }

    async fn load(&self) -> Result<(), InferenceError> {
        Ok(())
    }

    async fn infer(&self, _image: &ValidatedImage) -> Result<Vec<RawDetection>, InferenceError> {
        tokio::time::sleep(self.delay).await;
        Ok(vec![raw("crack", 0.9, [1.0, 1.0, 20.0, 20.0])])
    }
}

/// Replays a fixed list of outcomes, then succeeds with no detections.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    pub script: Mutex<Vec<Result<Vec<RawDetection>, InferenceError>>>,
}

impl ScriptedBackend {
    pub fn new(mut outcomes: Vec<Result<Vec<RawDetection>, InferenceError>>) -> Self {
        outcomes.reverse();
        Self {
            script: Mutex::new(outcomes),
        }
    }
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn load(&self) -> Result<(), InferenceError> {
        Ok(())
    }

    async fn infer(&self, _image: &ValidatedImage) -> Result<Vec<RawDetection>, InferenceError> {
        self.script.lock().await.pop().unwrap_or(Ok(Vec::new()))
    }
}

// GATEWAY: fully wired instance with two configured clients

#[derive(Default)]
pub struct TestGateway {
    pub backend: Option<Arc<dyn InferenceBackend>>,
    pub rate_limit: RateLimiterConfig,
    pub model: ModelHandleConfig,
    pub fallback: SimulatorConfig,
    pub audit: AuditConfig,
}

impl TestGateway {
    pub fn with_backend(backend: impl InferenceBackend + 'static) -> Self {
        Self {
            backend: Some(Arc::new(backend)),
            ..Default::default()
        }
    }

    pub async fn build(self) -> Arc<DetectionGateway> {
        let auth = Arc::new(AuthService::with_config(AuthConfig {
            keys: vec![
                ConfiguredKey {
                    client_id: CLIENT_A.to_string(),
                    secret: KEY_A.to_string(),
                },
                ConfiguredKey {
                    client_id: CLIENT_B.to_string(),
                    secret: KEY_B.to_string(),
                },
            ],
            ..Default::default()
        }));
        auth.start().await.expect("auth starts");

        let model = Arc::new(ModelHandle::with_config(self.model, self.backend));
        model.initialize().await;

        let audit = Arc::new(AuditLogger::start(self.audit).await.expect("audit starts"));

        Arc::new(DetectionGateway::new(GatewayComponents {
            auth,
            rate_limiter: Arc::new(RateLimiter::with_config(self.rate_limit)),
            validator: InputValidator::new(),
            model,
            fallback: Arc::new(FallbackSimulator::with_config(self.fallback)),
            processor: ResultProcessor::new(),
            audit,
            threshold: ThresholdPolicy::default(),
        }))
    }
}
