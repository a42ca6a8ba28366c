// ARCHITECTURE: Request Gateway - Single Entry Point for Detection Calls
//
// PIPELINE (short-circuits on the first failure):
// 1. AUTHENTICATE: credential -> client id, else Unauthorized
// 2. ADMIT: per-client sliding window, else RateLimited with a retry hint
// 3. VALIDATE: threshold bounds and image structure, else InvalidInput
// 4. INFER: real backend through the model handle when it is ready; any
//    timeout, error or unavailable state falls back to the simulator
// 5. PROCESS: sanitize, order and grade detections from either source
// 6. AUDIT: exactly one event per call, whatever the outcome
//
// A call either returns a complete DetectionResult (REAL or SIMULATED) or one
// typed GatewayError. Inference trouble is never surfaced unless the fallback
// itself is out of capacity.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    audit::{AuditEventKind, AuditLogger, AuditRecord},
    config::Config,
    detection::{
        processor::ProcessingContext, DetectionResult, InferenceSource, RawDetection, ResultProcessor,
    },
    error::GatewayError,
    models::{self, FallbackSimulator, InferenceBackend, InferenceError, ModelHandle},
    security::{
        auth::{AuthResult, AuthService},
        rate_limiter::{RateLimitResult, RateLimiter},
        validator::{ImagePayload, InputValidator, ValidatedImage, ValidationError},
    },
};

/// Client id recorded for calls that never authenticated.
pub const UNAUTHENTICATED_CLIENT: &str = "unauthenticated";

const FALLBACK_RETRY_AFTER_SECONDS: u64 = 1;

// CONFIGURATION: ThresholdPolicy - Confidence threshold bounds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdPolicy {
    pub default: f32,  // Used when the caller sends none (default: 0.5)
    pub min: f32,      // Lower clamp (default: 0.1)
    pub max: f32,      // Upper clamp (default: 0.95)
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self {
            default: 0.5,
            min: 0.1,
            max: 0.95,
        }
    }
}

impl ThresholdPolicy {
    /// Clamps a requested threshold into bounds. Non-finite values are invalid input.
    pub fn resolve(&self, requested: Option<f32>) -> Result<f32, ValidationError> {
        match requested {
            None => Ok(self.default),
            Some(value) if value.is_finite() => Ok(value.clamp(self.min, self.max)),
            Some(_) => Err(ValidationError::Threshold),
        }
    }
}

/// One detection call as received from a caller.
#[derive(Debug, Clone)]
pub struct DetectionRequest {
    pub image: ImagePayload,
    pub confidence_threshold: Option<f32>,
}

/// Everything the gateway orchestrates. Shared parts are `Arc`s so the HTTP
/// layer and background tasks can hold them too.
pub struct GatewayComponents {
    pub auth: Arc<AuthService>,
    pub rate_limiter: Arc<RateLimiter>,
    pub validator: InputValidator,
    pub model: Arc<ModelHandle>,
    pub fallback: Arc<FallbackSimulator>,
    pub processor: ResultProcessor,
    pub audit: Arc<AuditLogger>,
    pub threshold: ThresholdPolicy,
}

struct InferenceOutcome {
    detections: Vec<RawDetection>,
    source: InferenceSource,
    kind: AuditEventKind,
    fallback_reason: Option<String>,
}

// CORE SYSTEM: DetectionGateway
pub struct DetectionGateway {
    auth: Arc<AuthService>,
    rate_limiter: Arc<RateLimiter>,
    validator: InputValidator,
    model: Arc<ModelHandle>,
    fallback: Arc<FallbackSimulator>,
    processor: ResultProcessor,
    audit: Arc<AuditLogger>,
    threshold: ThresholdPolicy,
}

impl DetectionGateway {
    pub fn new(components: GatewayComponents) -> Self {
        Self {
            auth: components.auth,
            rate_limiter: components.rate_limiter,
            validator: components.validator,
            model: components.model,
            fallback: components.fallback,
            processor: components.processor,
            audit: components.audit,
            threshold: components.threshold,
        }
    }

    pub fn model(&self) -> &Arc<ModelHandle> {
        &self.model
    }

    pub fn audit(&self) -> &Arc<AuditLogger> {
        &self.audit
    }

    pub fn fallback(&self) -> &Arc<FallbackSimulator> {
        &self.fallback
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn validator(&self) -> &InputValidator {
        &self.validator
    }

    // CORE FUNCTION: Run one detection call end to end
    pub async fn detect(
        &self,
        credential: Option<&str>,
        request: DetectionRequest,
    ) -> Result<DetectionResult, GatewayError> {
        let started = Instant::now();
        let request_id = Uuid::new_v4().to_string();

        let client_id = self.admit_client(credential, &request_id).await?;

        let (threshold, image) = match self.admit_input(request) {
            Ok(ok) => ok,
            Err(e) => return Err(self.reject_invalid(&client_id, &request_id, e).await),
        };

        let outcome = match self.infer(&image).await {
            Ok(outcome) => outcome,
            Err((kind, err)) => {
                let record = AuditRecord::new(&client_id, kind).with("request_id", &request_id);
                return Err(self.reject(record, err).await);
            }
        };

        let ctx = ProcessingContext {
            request_id: request_id.clone(),
            width: image.width,
            height: image.height,
            threshold,
            source: outcome.source,
            elapsed: started.elapsed(),
        };
        let result = self.processor.process(outcome.detections, &ctx);

        let mut record = AuditRecord::new(&client_id, outcome.kind)
            .with("request_id", &request_id)
            .with("source", format!("{:?}", result.source).to_uppercase())
            .with("verdict", format!("{:?}", result.verdict).to_uppercase())
            .with("defects", result.defects.len())
            .with("duration_ms", result.duration_ms);
        if let Some(reason) = &outcome.fallback_reason {
            record = record.with("fallback_reason", reason);
        }
        if let Err(e) = self.audit.record(record).await {
            error!(request_id = %request_id, error = %e, "Failed to audit completed request");
            return Err(GatewayError::Internal(e.to_string()));
        }

        info!(
            request_id = %request_id,
            client_id = %client_id,
            verdict = ?result.verdict,
            source = ?result.source,
            defects = result.defects.len(),
            duration_ms = result.duration_ms,
            "Detection completed"
        );
        Ok(result)
    }

    /// Runs a call whose body could not even be decoded through the same
    /// authentication and admission steps, then rejects it as invalid input.
    pub async fn reject_undecodable(&self, credential: Option<&str>, reason: ValidationError) -> GatewayError {
        let request_id = Uuid::new_v4().to_string();
        match self.admit_client(credential, &request_id).await {
            Ok(client_id) => self.reject_invalid(&client_id, &request_id, reason).await,
            Err(e) => e,
        }
    }

    async fn admit_client(&self, credential: Option<&str>, request_id: &str) -> Result<String, GatewayError> {
        let client_id = self.authenticate(credential).await?;

        if let RateLimitResult::RateLimited { retry_after_seconds, limit, .. } =
            self.rate_limiter.admit(&client_id).await
        {
            let record = AuditRecord::new(&client_id, AuditEventKind::RateLimited)
                .with("request_id", request_id)
                .with("limit", limit)
                .with("retry_after_seconds", retry_after_seconds);
            return Err(self
                .reject(record, GatewayError::RateLimited { retry_after_seconds })
                .await);
        }
        Ok(client_id)
    }

    async fn reject_invalid(&self, client_id: &str, request_id: &str, reason: ValidationError) -> GatewayError {
        warn!(request_id = %request_id, client_id = %client_id, reason = %reason, "Rejected invalid input");
        let record = AuditRecord::new(client_id, AuditEventKind::ValidationRejected)
            .with("request_id", request_id)
            .with("reason", reason.code());
        self.reject(record, GatewayError::InvalidInput(reason)).await
    }

    fn admit_input(&self, request: DetectionRequest) -> Result<(f32, ValidatedImage), ValidationError> {
        let threshold = self.threshold.resolve(request.confidence_threshold)?;
        let image = self.validator.validate(request.image)?;
        Ok((threshold, image))
    }

    /// Authenticates a caller for an administrative call and records the outcome.
    pub async fn authorize(&self, credential: Option<&str>, action: &str) -> Result<String, GatewayError> {
        let client_id = self.authenticate(credential).await?;
        let record = AuditRecord::new(&client_id, AuditEventKind::AuthSuccess).with("action", action);
        if let Err(e) = self.audit.record(record).await {
            error!(client_id = %client_id, error = %e, "Failed to audit admin access");
            return Err(GatewayError::Internal(e.to_string()));
        }
        Ok(client_id)
    }

    async fn authenticate(&self, credential: Option<&str>) -> Result<String, GatewayError> {
        match self.auth.authenticate(credential).await {
            AuthResult::Authenticated { client_id, .. } => Ok(client_id),
            AuthResult::Denied { reason } => {
                let record = AuditRecord::new(UNAUTHENTICATED_CLIENT, AuditEventKind::AuthFailure)
                    .with("reason", reason.code());
                Err(self.reject(record, GatewayError::Unauthorized(reason)).await)
            }
        }
    }

    async fn infer(&self, image: &ValidatedImage) -> Result<InferenceOutcome, (AuditEventKind, GatewayError)> {
        let timeout = self.model.config().timeout();

        let fallback_reason = match self.model.invoke(image, timeout).await {
            Ok(detections) => {
                return Ok(InferenceOutcome {
                    detections,
                    source: InferenceSource::Real,
                    kind: AuditEventKind::InferenceSuccess,
                    fallback_reason: None,
                })
            }
            Err(e) => e,
        };

        let kind = match fallback_reason {
            InferenceError::Timeout { .. } => AuditEventKind::InferenceTimeout,
            _ => AuditEventKind::InferenceFallback,
        };
        if !matches!(fallback_reason, InferenceError::Unavailable(_)) {
            warn!(reason = %fallback_reason, "Real inference failed, falling back to simulation");
        }

        match self.fallback.infer(image).await {
            Ok(detections) => Ok(InferenceOutcome {
                detections,
                source: InferenceSource::Simulated,
                kind,
                fallback_reason: Some(fallback_reason.to_string()),
            }),
            Err(InferenceError::ResourceExhausted(_)) => Err((
                AuditEventKind::ResourceExhausted,
                GatewayError::ResourceExhausted {
                    retry_after_seconds: FALLBACK_RETRY_AFTER_SECONDS,
                },
            )),
            Err(e) => {
                error!(error = %e, "Fallback simulation failed");
                Err((AuditEventKind::InternalError, GatewayError::Internal(e.to_string())))
            }
        }
    }

    /// Audits a failed call and returns its error. An audit failure here is
    /// logged and the original error wins.
    async fn reject(&self, record: AuditRecord, err: GatewayError) -> GatewayError {
        let record = record.with("error_kind", err.kind());
        if let Err(audit_err) = self.audit.record(record).await {
            error!(error = %audit_err, original = %err, "Failed to audit rejected request");
        }
        err
    }

    // LIFECYCLE: Stop background tasks and drain the audit trail
    pub async fn shutdown(&self) {
        self.rate_limiter.stop().await;
        if let Err(e) = self.audit.flush().await {
            warn!(error = %e, "Audit log could not be flushed on shutdown");
        }
        self.audit.stop();
        info!("Detection gateway stopped");
    }
}

/// Wires every component from configuration and starts their background tasks.
pub async fn create_production_gateway(config: &Config) -> anyhow::Result<Arc<DetectionGateway>> {
    let auth = Arc::new(AuthService::with_config(config.auth.clone()));
    auth.start().await?;

    let rate_limiter = Arc::new(RateLimiter::with_config(config.rate_limit.clone()));
    rate_limiter.start().await;

    let audit = Arc::new(AuditLogger::start(config.audit.clone()).await?);

    let model =
        models::create_production_model_handle(config.model.handle.clone(), config.model.backend_url.as_deref())
            .await?;

    let fallback = Arc::new(FallbackSimulator::with_config(config.fallback.clone()));
    if let Err(e) = fallback.load().await {
        anyhow::bail!("fallback simulator unavailable: {e}");
    }

    Ok(Arc::new(DetectionGateway::new(GatewayComponents {
        auth,
        rate_limiter,
        validator: InputValidator::with_config(config.validation.clone()),
        model,
        fallback,
        processor: ResultProcessor::with_config(config.processing.result.clone()),
        audit,
        threshold: config.processing.threshold,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_defaults_and_clamps() {
        let policy = ThresholdPolicy::default();
        assert_eq!(policy.resolve(None), Ok(0.5));
        assert_eq!(policy.resolve(Some(0.0)), Ok(0.1));
        assert_eq!(policy.resolve(Some(1.0)), Ok(0.95));
        assert_eq!(policy.resolve(Some(0.42)), Ok(0.42));
    }

    #[test]
    fn non_finite_threshold_is_invalid() {
        let policy = ThresholdPolicy::default();
        assert_eq!(policy.resolve(Some(f32::NAN)), Err(ValidationError::Threshold));
        assert_eq!(policy.resolve(Some(f32::INFINITY)), Err(ValidationError::Threshold));
    }
}
