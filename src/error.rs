use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::security::{auth::AuthDenialReason, validator::ValidationError};

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Caller-actionable failures of a gateway call. Inference trouble never
/// appears here; it is absorbed by the fallback path.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    #[error("Unauthorized: {}", .0.message())]
    Unauthorized(AuthDenialReason),

    #[error("Rate limit exceeded, retry in {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },

    #[error("Invalid input: {0}")]
    InvalidInput(#[from] ValidationError),

    #[error("Inference capacity exhausted, retry in {retry_after_seconds}s")]
    ResourceExhausted { retry_after_seconds: u64 },

    #[error("Internal server error")]
    Internal(String),
}

impl GatewayError {
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Unauthorized(_) => "unauthorized",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::InvalidInput(_) => "invalid_input",
            GatewayError::ResourceExhausted { .. } => "resource_exhausted",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            GatewayError::ResourceExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            GatewayError::RateLimited { retry_after_seconds }
            | GatewayError::ResourceExhausted { retry_after_seconds } => Some(*retry_after_seconds),
            _ => None,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let retry_after = self.retry_after_seconds();

        let mut body = json!({
            "error_kind": self.kind(),
            "error": self.to_string(),
            "status": status.as_u16()
        });
        if let Some(seconds) = retry_after {
            body["retry_after_seconds"] = json!(seconds);
        }

        let mut response = (status, Json(body)).into_response();
        if let Some(seconds) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(seconds));
        }
        if matches!(self, GatewayError::Unauthorized(_)) {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_carries_retry_after() {
        let response = GatewayError::RateLimited { retry_after_seconds: 42 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "42");
    }

    #[test]
    fn internal_details_are_not_displayed() {
        let err = GatewayError::Internal("audit channel closed".to_string());
        assert_eq!(err.to_string(), "Internal server error");
        assert_eq!(err.kind(), "internal_error");
        assert_eq!(err.retry_after_seconds(), None);
    }

    #[test]
    fn validation_errors_map_to_bad_request() {
        let err: GatewayError = ValidationError::Channels(2).into();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.kind(), "invalid_input");
    }
}
