// ARCHITECTURE: Security Module - Request Admission
//
// 1. AUTHENTICATION: API keys resolved to client ids
// 2. RATE LIMITING: per-client sliding window log
// 3. INPUT VALIDATION: image payload checks without pixel decoding
// 4. HTTP HELPERS: credential extraction and security response headers

pub mod auth;
pub mod middleware;
pub mod rate_limiter;
pub mod validator;

pub use auth::{AuthConfig, AuthDenialReason, AuthResult, AuthService, ConfiguredKey};
pub use rate_limiter::{RateLimitResult, RateLimiter, RateLimiterConfig};
pub use validator::{ImageFormat, ImagePayload, InputValidator, ValidatedImage, ValidationError, ValidatorConfig};
