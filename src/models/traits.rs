// ARCHITECTURE: Trait-Based Inference Backend Abstraction
//
// Both the remote vision runtime and the local simulator sit behind the same
// trait, so the gateway selects a code path from model state alone and the
// result processor never knows which one ran.

use std::fmt::{self, Debug};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{detection::RawDetection, security::validator::ValidatedImage};

/// Lifecycle of the shared model handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelState {
    Uninitialized,
    Ready,
    Degraded,
    Failed,
}

impl fmt::Display for ModelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModelState::Uninitialized => "UNINITIALIZED",
            ModelState::Ready => "READY",
            ModelState::Degraded => "DEGRADED",
            ModelState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InferenceError {
    #[error("inference exceeded {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("inference capacity exhausted: {0}")]
    ResourceExhausted(String),

    #[error("transient inference failure: {0}")]
    Transient(String),

    #[error("unrecoverable inference failure: {0}")]
    Unrecoverable(String),

    #[error("model unavailable in state {0}")]
    Unavailable(ModelState),
}

impl InferenceError {
    /// Failures that should move a healthy handle to DEGRADED rather than FAILED.
    pub fn is_transient(&self) -> bool {
        matches!(self, InferenceError::Timeout { .. } | InferenceError::Transient(_))
    }
}

/// Something that turns a validated image into raw, untrusted detections.
#[async_trait]
pub trait InferenceBackend: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Readiness probe run once when the handle is initialized or reloaded.
    async fn load(&self) -> Result<(), InferenceError>;

    async fn infer(&self, image: &ValidatedImage) -> Result<Vec<RawDetection>, InferenceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(InferenceError::Timeout { after_ms: 10 }.is_transient());
        assert!(InferenceError::Transient("503".into()).is_transient());
        assert!(!InferenceError::Unrecoverable("bad schema".into()).is_transient());
        assert!(!InferenceError::ResourceExhausted("busy".into()).is_transient());
    }

    #[test]
    fn state_wire_names() {
        assert_eq!(serde_json::to_value(ModelState::Degraded).unwrap(), "DEGRADED");
        assert_eq!(ModelState::Uninitialized.to_string(), "UNINITIALIZED");
    }
}
