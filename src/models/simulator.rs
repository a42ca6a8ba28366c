// ARCHITECTURE: Fallback Simulator - Deterministic Stand-In Inference
//
// Used whenever the real backend is not ready, times out or errors.
// Output is a pure function of SHA-256(image bytes) and the declared
// dimensions: identical inputs always produce identical defects, and every
// generated box lies inside the image.
//
// CAPACITY:
// Hashing a multi-megabyte payload is CPU work, so it runs on the blocking
// pool behind a small permit budget. When the budget is spent the call fails
// with ResourceExhausted instead of queueing.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use super::traits::{InferenceBackend, InferenceError};
use crate::{
    detection::{BoundingBox, Defect, DefectLabel, RawDetection},
    security::validator::ValidatedImage,
};

const MAX_SIMULATED_DEFECTS: u8 = 3;
const MIN_SIMULATED_SIDE: u32 = 8;
const MIN_CONFIDENCE: f32 = 0.30;
const CONFIDENCE_SPAN: f32 = 0.69;

// CONFIGURATION: SimulatorConfig
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    pub max_concurrent: usize,  // Simultaneous simulations (default: 64)
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self { max_concurrent: 64 }
    }
}

#[derive(Debug)]
pub struct FallbackSimulator {
    permits: Arc<Semaphore>,
    max_concurrent: usize,
}

impl FallbackSimulator {
    pub fn new() -> Self {
        Self::with_config(SimulatorConfig::default())
    }

    pub fn with_config(config: SimulatorConfig) -> Self {
        let max_concurrent = config.max_concurrent.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Claims one simulation slot without waiting. The slot frees on drop.
    pub fn try_reserve(&self) -> Option<OwnedSemaphorePermit> {
        self.permits.clone().try_acquire_owned().ok()
    }

    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Deterministic defects for an image. Empty for degenerate dimensions.
    pub fn simulate(image: &ValidatedImage) -> Vec<Defect> {
        let (width, height) = (image.width, image.height);
        if width == 0 || height == 0 {
            return Vec::new();
        }

        let digest = Sha256::new()
            .chain_update(&image.bytes)
            .chain_update(width.to_le_bytes())
            .chain_update(height.to_le_bytes())
            .finalize();

        let count = digest[0] % (MAX_SIMULATED_DEFECTS + 1);
        (0..count)
            .map(|index| {
                let stream = Sha256::new()
                    .chain_update(digest)
                    .chain_update([index])
                    .finalize();
                simulated_defect(&stream, width, height)
            })
            .collect()
    }
}

impl Default for FallbackSimulator {
    fn default() -> Self {
        Self::new()
    }
}

fn simulated_defect(stream: &[u8], width: u32, height: u32) -> Defect {
    let word = |at: usize| u32::from_le_bytes([stream[at], stream[at + 1], stream[at + 2], stream[at + 3]]);

    let label = DefectLabel::ALL[stream[0] as usize % DefectLabel::ALL.len()];

    let fraction = u16::from_le_bytes([stream[1], stream[2]]) as f32 / u16::MAX as f32;
    let confidence = ((MIN_CONFIDENCE + fraction * CONFIDENCE_SPAN) * 1000.0).round() / 1000.0;

    let (x1, x2) = span(word(4), word(8), width);
    let (y1, y2) = span(word(12), word(16), height);

    Defect::new(label, confidence, BoundingBox { x1, y1, x2, y2 })
}

/// Picks `[start, end)` inside `0..extent` with a side of at least
/// `min(MIN_SIMULATED_SIDE, extent)` and at most half the extent.
fn span(size_seed: u32, offset_seed: u32, extent: u32) -> (u32, u32) {
    let min_side = MIN_SIMULATED_SIDE.min(extent);
    let max_side = (extent / 2).max(min_side);
    let side = min_side + size_seed % (max_side - min_side + 1);
    let start = offset_seed % (extent - side + 1);
    (start, start + side)
}

#[async_trait]
impl InferenceBackend for FallbackSimulator {
    fn name(&self) -> &str {
        "simulator"
    }

    async fn load(&self) -> Result<(), InferenceError> {
        Ok(())
    }

    async fn infer(&self, image: &ValidatedImage) -> Result<Vec<RawDetection>, InferenceError> {
        let _permit = self.try_reserve().ok_or_else(|| {
            warn!(max_concurrent = self.max_concurrent, "Fallback simulator saturated");
            InferenceError::ResourceExhausted("fallback simulator saturated".to_string())
        })?;

        let image = image.clone();
        let defects = tokio::task::spawn_blocking(move || FallbackSimulator::simulate(&image))
            .await
            .map_err(|e| InferenceError::Unrecoverable(format!("simulation task failed: {e}")))?;

        debug!(defects = defects.len(), "Simulated inference");
        Ok(defects.iter().map(RawDetection::from).collect())
    }
}
