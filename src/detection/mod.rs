// ARCHITECTURE: Detection Domain Types
//
// Everything a backend produces and everything the gateway returns flows
// through these types:
// 1. RawDetection: untrusted backend output (free-form label, float box)
// 2. Defect: a sanitized region with a label from the closed set
// 3. DetectionResult: the ordered, graded result handed back to the caller
//
// Only the Result Processor turns RawDetection into Defect, so every Defect
// that leaves the crate satisfies the label/confidence/box invariants.

pub mod processor;

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

pub use processor::{ProcessorConfig, ResultProcessor};

// CLASSIFICATION: DefectLabel - Closed label set
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefectLabel {
    Good,
    Crack,
    Bulge,
    Wear,
    Puncture,
}

impl DefectLabel {
    pub const ALL: [DefectLabel; 5] = [
        DefectLabel::Good,
        DefectLabel::Crack,
        DefectLabel::Bulge,
        DefectLabel::Wear,
        DefectLabel::Puncture,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DefectLabel::Good => "good",
            DefectLabel::Crack => "crack",
            DefectLabel::Bulge => "bulge",
            DefectLabel::Wear => "wear",
            DefectLabel::Puncture => "puncture",
        }
    }

    pub fn is_defect(&self) -> bool {
        *self != DefectLabel::Good
    }
}

impl fmt::Display for DefectLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown defect label: {0}")]
pub struct UnknownLabel(pub String);

impl FromStr for DefectLabel {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "good" => Ok(DefectLabel::Good),
            "crack" => Ok(DefectLabel::Crack),
            "bulge" => Ok(DefectLabel::Bulge),
            "wear" => Ok(DefectLabel::Wear),
            "puncture" => Ok(DefectLabel::Puncture),
            other => Err(UnknownLabel(other.to_string())),
        }
    }
}

// CLASSIFICATION: Severity - Per-defect impact grade
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    /// Grades a defect from its label and confidence.
    pub fn grade(label: DefectLabel, confidence: f32) -> Self {
        let confident = confidence > 0.7;
        match label {
            DefectLabel::Good => Severity::Low,
            DefectLabel::Wear if confident => Severity::Medium,
            DefectLabel::Wear => Severity::Low,
            DefectLabel::Crack | DefectLabel::Bulge | DefectLabel::Puncture if confident => Severity::High,
            DefectLabel::Crack | DefectLabel::Bulge | DefectLabel::Puncture => Severity::Medium,
        }
    }
}

/// Pixel-space box. Serialized as `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "[u32; 4]", into = "[u32; 4]")]
pub struct BoundingBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl BoundingBox {
    pub fn width(&self) -> u32 {
        self.x2.saturating_sub(self.x1)
    }

    pub fn height(&self) -> u32 {
        self.y2.saturating_sub(self.y1)
    }

    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    /// True when the box is non-empty and lies inside a `width` x `height` image.
    pub fn is_within(&self, width: u32, height: u32) -> bool {
        self.x1 < self.x2 && self.y1 < self.y2 && self.x2 <= width && self.y2 <= height
    }
}

impl From<[u32; 4]> for BoundingBox {
    fn from([x1, y1, x2, y2]: [u32; 4]) -> Self {
        Self { x1, y1, x2, y2 }
    }
}

impl From<BoundingBox> for [u32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

// OUTPUT: Defect - Sanitized detected region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Defect {
    pub label: DefectLabel,
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub severity: Severity,
}

impl Defect {
    pub fn new(label: DefectLabel, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            label,
            confidence,
            bbox,
            severity: Severity::grade(label, confidence),
        }
    }
}

// INPUT: RawDetection - Untrusted backend output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    pub label: String,
    pub confidence: f32,
    pub bbox: [f32; 4],
}

impl From<&Defect> for RawDetection {
    fn from(defect: &Defect) -> Self {
        Self {
            label: defect.label.as_str().to_string(),
            confidence: defect.confidence,
            bbox: [
                defect.bbox.x1 as f32,
                defect.bbox.y1 as f32,
                defect.bbox.x2 as f32,
                defect.bbox.y2 as f32,
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Accept,
    Reject,
}

/// Which code path produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InferenceSource {
    Real,
    Simulated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyStatus {
    Safe,
    Monitor,
    Caution,
    Unsafe,
}

// OUTPUT: DetectionResult - Uniform result regardless of source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub request_id: String,
    pub verdict: Verdict,
    pub defects: Vec<Defect>,
    pub source: InferenceSource,
    pub duration_ms: u64,
    pub quality_score: f32,
    pub safety_status: SafetyStatus,
    pub recommendations: Vec<String>,
}
