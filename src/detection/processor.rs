// ARCHITECTURE: Result Processor - Source-Agnostic Post-Processing
//
// Consumes raw detections from either the real backend or the simulator and
// produces the caller-facing DetectionResult:
// 1. LABEL ENFORCEMENT: anything outside the closed label set is dropped
// 2. CONFIDENCE FILTER: non-finite, out-of-range and below-threshold scores are dropped
// 3. BOX SANITY: boxes are clamped to the image, degenerate boxes are dropped
// 4. ORDERING: descending confidence with a total tie-break
// 5. GRADING: verdict, quality score, safety status and recommendations,
//    always over every surviving defect
// 6. CAP: at most `max_defects` are returned, findings before good regions,
//    so a REJECT is always backed by a returned finding

use std::{cmp::Ordering, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{
    BoundingBox, Defect, DefectLabel, DetectionResult, InferenceSource, RawDetection,
    SafetyStatus, Severity, Verdict,
};

// CONFIGURATION: ProcessorConfig
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    pub max_defects: usize,  // Most-confident defects kept (default: 50)
    pub min_box_side: u32,   // Smallest accepted box side in pixels (default: 5)
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_defects: 50,
            min_box_side: 5,
        }
    }
}

/// Inputs describing the call a batch of raw detections belongs to.
#[derive(Debug, Clone)]
pub struct ProcessingContext {
    pub request_id: String,
    pub width: u32,
    pub height: u32,
    pub threshold: f32,
    pub source: InferenceSource,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct ResultProcessor {
    config: ProcessorConfig,
}

impl ResultProcessor {
    pub fn new() -> Self {
        Self::with_config(ProcessorConfig::default())
    }

    pub fn with_config(config: ProcessorConfig) -> Self {
        Self { config }
    }

    pub fn process(&self, raw: Vec<RawDetection>, ctx: &ProcessingContext) -> DetectionResult {
        let received = raw.len();

        let mut defects: Vec<Defect> = raw
            .into_iter()
            .filter_map(|detection| self.sanitize(detection, ctx))
            .collect();

        defects.sort_by(by_confidence);

        let verdict = if defects.iter().any(|d| d.label.is_defect()) {
            Verdict::Reject
        } else {
            Verdict::Accept
        };
        let quality_score = quality_score(&defects);
        let safety_status = safety_status(&defects);
        let recommendations = recommendations(&defects);

        if defects.len() > self.config.max_defects {
            warn!(
                request_id = %ctx.request_id,
                kept = self.config.max_defects,
                dropped = defects.len() - self.config.max_defects,
                "Detection count above cap, keeping most confident findings"
            );
            defects = cap_defects(defects, self.config.max_defects);
        }

        debug!(
            request_id = %ctx.request_id,
            received,
            kept = defects.len(),
            verdict = ?verdict,
            "Processed detections"
        );

        DetectionResult {
            request_id: ctx.request_id.clone(),
            verdict,
            quality_score,
            safety_status,
            recommendations,
            defects,
            source: ctx.source,
            duration_ms: ctx.elapsed.as_millis() as u64,
        }
    }

    fn sanitize(&self, detection: RawDetection, ctx: &ProcessingContext) -> Option<Defect> {
        let label = match detection.label.parse::<DefectLabel>() {
            Ok(label) => label,
            Err(e) => {
                debug!(request_id = %ctx.request_id, error = %e, "Dropping detection");
                return None;
            }
        };

        let confidence = detection.confidence;
        if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
            debug!(request_id = %ctx.request_id, confidence, "Dropping out-of-range confidence");
            return None;
        }
        // Compare the reported value, not the raw one
        let confidence = (confidence * 1000.0).round() / 1000.0;
        if confidence < ctx.threshold {
            return None;
        }

        let bbox = self.clamp_box(detection.bbox, ctx.width, ctx.height)?;
        Some(Defect::new(label, confidence, bbox))
    }

    fn clamp_box(&self, [x1, y1, x2, y2]: [f32; 4], width: u32, height: u32) -> Option<BoundingBox> {
        if ![x1, y1, x2, y2].iter().all(|v| v.is_finite()) || x1 >= x2 || y1 >= y2 {
            return None;
        }

        let clamp = |v: f32, max: u32| v.round().clamp(0.0, max as f32) as u32;
        let bbox = BoundingBox {
            x1: clamp(x1, width),
            y1: clamp(y1, height),
            x2: clamp(x2, width),
            y2: clamp(y2, height),
        };

        let min_side = self.config.min_box_side.max(1);
        if !bbox.is_within(width, height) || bbox.width() < min_side || bbox.height() < min_side {
            return None;
        }
        Some(bbox)
    }
}

fn by_confidence(a: &Defect, b: &Defect) -> Ordering {
    b.confidence
        .total_cmp(&a.confidence)
        .then_with(|| a.label.cmp(&b.label))
        .then_with(|| a.bbox.cmp(&b.bbox))
}

/// Keeps the `max` most confident findings, then fills with good regions.
fn cap_defects(defects: Vec<Defect>, max: usize) -> Vec<Defect> {
    let (mut kept, good): (Vec<Defect>, Vec<Defect>) =
        defects.into_iter().partition(|d| d.label.is_defect());
    kept.truncate(max);
    let room = max - kept.len();
    kept.extend(good.into_iter().take(room));
    kept.sort_by(by_confidence);
    kept
}

fn quality_score(defects: &[Defect]) -> f32 {
    let findings: Vec<&Defect> = defects.iter().filter(|d| d.label.is_defect()).collect();
    if findings.is_empty() {
        return 100.0;
    }

    let mut deduction: f64 = findings
        .iter()
        .map(|d| {
            let base = match d.severity {
                Severity::Low => 5.0,
                Severity::Medium => 15.0,
                Severity::High => 30.0,
            };
            let size_factor = (d.bbox.area() as f64 / 5000.0).min(1.5);
            base * (1.0 + size_factor * 0.3)
        })
        .sum();

    if findings.len() > 2 {
        deduction *= 1.2;
    }

    let score = (100.0 - deduction).clamp(15.0, 100.0);
    ((score * 10.0).round() / 10.0) as f32
}

fn safety_status(defects: &[Defect]) -> SafetyStatus {
    let count = |severity: Severity| {
        defects
            .iter()
            .filter(|d| d.label.is_defect() && d.severity == severity)
            .count()
    };

    if count(Severity::High) >= 1 {
        SafetyStatus::Unsafe
    } else if count(Severity::Medium) >= 3 {
        SafetyStatus::Caution
    } else if count(Severity::Low) >= 5 {
        SafetyStatus::Monitor
    } else {
        SafetyStatus::Safe
    }
}

const MAX_RECOMMENDATIONS: usize = 6;

/// Operator guidance, most urgent first.
fn recommendations(defects: &[Defect]) -> Vec<String> {
    let has = |label: DefectLabel| defects.iter().any(|d| d.label == label);
    let any_severity = |severity: Severity| {
        defects
            .iter()
            .any(|d| d.label.is_defect() && d.severity == severity)
    };

    if !defects.iter().any(|d| d.label.is_defect()) {
        return vec![
            "Tire condition is good, continue normal use".to_string(),
            "Schedule the next inspection per the maintenance plan".to_string(),
        ];
    }

    let mut out: Vec<&str> = Vec::new();
    if has(DefectLabel::Crack) {
        out.push("URGENT: replace tire, cracking compromises structural integrity");
    }
    if has(DefectLabel::Bulge) {
        out.push("CRITICAL: remove from service, a bulge indicates internal ply damage");
    }
    if has(DefectLabel::Puncture) {
        out.push("Inspect the puncture for repairability before returning to service");
    }
    if has(DefectLabel::Wear) {
        out.push("Check wheel alignment and inflation pressure");
        out.push("Rotate tires to even out tread wear");
    }

    if any_severity(Severity::High) {
        out.push("Schedule an immediate professional inspection");
        out.push("Avoid high-speed operation until resolved");
    } else if any_severity(Severity::Medium) {
        out.push("Schedule a professional inspection within 1-2 weeks");
        out.push("Monitor defect progression closely");
    }

    out.into_iter().take(MAX_RECOMMENDATIONS).map(str::to_string).collect()
}
