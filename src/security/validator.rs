// ARCHITECTURE: Input Validator - Untrusted Image Admission
//
// Cheap structural checks run before any byte of the payload reaches a decoder
// or the model, short-circuiting on the first failure:
// 1. SIZE: payload length within [min_bytes, max_bytes]
// 2. DIMENSIONS: declared width/height within [min_dimension, max_dimension]
// 3. CHANNELS: declared channel count in {1, 3, 4}
// 4. HEADER: magic bytes match the declared format and the parsed header
//    agrees with the declared dimensions and channels
//
// Step 4 only reads the container header; pixel data is never decoded here.

use std::{fmt, io::Cursor, str::FromStr, sync::Arc};

use image::{
    codecs::{bmp::BmpDecoder, jpeg::JpegDecoder, png::PngDecoder},
    ImageDecoder,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

// CONFIGURATION: ValidatorConfig - Admission bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    pub min_bytes: usize,       // Smallest accepted payload (default: 100 B)
    pub max_bytes: usize,       // Largest accepted payload (default: 10 MiB)
    pub min_dimension: u32,     // Smallest accepted side (default: 32 px)
    pub max_dimension: u32,     // Largest accepted side (default: 2048 px)
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            min_bytes: 100,
            max_bytes: 10 * 1024 * 1024,
            min_dimension: 32,
            max_dimension: 2048,
        }
    }
}

pub const ALLOWED_CHANNELS: [u8; 3] = [1, 3, 4];

/// Container formats the gateway accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
    Bmp,
}

impl ImageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Bmp => "bmp",
        }
    }

    fn from_detected(format: image::ImageFormat) -> Option<Self> {
        match format {
            image::ImageFormat::Png => Some(ImageFormat::Png),
            image::ImageFormat::Jpeg => Some(ImageFormat::Jpeg),
            image::ImageFormat::Bmp => Some(ImageFormat::Bmp),
            _ => None,
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageFormat {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "png" => Ok(ImageFormat::Png),
            "jpeg" | "jpg" => Ok(ImageFormat::Jpeg),
            "bmp" => Ok(ImageFormat::Bmp),
            other => Err(ValidationError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// Image as declared by the caller, not yet trusted.
#[derive(Debug, Clone)]
pub struct ImagePayload {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub format: ImageFormat,
}

/// Image that passed every admission check. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ValidatedImage {
    pub bytes: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub format: ImageFormat,
}

// CLASSIFICATION: ValidationError - Rejection reasons
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("payload is {actual} bytes, expected between {min} and {max}")]
    PayloadSize { actual: usize, min: usize, max: usize },

    #[error("declared dimensions {width}x{height} outside {min}x{min} to {max}x{max}")]
    Dimensions { width: u32, height: u32, min: u32, max: u32 },

    #[error("channel count {0} not in {{1, 3, 4}}")]
    Channels(u8),

    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("declared format {declared} does not match payload ({detected})")]
    FormatMismatch { declared: ImageFormat, detected: String },

    #[error("malformed {format} header: {reason}")]
    MalformedHeader { format: ImageFormat, reason: String },

    #[error("header reports {actual_width}x{actual_height}x{actual_channels}, declared {width}x{height}x{channels}")]
    HeaderMismatch {
        width: u32,
        height: u32,
        channels: u8,
        actual_width: u32,
        actual_height: u32,
        actual_channels: u8,
    },

    #[error("payload encoding error: {0}")]
    Encoding(String),

    #[error("confidence threshold must be a finite number")]
    Threshold,
}

impl ValidationError {
    /// Short machine-readable code used in audit metadata.
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::PayloadSize { .. } => "payload_size",
            ValidationError::Dimensions { .. } => "dimensions",
            ValidationError::Channels(_) => "channels",
            ValidationError::UnsupportedFormat(_) => "unsupported_format",
            ValidationError::FormatMismatch { .. } => "format_mismatch",
            ValidationError::MalformedHeader { .. } => "malformed_header",
            ValidationError::HeaderMismatch { .. } => "header_mismatch",
            ValidationError::Encoding(_) => "encoding",
            ValidationError::Threshold => "threshold",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct InputValidator {
    config: ValidatorConfig,
}

impl InputValidator {
    pub fn new() -> Self {
        Self::with_config(ValidatorConfig::default())
    }

    pub fn with_config(config: ValidatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    pub fn validate(&self, payload: ImagePayload) -> Result<ValidatedImage, ValidationError> {
        let cfg = &self.config;

        let len = payload.bytes.len();
        if len < cfg.min_bytes || len > cfg.max_bytes {
            return Err(ValidationError::PayloadSize {
                actual: len,
                min: cfg.min_bytes,
                max: cfg.max_bytes,
            });
        }

        let dims_ok = |v: u32| (cfg.min_dimension..=cfg.max_dimension).contains(&v);
        if !dims_ok(payload.width) || !dims_ok(payload.height) {
            return Err(ValidationError::Dimensions {
                width: payload.width,
                height: payload.height,
                min: cfg.min_dimension,
                max: cfg.max_dimension,
            });
        }

        if !ALLOWED_CHANNELS.contains(&payload.channels) {
            return Err(ValidationError::Channels(payload.channels));
        }

        self.check_header(&payload)?;

        debug!(
            bytes = len,
            width = payload.width,
            height = payload.height,
            format = %payload.format,
            "Image passed validation"
        );

        Ok(ValidatedImage {
            bytes: payload.bytes.into(),
            width: payload.width,
            height: payload.height,
            channels: payload.channels,
            format: payload.format,
        })
    }

    fn check_header(&self, payload: &ImagePayload) -> Result<(), ValidationError> {
        let declared = payload.format;
        let detected = image::guess_format(&payload.bytes).map_err(|_| ValidationError::FormatMismatch {
            declared,
            detected: "unrecognized".to_string(),
        })?;

        match ImageFormat::from_detected(detected) {
            Some(format) if format == declared => {}
            _ => {
                return Err(ValidationError::FormatMismatch {
                    declared,
                    detected: format!("{detected:?}").to_ascii_lowercase(),
                })
            }
        }

        let malformed = |e: image::ImageError| ValidationError::MalformedHeader {
            format: declared,
            reason: e.to_string(),
        };
        let cursor = Cursor::new(payload.bytes.as_slice());
        let ((width, height), channels) = match declared {
            ImageFormat::Png => header_of(PngDecoder::new(cursor).map_err(malformed)?),
            ImageFormat::Jpeg => header_of(JpegDecoder::new(cursor).map_err(malformed)?),
            ImageFormat::Bmp => header_of(BmpDecoder::new(cursor).map_err(malformed)?),
        };

        if width != payload.width || height != payload.height || channels != payload.channels {
            return Err(ValidationError::HeaderMismatch {
                width: payload.width,
                height: payload.height,
                channels: payload.channels,
                actual_width: width,
                actual_height: height,
                actual_channels: channels,
            });
        }
        Ok(())
    }
}

fn header_of<D: ImageDecoder>(decoder: D) -> ((u32, u32), u8) {
    (decoder.dimensions(), decoder.color_type().channel_count())
}

#[cfg(test)]
pub(crate) mod test_images {
    use std::io::Cursor;

    use image::{DynamicImage, GrayImage, RgbImage, RgbaImage};

    use super::{ImageFormat, ImagePayload};

    fn noise(len: usize, seed: u32) -> Vec<u8> {
        let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                (state >> 24) as u8
            })
            .collect()
    }

    /// Encodes a noisy image so the payload clears the minimum byte bound.
    pub fn encoded(width: u32, height: u32, channels: u8, format: ImageFormat, seed: u32) -> Vec<u8> {
        let pixels = (width * height) as usize;
        let image = match channels {
            1 => DynamicImage::ImageLuma8(GrayImage::from_raw(width, height, noise(pixels, seed)).unwrap()),
            4 => DynamicImage::ImageRgba8(RgbaImage::from_raw(width, height, noise(pixels * 4, seed)).unwrap()),
            _ => DynamicImage::ImageRgb8(RgbImage::from_raw(width, height, noise(pixels * 3, seed)).unwrap()),
        };
        let target = match format {
            ImageFormat::Png => image::ImageFormat::Png,
            ImageFormat::Jpeg => image::ImageFormat::Jpeg,
            ImageFormat::Bmp => image::ImageFormat::Bmp,
        };
        let mut buf = Vec::new();
        image.write_to(&mut Cursor::new(&mut buf), target).unwrap();
        buf
    }

    pub fn payload(width: u32, height: u32, channels: u8, format: ImageFormat) -> ImagePayload {
        ImagePayload {
            bytes: encoded(width, height, channels, format, width ^ height),
            width,
            height,
            channels,
            format,
        }
    }
}
