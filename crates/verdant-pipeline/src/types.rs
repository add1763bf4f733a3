//! Shared types for the verdant image pipeline.

use serde::{Deserialize, Serialize};

/// Re-export `RgbaImage` so downstream crates can pass decoded pixel
/// buffers around without depending on `image` directly.
pub use image::RgbaImage;

/// Identifier the classifiers emit for a leaf with no visible disease.
pub const HEALTHY: &str = "healthy";

/// Fixed square input dimension of the classification model.
pub const MODEL_INPUT_SIZE: u32 = 224;

/// An encoded image as supplied by the capture or file-selection UI.
///
/// Ephemeral: created on selection/capture and dropped once decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawImage {
    /// Encoded file bytes (PNG, JPEG, BMP, WebP).
    pub bytes: Vec<u8>,
    /// MIME type declared by the source (file picker or camera).
    pub mime_type: String,
}

impl RawImage {
    /// Create a raw image from its bytes and declared MIME type.
    #[must_use]
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
        }
    }

    /// Payload length in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns `true` if the payload has no bytes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Image dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Dimensions {
    /// Dimensions of a decoded buffer.
    #[must_use]
    pub fn of(image: &RgbaImage) -> Self {
        Self {
            width: image.width(),
            height: image.height(),
        }
    }

    /// Total pixel count.
    #[must_use]
    pub const fn pixel_count(self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Output of exactly one classification strategy.
///
/// Immutable once produced; the confidence is clamped to `0..=100` on
/// construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClassificationResult {
    disease_identifier: String,
    confidence_score: u8,
}

impl ClassificationResult {
    /// Maximum confidence score.
    pub const MAX_CONFIDENCE: u8 = 100;

    /// Create a result, clamping `confidence_score` to [`Self::MAX_CONFIDENCE`].
    #[must_use]
    pub fn new(disease_identifier: impl Into<String>, confidence_score: u8) -> Self {
        Self {
            disease_identifier: disease_identifier.into(),
            confidence_score: confidence_score.min(Self::MAX_CONFIDENCE),
        }
    }

    /// Create a result from a probability in `[0, 1]`.
    ///
    /// Non-finite probabilities map to zero confidence.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn from_probability(disease_identifier: impl Into<String>, probability: f32) -> Self {
        let percent = if probability.is_finite() {
            (probability.clamp(0.0, 1.0) * 100.0).round() as u8
        } else {
            0
        };
        Self::new(disease_identifier, percent)
    }

    /// The enum-like disease key (e.g. `"early_blight"`, `"healthy"`).
    #[must_use]
    pub fn disease_identifier(&self) -> &str {
        &self.disease_identifier
    }

    /// Confidence in percent, `0..=100`.
    #[must_use]
    pub const fn confidence_score(&self) -> u8 {
        self.confidence_score
    }

    /// Returns `true` when the identifier is [`HEALTHY`].
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.disease_identifier == HEALTHY
    }
}

/// Errors from decoding raw image bytes.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Failed to decode the input image.
    #[error("failed to decode image: {0}")]
    ImageDecode(#[from] image::ImageError),

    /// The input image bytes were empty.
    #[error("input image data is empty")]
    EmptyInput,

    /// A raw pixel payload does not match its declared dimensions.
    #[error("pixel buffer of {len} bytes does not match {width}x{height} RGBA")]
    BufferMismatch {
        /// Declared width.
        width: u32,
        /// Declared height.
        height: u32,
        /// Actual payload length.
        len: usize,
    },
}

/// Errors raised by a classification strategy.
///
/// Crosses the worker boundary as JSON, so every variant carries only
/// strings.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum InferenceError {
    /// Model assets could not be loaded (missing file, unreachable URL).
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    /// Model assets were loaded but are malformed.
    #[error("invalid model: {0}")]
    InvalidModel(String),

    /// The pixel buffer cannot be classified (e.g. no plant pixels).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The classifier raised for another reason.
    #[error("inference failed: {0}")]
    Failed(String),
}

/// Rebuild an RGBA buffer from raw bytes received over a message channel.
///
/// # Errors
///
/// Returns [`PipelineError::BufferMismatch`] if `pixels` is not exactly
/// `width * height * 4` bytes.
pub fn rgba_from_raw(width: u32, height: u32, pixels: Vec<u8>) -> Result<RgbaImage, PipelineError> {
    let len = pixels.len();
    RgbaImage::from_raw(width, height, pixels).ok_or(PipelineError::BufferMismatch {
        width,
        height,
        len,
    })
}
