//! Input image validation.
//!
//! Rejects uploads that cannot produce a meaningful diagnosis before any
//! preprocessing or inference runs: wrong file type, oversized payloads,
//! images too small to show leaf detail, and frames that are too dark or
//! washed out.
//!
//! Checks run cheapest first: file metadata, then decoding, then pixel
//! statistics. Dimension is checked before brightness, so a tiny image is
//! reported as "too small" whatever its exposure.

use image::RgbaImage;
use serde::{Deserialize, Serialize};

use crate::types::{Dimensions, PipelineError, RawImage};

/// Limits applied by [`validate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationPolicy {
    /// Largest accepted payload in bytes.
    pub max_bytes: usize,
    /// Smallest accepted width and height in pixels.
    pub min_dimension: u32,
    /// Mean luminance below this is "too dark" (0–255 scale).
    pub min_brightness: f64,
    /// Mean luminance above this is "overexposed or blank" (0–255 scale).
    pub max_brightness: f64,
    /// MIME types accepted from the file picker or camera.
    pub accepted_mime_types: Vec<String>,
}

impl ValidationPolicy {
    /// 10 MiB: large phone photos fit, raw camera dumps do not.
    pub const DEFAULT_MAX_BYTES: usize = 10 * 1024 * 1024;
    /// Default minimum width/height.
    pub const DEFAULT_MIN_DIMENSION: u32 = 32;
    /// Default low-light threshold.
    pub const DEFAULT_MIN_BRIGHTNESS: f64 = 30.0;
    /// Default overexposure threshold.
    pub const DEFAULT_MAX_BRIGHTNESS: f64 = 245.0;
    /// Default accepted MIME types.
    pub const DEFAULT_MIME_TYPES: &[&str] = &[
        "image/jpeg",
        "image/jpg",
        "image/png",
        "image/webp",
        "image/bmp",
    ];

    /// Returns `true` if `mime_type` is accepted (case-insensitive,
    /// parameters such as `; charset=` ignored).
    #[must_use]
    pub fn accepts_mime(&self, mime_type: &str) -> bool {
        let essence = mime_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        self.accepted_mime_types.iter().any(|m| *m == essence)
    }
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            max_bytes: Self::DEFAULT_MAX_BYTES,
            min_dimension: Self::DEFAULT_MIN_DIMENSION,
            min_brightness: Self::DEFAULT_MIN_BRIGHTNESS,
            max_brightness: Self::DEFAULT_MAX_BRIGHTNESS,
            accepted_mime_types: Self::DEFAULT_MIME_TYPES
                .iter()
                .map(|m| (*m).to_owned())
                .collect(),
        }
    }
}

/// Reasons an image is rejected. Every message is meant for the end user.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum ValidationError {
    /// The MIME type is not an accepted image type.
    #[error("unsupported file type `{0}`: please choose a JPEG, PNG, WebP or BMP image")]
    UnsupportedType(String),

    /// The payload has no bytes.
    #[error("the selected file is empty")]
    Empty,

    /// The payload exceeds [`ValidationPolicy::max_bytes`].
    #[error("image is too large ({size} bytes): the limit is {limit} bytes")]
    TooLarge {
        /// Payload size.
        size: usize,
        /// Configured limit.
        limit: usize,
    },

    /// The bytes are not a decodable image.
    #[error("the file could not be read as an image: {0}")]
    Undecodable(String),

    /// Width or height is below [`ValidationPolicy::min_dimension`].
    #[error("image is too small ({width}x{height}): at least {min}x{min} pixels are needed")]
    TooSmall {
        /// Image width.
        width: u32,
        /// Image height.
        height: u32,
        /// Configured minimum.
        min: u32,
    },

    /// Mean luminance is below [`ValidationPolicy::min_brightness`].
    #[error("image is too dark (brightness {mean:.0} of 255): retake the photo in better light")]
    TooDark {
        /// Measured mean luminance.
        mean: f64,
    },

    /// Mean luminance is above [`ValidationPolicy::max_brightness`].
    #[error("image is overexposed or blank (brightness {mean:.0} of 255)")]
    Overexposed {
        /// Measured mean luminance.
        mean: f64,
    },
}

impl From<PipelineError> for ValidationError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::EmptyInput => Self::Empty,
            other => Self::Undecodable(other.to_string()),
        }
    }
}

/// Pixel statistics gathered while validating.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImageStats {
    /// Decoded dimensions.
    pub dimensions: Dimensions,
    /// Mean of `(r + g + b) / 3` over every pixel.
    pub mean_brightness: f64,
}

/// A validated image: the decoded buffer is handed to the caller, the
/// validator keeps nothing.
#[derive(Debug, Clone)]
pub struct Validated {
    /// The decoded pixel buffer.
    pub image: RgbaImage,
    /// Statistics computed during validation.
    pub stats: ImageStats,
}

/// The `{valid, error?}` shape reported to the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validation {
    /// Whether the image may proceed to analysis.
    pub valid: bool,
    /// Human-readable rejection reason.
    pub error: Option<String>,
}

impl<T> From<&Result<T, ValidationError>> for Validation {
    fn from(result: &Result<T, ValidationError>) -> Self {
        match result {
            Ok(_) => Self {
                valid: true,
                error: None,
            },
            Err(e) => Self {
                valid: false,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Check file metadata: MIME type, emptiness and size.
///
/// # Errors
///
/// Returns [`ValidationError::UnsupportedType`], [`ValidationError::Empty`]
/// or [`ValidationError::TooLarge`].
pub fn check_metadata(raw: &RawImage, policy: &ValidationPolicy) -> Result<(), ValidationError> {
    if !policy.accepts_mime(&raw.mime_type) {
        return Err(ValidationError::UnsupportedType(raw.mime_type.clone()));
    }
    if raw.is_empty() {
        return Err(ValidationError::Empty);
    }
    if raw.len() > policy.max_bytes {
        return Err(ValidationError::TooLarge {
            size: raw.len(),
            limit: policy.max_bytes,
        });
    }
    Ok(())
}

/// Mean per-pixel brightness `(r + g + b) / 3` over the whole buffer.
///
/// Returns `0.0` for an empty buffer.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn mean_brightness(image: &RgbaImage) -> f64 {
    let count = u64::from(image.width()) * u64::from(image.height());
    if count == 0 {
        return 0.0;
    }
    let sum: u64 = image
        .pixels()
        .map(|p| u64::from(p.0[0]) + u64::from(p.0[1]) + u64::from(p.0[2]))
        .sum();
    sum as f64 / 3.0 / count as f64
}

/// Check decoded pixel statistics: dimensions first, then brightness.
///
/// # Errors
///
/// Returns [`ValidationError::TooSmall`], [`ValidationError::TooDark`] or
/// [`ValidationError::Overexposed`].
pub fn check_pixels(
    image: &RgbaImage,
    policy: &ValidationPolicy,
) -> Result<ImageStats, ValidationError> {
    let dimensions = Dimensions::of(image);
    if dimensions.width < policy.min_dimension || dimensions.height < policy.min_dimension {
        return Err(ValidationError::TooSmall {
            width: dimensions.width,
            height: dimensions.height,
            min: policy.min_dimension,
        });
    }

    let mean = mean_brightness(image);
    if mean < policy.min_brightness {
        return Err(ValidationError::TooDark { mean });
    }
    if mean > policy.max_brightness {
        return Err(ValidationError::Overexposed { mean });
    }

    Ok(ImageStats {
        dimensions,
        mean_brightness: mean,
    })
}

/// Validate a raw image end to end and hand back the decoded buffer.
///
/// # Errors
///
/// Returns the first [`ValidationError`] encountered. Decoding failures
/// are reported as [`ValidationError::Undecodable`].
pub fn validate(raw: &RawImage, policy: &ValidationPolicy) -> Result<Validated, ValidationError> {
    check_metadata(raw, policy)?;
    let image = crate::decode::decode_rgba(&raw.bytes)?;
    let stats = check_pixels(&image, policy)?;
    Ok(Validated { image, stats })
}
