//! Image preprocessing ahead of classification.
//!
//! Four independent transforms, applied in this order by [`preprocess`]:
//!
//! 1. [`resize`] to the model's square input size (bilinear). The aspect
//!    ratio is **not** preserved: non-square photos are stretched. This is
//!    a known limitation, kept because the model was fitted on stretched
//!    inputs.
//! 2. [`normalize`]: stretch the observed range of per-pixel average
//!    luminance to `[0, 255]`.
//! 3. [`enhance_contrast`]: stretch the global range of all R, G and B
//!    samples to `[0, 255]`.
//! 4. [`segment`]: keep green-dominant pixels as plant foreground and
//!    replace everything else with transparency or a flat light gray.
//!
//! Every transform borrows its input and returns a new buffer, so a
//! caller holding the original never observes a mutation.

use image::{Rgba, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::types::MODEL_INPUT_SIZE;

/// Fill used for background pixels when not transparent.
pub const BACKGROUND_GRAY: Rgba<u8> = Rgba([240, 240, 240, 255]);

/// Fill used for background pixels when transparent.
pub const BACKGROUND_TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);

/// Options for [`preprocess`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessOptions {
    /// Apply luminance normalization.
    pub normalize: bool,
    /// Apply per-channel contrast enhancement.
    pub enhance_contrast: bool,
    /// Replace non-plant pixels with a background fill.
    pub segment_background: bool,
    /// Green-dominance factor for segmentation (see [`is_foreground`]).
    pub threshold: f32,
    /// Use full transparency instead of light gray for background pixels.
    pub transparent_background: bool,
    /// Square edge length the image is resized to.
    pub input_size: u32,
}

impl PreprocessOptions {
    /// Default segmentation threshold.
    pub const DEFAULT_THRESHOLD: f32 = 1.1;
}

impl Default for PreprocessOptions {
    fn default() -> Self {
        Self {
            normalize: true,
            enhance_contrast: false,
            segment_background: false,
            threshold: Self::DEFAULT_THRESHOLD,
            transparent_background: false,
            input_size: MODEL_INPUT_SIZE,
        }
    }
}

/// How background pixels are filled by [`segment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Background {
    /// Alpha set to zero.
    Transparent,
    /// Flat [`BACKGROUND_GRAY`].
    LightGray,
}

impl Background {
    const fn fill(self) -> Rgba<u8> {
        match self {
            Self::Transparent => BACKGROUND_TRANSPARENT,
            Self::LightGray => BACKGROUND_GRAY,
        }
    }
}

/// Output of [`segment`].
#[derive(Debug, Clone)]
pub struct Segmentation {
    /// The segmented buffer.
    pub image: RgbaImage,
    /// Number of pixels kept as plant foreground.
    pub foreground_pixels: u64,
    /// Total number of pixels.
    pub total_pixels: u64,
}

impl Segmentation {
    /// Share of pixels kept as foreground, `0.0..=1.0`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn foreground_fraction(&self) -> f64 {
        if self.total_pixels == 0 {
            return 0.0;
        }
        self.foreground_pixels as f64 / self.total_pixels as f64
    }
}

/// Bilinear resize to `size × size`, ignoring aspect ratio.
#[must_use = "returns the resized image"]
pub fn resize(image: &RgbaImage, size: u32) -> RgbaImage {
    if image.dimensions() == (size, size) {
        return image.clone();
    }
    image::imageops::resize(image, size, size, image::imageops::FilterType::Triangle)
}

/// Linear stretch of per-pixel average luminance to `[0, 255]`.
///
/// Luminance is `(r + g + b) / 3`. With observed minimum `lo` and
/// maximum `hi`, every colour channel `c` becomes
/// `(c - lo) * 255 / (hi - lo)`, clamped. Alpha is untouched.
///
/// Returns an unchanged copy when the range is zero (flat image) or
/// already spans `[0, 255]`, which makes the transform idempotent.
#[must_use = "returns the normalized image"]
pub fn normalize(image: &RgbaImage) -> RgbaImage {
    let Some((lo, hi)) = value_range(image.pixels().map(|p| {
        (f32::from(p.0[0]) + f32::from(p.0[1]) + f32::from(p.0[2])) / 3.0
    })) else {
        return image.clone();
    };
    stretch(image, lo, hi)
}

/// Linear stretch of every colour channel using the global min/max over
/// all R, G and B samples.
///
/// Differs from [`normalize`], which ranges over averaged luminance: a
/// single saturated channel prevents this transform from stretching.
#[must_use = "returns the contrast-enhanced image"]
pub fn enhance_contrast(image: &RgbaImage) -> RgbaImage {
    let Some((lo, hi)) = value_range(
        image
            .pixels()
            .flat_map(|p| [p.0[0], p.0[1], p.0[2]])
            .map(f32::from),
    ) else {
        return image.clone();
    };
    stretch(image, lo, hi)
}

/// Returns `true` if the pixel is plant foreground: green exceeds both
/// red and blue scaled by `threshold`.
#[must_use]
pub fn is_foreground(pixel: Rgba<u8>, threshold: f32) -> bool {
    let [r, g, b, _] = pixel.0;
    let g = f32::from(g);
    g > f32::from(r) * threshold && g > f32::from(b) * threshold
}

/// Replace background pixels with `background`, keeping foreground ones.
#[must_use = "returns the segmented image"]
pub fn segment(image: &RgbaImage, threshold: f32, background: Background) -> Segmentation {
    let fill = background.fill();
    let mut foreground_pixels = 0u64;
    let segmented = RgbaImage::from_fn(image.width(), image.height(), |x, y| {
        let pixel = *image.get_pixel(x, y);
        if is_foreground(pixel, threshold) {
            foreground_pixels += 1;
            pixel
        } else {
            fill
        }
    });
    Segmentation {
        image: segmented,
        foreground_pixels,
        total_pixels: u64::from(image.width()) * u64::from(image.height()),
    }
}

/// Run the enabled transforms in order: resize, normalize, contrast,
/// segment.
#[must_use = "returns the preprocessed image"]
pub fn preprocess(image: &RgbaImage, options: &PreprocessOptions) -> RgbaImage {
    let mut current = resize(image, options.input_size);
    if options.normalize {
        current = normalize(&current);
    }
    if options.enhance_contrast {
        current = enhance_contrast(&current);
    }
    if options.segment_background {
        let background = if options.transparent_background {
            Background::Transparent
        } else {
            Background::LightGray
        };
        current = segment(&current, options.threshold, background).image;
    }
    current
}

/// Observed `(min, max)` of `values`, or `None` when the stretch would be
/// a no-op (empty input, zero range, or already full range).
fn value_range(values: impl Iterator<Item = f32>) -> Option<(f32, f32)> {
    let (lo, hi) = values.fold((f32::MAX, f32::MIN), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if lo > hi {
        return None;
    }
    let range = hi - lo;
    if range <= f32::EPSILON || (lo <= 0.0 && hi >= 255.0) {
        return None;
    }
    Some((lo, hi))
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn stretch(image: &RgbaImage, lo: f32, hi: f32) -> RgbaImage {
    let scale = 255.0 / (hi - lo);
    let map = |c: u8| ((f32::from(c) - lo) * scale).round().clamp(0.0, 255.0) as u8;
    RgbaImage::from_fn(image.width(), image.height(), |x, y| {
        let [r, g, b, a] = image.get_pixel(x, y).0;
        Rgba([map(r), map(g), map(b), a])
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32, lo: u8, hi: u8) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, _| {
            let t = f32::from(hi - lo) * x as f32 / (width - 1) as f32;
            let v = lo + t.round() as u8;
            Rgba([v, v, v, 255])
        })
    }

    #[test]
    fn resize_produces_square_input() {
        let img = RgbaImage::from_pixel(300, 120, Rgba([10, 200, 10, 255]));
        let resized = resize(&img, 224);
        assert_eq!(resized.dimensions(), (224, 224));
        assert_eq!(*resized.get_pixel(100, 100), Rgba([10, 200, 10, 255]));
    }

    #[test]
    fn normalize_is_idempotent_on_full_range_buffer() {
        let img = gradient(16, 4, 0, 255);
        let once = normalize(&img);
        assert_eq!(once.as_raw(), img.as_raw());
        let twice = normalize(&once);
        assert_eq!(twice.as_raw(), once.as_raw());
    }

    #[test]
    fn normalize_stretches_narrow_range() {
        let img = gradient(2, 1, 100, 150);
        let out = normalize(&img);
        assert_eq!(out.get_pixel(0, 0).0, [0, 0, 0, 255]);
        assert_eq!(out.get_pixel(1, 0).0, [255, 255, 255, 255]);
    }

    #[test]
    fn normalize_leaves_flat_image_untouched() {
        let img = RgbaImage::from_pixel(8, 8, Rgba([90, 120, 60, 255]));
        assert_eq!(normalize(&img).as_raw(), img.as_raw());
    }

    #[test]
    fn normalize_does_not_mutate_input() {
        let img = gradient(8, 2, 50, 100);
        let before = img.clone();
        let _ = normalize(&img);
        assert_eq!(img.as_raw(), before.as_raw());
    }

    #[test]
    fn contrast_uses_channel_extremes_not_luminance() {
        // Luminance spans 40..=80 but a saturated green channel already
        // reaches 200, so contrast stretches to 0..=255 on the channel
        // range while normalize stretches on luminance.
        let img = RgbaImage::from_fn(2, 1, |x, _| {
            if x == 0 {
                Rgba([20, 80, 20, 255])
            } else {
                Rgba([20, 200, 20, 255])
            }
        });
        let contrast = enhance_contrast(&img);
        assert_eq!(contrast.get_pixel(0, 0).0, [0, 85, 0, 255]);
        assert_eq!(contrast.get_pixel(1, 0).0, [0, 255, 0, 255]);

        let normalized = normalize(&img);
        assert_ne!(normalized.as_raw(), contrast.as_raw());
    }

    #[test]
    fn contrast_is_noop_when_channels_span_full_range() {
        let img = RgbaImage::from_fn(2, 1, |x, _| {
            if x == 0 {
                Rgba([0, 128, 30, 255])
            } else {
                Rgba([255, 90, 30, 255])
            }
        });
        assert_eq!(enhance_contrast(&img).as_raw(), img.as_raw());
    }

    #[test]
    fn green_dominant_buffer_is_all_foreground() {
        let img = RgbaImage::from_pixel(10, 10, Rgba([40, 80, 40, 255]));
        let seg = segment(&img, 1.1, Background::LightGray);
        assert_eq!(seg.foreground_pixels, 100);
        assert!((seg.foreground_fraction() - 1.0).abs() < f64::EPSILON);
        assert_eq!(seg.image.as_raw(), img.as_raw());
    }

    #[test]
    fn gray_buffer_is_all_background() {
        let img = RgbaImage::from_pixel(10, 10, Rgba([90, 90, 90, 255]));
        let seg = segment(&img, 1.1, Background::LightGray);
        assert_eq!(seg.foreground_pixels, 0);
        assert!(seg.image.pixels().all(|p| *p == BACKGROUND_GRAY));
    }

    #[test]
    fn transparent_background_zeroes_alpha() {
        let img = RgbaImage::from_pixel(3, 3, Rgba([200, 100, 50, 255]));
        let seg = segment(&img, 1.1, Background::Transparent);
        assert!(seg.image.pixels().all(|p| p.0[3] == 0));
    }

    #[test]
    fn threshold_is_strict() {
        // g == r * threshold is not foreground.
        assert!(!is_foreground(Rgba([100, 110, 0, 255]), 1.1));
        assert!(is_foreground(Rgba([100, 111, 0, 255]), 1.1));
    }

    #[test]
    fn preprocess_defaults_resize_and_normalize_only() {
        let img = gradient(64, 32, 60, 120);
        let out = preprocess(&img, &PreprocessOptions::default());
        assert_eq!(out.dimensions(), (MODEL_INPUT_SIZE, MODEL_INPUT_SIZE));
        let (lo, hi) = out
            .pixels()
            .fold((u8::MAX, u8::MIN), |(lo, hi), p| (lo.min(p.0[0]), hi.max(p.0[0])));
        assert_eq!((lo, hi), (0, 255));
    }

    #[test]
    fn preprocess_with_segmentation_masks_background() {
        let img = RgbaImage::from_fn(40, 40, |x, _| {
            if x < 20 {
                Rgba([30, 160, 30, 255])
            } else {
                Rgba([120, 110, 100, 255])
            }
        });
        let options = PreprocessOptions {
            normalize: false,
            segment_background: true,
            transparent_background: true,
            input_size: 40,
            ..PreprocessOptions::default()
        };
        let out = preprocess(&img, &options);
        assert_eq!(out.get_pixel(5, 5).0[3], 255);
        assert_eq!(out.get_pixel(35, 5).0[3], 0);
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let options: PreprocessOptions =
            serde_json::from_str(r#"{"enhance_contrast": true}"#).unwrap();
        assert!(options.normalize);
        assert!(options.enhance_contrast);
        assert!((options.threshold - 1.1).abs() < f32::EPSILON);
        assert_eq!(options.input_size, MODEL_INPUT_SIZE);
    }
}
