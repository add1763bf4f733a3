//! Classical colour/texture classifier.
//!
//! The third fallback tier. No model assets: the leaf is described by the
//! fraction of leaf pixels in a handful of colour classes plus the
//! density of Canny edges, and a fixed rule table maps those features to a
//! disease identifier. Lower fidelity than the model, so confidence never
//! exceeds [`MAX_CLASSICAL_CONFIDENCE`].

use image::{GrayImage, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::classify::Classifier;
use crate::preprocess::BACKGROUND_GRAY;
use crate::types::{ClassificationResult, HEALTHY, InferenceError};

/// Confidence ceiling for classical results.
pub const MAX_CLASSICAL_CONFIDENCE: u8 = 85;

/// Confidence assigned before the dominant fraction is added.
const BASE_CONFIDENCE: f64 = 40.0;

/// Gaussian sigma applied before edge detection.
pub const DEFAULT_BLUR_SIGMA: f32 = 1.4;

/// Canny hysteresis thresholds.
pub const DEFAULT_CANNY_LOW: f32 = 20.0;
/// See [`DEFAULT_CANNY_LOW`].
pub const DEFAULT_CANNY_HIGH: f32 = 50.0;

/// Colour class of a single pixel. The first matching class wins, in
/// declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Colour {
    White,
    Dark,
    Yellow,
    Rust,
    Brown,
    Green,
}

fn colour_of(r: u8, g: u8, b: u8) -> Option<Colour> {
    if r.min(g).min(b) >= 200 {
        Some(Colour::White)
    } else if r.max(g).max(b) < 50 {
        Some(Colour::Dark)
    } else if r >= 150 && g >= 150 && b < 100 {
        Some(Colour::Yellow)
    } else if r >= 180 && (60..140).contains(&g) && b < 80 {
        Some(Colour::Rust)
    } else if r > g && g > b && (60..180).contains(&r) {
        Some(Colour::Brown)
    } else if g > r && g > b {
        Some(Colour::Green)
    } else {
        None
    }
}

/// Features the classical tier works on. Every fraction is relative to
/// the number of leaf pixels, i.e. pixels not filled as background by
/// segmentation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ColourFeatures {
    /// Healthy leaf tissue.
    pub green: f64,
    /// Chlorosis.
    pub yellow: f64,
    /// Orange pustules.
    pub rust: f64,
    /// Necrotic lesions.
    pub brown: f64,
    /// Powdery coating.
    pub white: f64,
    /// Water-soaked or black lesions.
    pub dark: f64,
    /// Fraction of all pixels that are Canny edges.
    pub edge_density: f64,
}

/// Rule-based classifier over [`ColourFeatures`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassicalClassifier {
    /// Sigma for the pre-edge Gaussian blur.
    pub blur_sigma: f32,
    /// Canny low threshold.
    pub canny_low: f32,
    /// Canny high threshold.
    pub canny_high: f32,
}

impl Default for ClassicalClassifier {
    fn default() -> Self {
        Self {
            blur_sigma: DEFAULT_BLUR_SIGMA,
            canny_low: DEFAULT_CANNY_LOW,
            canny_high: DEFAULT_CANNY_HIGH,
        }
    }
}

impl ClassicalClassifier {
    /// Fraction of pixels marked as edges by Canny after blurring.
    #[must_use = "returns the edge density"]
    #[allow(clippy::cast_precision_loss)]
    pub fn edge_density(&self, image: &RgbaImage) -> f64 {
        let total = u64::from(image.width()) * u64::from(image.height());
        if total == 0 {
            return 0.0;
        }
        let gray: GrayImage = image::imageops::grayscale(image);
        let blurred = if self.blur_sigma > 0.0 {
            imageproc::filter::gaussian_blur_f32(&gray, self.blur_sigma)
        } else {
            gray
        };
        let high = self.canny_high.max(1.0);
        let low = self.canny_low.max(1.0).min(high);
        let edges = imageproc::edges::canny(&blurred, low, high);
        let edge_pixels = edges.pixels().filter(|p| p.0[0] > 0).count();
        edge_pixels as f64 / total as f64
    }
}

fn result(identifier: &str, fraction: f64) -> ClassificationResult {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let score = (BASE_CONFIDENCE + fraction.clamp(0.0, 1.0) * 100.0)
        .round()
        .min(f64::from(MAX_CLASSICAL_CONFIDENCE)) as u8;
    ClassificationResult::new(identifier, score)
}

impl Classifier for ClassicalClassifier {
    type Features = ColourFeatures;

    #[allow(clippy::cast_precision_loss)]
    fn extract_features(&self, image: &RgbaImage) -> Result<ColourFeatures, InferenceError> {
        let mut counts = [0u64; 6];
        let mut leaf = 0u64;
        for pixel in image.pixels() {
            // Segmentation fills background with one of two fixed colours.
            if pixel.0[3] == 0 || *pixel == BACKGROUND_GRAY {
                continue;
            }
            leaf += 1;
            let [r, g, b, _] = pixel.0;
            if let Some(colour) = colour_of(r, g, b) {
                counts[colour as usize] += 1;
            }
        }
        if leaf == 0 {
            return Err(InferenceError::InvalidInput(
                "no plant pixels left after segmentation".into(),
            ));
        }
        let frac = |c: Colour| counts[c as usize] as f64 / leaf as f64;

        Ok(ColourFeatures {
            green: frac(Colour::Green),
            yellow: frac(Colour::Yellow),
            rust: frac(Colour::Rust),
            brown: frac(Colour::Brown),
            white: frac(Colour::White),
            dark: frac(Colour::Dark),
            edge_density: self.edge_density(image),
        })
    }

    fn classify_features(
        &self,
        f: &ColourFeatures,
    ) -> Result<ClassificationResult, InferenceError> {
        if f.white >= 0.15 {
            return Ok(result("powdery_mildew", f.white));
        }
        if f.rust >= 0.10 {
            return Ok(result("leaf_rust", f.rust));
        }
        if f.dark >= 0.05 && f.edge_density >= 0.10 {
            return Ok(result("bacterial_spot", f.dark + f.edge_density));
        }
        if f.dark >= 0.20 {
            return Ok(result("late_blight", f.dark));
        }
        if f.brown >= 0.15 {
            return Ok(result("early_blight", f.brown));
        }
        if f.green >= 0.5 {
            return Ok(result(HEALTHY, f.green));
        }

        // No rule fired: fall back to the dominant symptom colour.
        let candidates = [
            ("powdery_mildew", f.white),
            ("leaf_rust", f.rust),
            ("late_blight", f.dark),
            ("early_blight", f.brown + f.yellow),
            (HEALTHY, f.green),
        ];
        candidates
            .into_iter()
            .filter(|(_, fraction)| *fraction > 0.0)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(id, fraction)| result(id, fraction / 2.0))
            .ok_or_else(|| InferenceError::Failed("no recognisable leaf colours".into()))
    }
}
