//! The classification model.
//!
//! verdant treats the trained model as an opaque capability: a weight file
//! is loaded once and then maps a preprocessed buffer to a disease label
//! and confidence. The shipped format is a single linear layer over pooled
//! colour features:
//!
//! ```text
//! features = mean RGB (0..1) of each cell of a grid × grid pooling
//! logits   = weights · features + bias
//! result   = argmax(softmax(logits)), confidence = round(p × 100)
//! ```
//!
//! Fully transparent pixels (segmented background) are excluded from the
//! pooled means. A cell with no opaque pixels contributes zeros.

use image::RgbaImage;
use serde::{Deserialize, Serialize};

use crate::classify::{Classifier, opaque_pixels};
use crate::types::{ClassificationResult, InferenceError};

/// Largest accepted pooling grid edge.
pub const MAX_GRID: u32 = 256;

/// Serialized model weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelWeights {
    /// Output labels, one per row of `weights`.
    pub labels: Vec<String>,
    /// Pooling grid edge length; the feature vector has `3 * grid * grid`
    /// entries.
    pub grid: u32,
    /// One row of `3 * grid * grid` coefficients per label.
    pub weights: Vec<Vec<f32>>,
    /// One bias per label.
    pub bias: Vec<f32>,
}

impl ModelWeights {
    /// Length of the feature vector this model expects.
    #[must_use]
    pub const fn feature_len(&self) -> usize {
        3 * self.grid as usize * self.grid as usize
    }

    fn check(&self) -> Result<(), InferenceError> {
        if self.labels.is_empty() {
            return Err(InferenceError::InvalidModel("model has no labels".into()));
        }
        if self.grid == 0 || self.grid > MAX_GRID {
            return Err(InferenceError::InvalidModel(format!(
                "pooling grid must be between 1 and {MAX_GRID}, got {}",
                self.grid
            )));
        }
        if self.weights.len() != self.labels.len() || self.bias.len() != self.labels.len() {
            return Err(InferenceError::InvalidModel(format!(
                "{} labels but {} weight rows and {} biases",
                self.labels.len(),
                self.weights.len(),
                self.bias.len()
            )));
        }
        let expected = self.feature_len();
        if let Some((i, row)) = self
            .weights
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != expected)
        {
            return Err(InferenceError::InvalidModel(format!(
                "weight row {i} has {} coefficients, expected {expected}",
                row.len()
            )));
        }
        Ok(())
    }
}

/// A loaded, shape-checked linear model.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearModel {
    weights: ModelWeights,
}

impl LinearModel {
    /// Build a model from weights, checking their shapes.
    ///
    /// # Errors
    ///
    /// Returns [`InferenceError::InvalidModel`] if the shapes disagree.
    pub fn new(weights: ModelWeights) -> Result<Self, InferenceError> {
        weights.check()?;
        Ok(Self { weights })
    }

    /// Parse and check a JSON weight file.
    ///
    /// # Errors
    ///
    /// Returns [`InferenceError::InvalidModel`] for malformed JSON or
    /// inconsistent shapes.
    pub fn from_json(json: &str) -> Result<Self, InferenceError> {
        let weights: ModelWeights = serde_json::from_str(json)
            .map_err(|e| InferenceError::InvalidModel(format!("failed to parse weights: {e}")))?;
        Self::new(weights)
    }

    /// Output labels.
    #[must_use]
    pub fn labels(&self) -> &[String] {
        &self.weights.labels
    }

    /// Softmax probabilities for a feature vector, in label order.
    #[must_use]
    pub fn probabilities(&self, features: &[f32]) -> Vec<f32> {
        let logits: Vec<f32> = self
            .weights
            .weights
            .iter()
            .zip(&self.weights.bias)
            .map(|(row, bias)| row.iter().zip(features).map(|(w, x)| w * x).sum::<f32>() + bias)
            .collect();
        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exp: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
        let total: f32 = exp.iter().sum();
        exp.into_iter().map(|e| e / total).collect()
    }
}

impl Classifier for LinearModel {
    type Features = Vec<f32>;

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    fn extract_features(&self, image: &RgbaImage) -> Result<Vec<f32>, InferenceError> {
        let (width, height) = image.dimensions();
        let grid = self.weights.grid;
        if width < grid || height < grid {
            return Err(InferenceError::InvalidInput(format!(
                "{width}x{height} image is smaller than the {grid}x{grid} pooling grid"
            )));
        }
        if opaque_pixels(image) == 0 {
            return Err(InferenceError::InvalidInput("no plant pixels left after segmentation".into()));
        }

        let cells = grid as usize * grid as usize;
        let mut sums = vec![[0.0f32; 3]; cells];
        let mut counts = vec![0u32; cells];
        for (x, y, pixel) in image.enumerate_pixels() {
            let [r, g, b, a] = pixel.0;
            if a == 0 {
                continue;
            }
            let row = u64::from(y) * u64::from(grid) / u64::from(height);
            let col = u64::from(x) * u64::from(grid) / u64::from(width);
            let cell = (row * u64::from(grid) + col) as usize;
            sums[cell][0] += f32::from(r);
            sums[cell][1] += f32::from(g);
            sums[cell][2] += f32::from(b);
            counts[cell] += 1;
        }

        Ok(sums
            .iter()
            .zip(&counts)
            .flat_map(|(sum, &count)| {
                let n = if count == 0 { 1.0 } else { count as f32 * 255.0 };
                sum.map(|s| s / n)
            })
            .collect())
    }

    fn classify_features(&self, features: &Vec<f32>) -> Result<ClassificationResult, InferenceError> {
        if features.len() != self.weights.feature_len() {
            return Err(InferenceError::InvalidInput(format!(
                "expected {} features, got {}",
                self.weights.feature_len(),
                features.len()
            )));
        }
        let probabilities = self.probabilities(features);
        let (best, p) = probabilities
            .iter()
            .copied()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .ok_or_else(|| InferenceError::Failed("model produced no scores".into()))?;
        if !p.is_finite() {
            return Err(InferenceError::Failed("model produced non-finite scores".into()));
        }
        Ok(ClassificationResult::from_probability(
            self.weights.labels[best].clone(),
            p,
        ))
    }
}
