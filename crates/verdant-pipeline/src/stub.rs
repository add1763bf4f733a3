//! Stub classifier, the last fallback tier.
//!
//! Always produces a result so the user sees something, but the result
//! carries no information about the image. The orchestrator tags it as
//! the stub tier and the analysis session never persists it.

use std::ops::RangeInclusive;
use std::sync::{Mutex, PoisonError};

use image::RgbaImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::classify::Classifier;
use crate::types::{ClassificationResult, HEALTHY, InferenceError};

/// Identifiers the stub picks from.
pub const DEFAULT_LABELS: &[&str] = &[
    HEALTHY,
    "early_blight",
    "late_blight",
    "powdery_mildew",
    "leaf_rust",
    "bacterial_spot",
];

/// Lowest confidence the stub reports.
pub const DEFAULT_MIN_CONFIDENCE: u8 = 70;

/// Highest confidence the stub reports.
pub const DEFAULT_MAX_CONFIDENCE: u8 = 92;

/// Randomized placeholder classifier.
#[derive(Debug)]
pub struct NullClassifier {
    labels: Vec<String>,
    confidence: RangeInclusive<u8>,
    rng: Mutex<StdRng>,
}

impl NullClassifier {
    /// Stub seeded from OS entropy.
    #[must_use]
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Stub with a fixed seed, for reproducible runs.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            labels: DEFAULT_LABELS.iter().map(|&s| s.to_owned()).collect(),
            confidence: DEFAULT_MIN_CONFIDENCE..=DEFAULT_MAX_CONFIDENCE,
            rng: Mutex::new(rng),
        }
    }

    /// Replace the label list. An empty list makes every call fail.
    #[must_use]
    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the confidence range. Bounds are clamped to `0..=100` and
    /// swapped if reversed.
    #[must_use]
    pub fn with_confidence(mut self, min: u8, max: u8) -> Self {
        let max_allowed = ClassificationResult::MAX_CONFIDENCE;
        let (lo, hi) = (min.min(max_allowed), max.min(max_allowed));
        self.confidence = lo.min(hi)..=lo.max(hi);
        self
    }

    /// Labels the stub picks from.
    #[must_use]
    pub fn labels(&self) -> &[String] {
        &self.labels
    }
}

impl Default for NullClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier for NullClassifier {
    type Features = ();

    fn extract_features(&self, _image: &RgbaImage) -> Result<(), InferenceError> {
        Ok(())
    }

    fn classify_features(&self, (): &()) -> Result<ClassificationResult, InferenceError> {
        if self.labels.is_empty() {
            return Err(InferenceError::Failed("stub has no labels".into()));
        }
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let label = &self.labels[rng.gen_range(0..self.labels.len())];
        let confidence = rng.gen_range(self.confidence.clone());
        Ok(ClassificationResult::new(label.clone(), confidence))
    }
}
