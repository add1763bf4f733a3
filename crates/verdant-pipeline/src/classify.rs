//! The classification capability shared by every strategy.
//!
//! A strategy first extracts its own feature representation from a
//! preprocessed buffer and then maps those features to a
//! [`ClassificationResult`]. The model, the classical colour classifier and
//! the stub all implement [`Classifier`]; the orchestrator in `verdant-io`
//! decides which one runs.

use image::RgbaImage;

use crate::types::{ClassificationResult, InferenceError};

/// A classification strategy.
pub trait Classifier {
    /// Feature representation the strategy works on.
    type Features;

    /// Compute features from a preprocessed buffer.
    ///
    /// # Errors
    ///
    /// Returns [`InferenceError`] when the buffer cannot be used.
    fn extract_features(&self, image: &RgbaImage) -> Result<Self::Features, InferenceError>;

    /// Map features to a result.
    ///
    /// # Errors
    ///
    /// Returns [`InferenceError`] when no result can be produced.
    fn classify_features(
        &self,
        features: &Self::Features,
    ) -> Result<ClassificationResult, InferenceError>;

    /// Extract features and classify them.
    ///
    /// # Errors
    ///
    /// Propagates errors from either step.
    fn classify(&self, image: &RgbaImage) -> Result<ClassificationResult, InferenceError> {
        let features = self.extract_features(image)?;
        self.classify_features(&features)
    }
}

/// Count of pixels with non-zero alpha.
///
/// Segmentation marks background as fully transparent; classifiers only
/// look at what is left.
#[must_use]
pub fn opaque_pixels(image: &RgbaImage) -> u64 {
    image.pixels().map(|p| u64::from(p.0[3] > 0)).sum()
}
