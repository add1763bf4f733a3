//! verdant-pipeline: Pure leaf-image processing and classification (sans-IO).
//!
//! Takes an encoded leaf photograph through:
//! decode -> validate -> resize -> normalize -> contrast -> segment ->
//! classify.
//!
//! Classification is pluggable via [`Classifier`]. Three strategies live
//! here: [`LinearModel`] (the trained model), [`ClassicalClassifier`]
//! (colour and edge features) and [`NullClassifier`] (randomized stub).
//! Choosing between them, and running the model off the interactive
//! thread, is the job of `verdant-io`.
//!
//! This crate has **no I/O dependencies** -- it operates on in-memory
//! byte slices and pixel buffers and returns structured data.

pub mod classical;
pub mod classify;
pub mod decode;
pub mod model;
pub mod preprocess;
pub mod stub;
pub mod types;
pub mod validate;

pub use classical::{ClassicalClassifier, ColourFeatures};
pub use classify::Classifier;
pub use model::{LinearModel, MAX_GRID, ModelWeights};
pub use preprocess::{Background, PreprocessOptions, Segmentation, preprocess};
pub use stub::NullClassifier;
pub use types::{
    ClassificationResult, Dimensions, HEALTHY, InferenceError, MODEL_INPUT_SIZE, PipelineError,
    RawImage, RgbaImage, rgba_from_raw,
};
pub use validate::{Validated, Validation, ValidationError, ValidationPolicy, validate};
