//! Model loading.

use verdant_pipeline::{InferenceError, LinearModel};

use crate::protocol::ModelSource;

/// Load and shape-check the model from `source`.
///
/// # Errors
///
/// Returns [`InferenceError::ModelUnavailable`] if the weight file cannot
/// be read, and [`InferenceError::InvalidModel`] if it is malformed.
pub fn load_model(source: &ModelSource) -> Result<LinearModel, InferenceError> {
    match source {
        ModelSource::Path(path) => {
            let json = std::fs::read_to_string(path).map_err(|e| {
                InferenceError::ModelUnavailable(format!("{}: {e}", path.display()))
            })?;
            LinearModel::from_json(&json)
        }
        ModelSource::Inline(json) => LinearModel::from_json(json),
    }
}
