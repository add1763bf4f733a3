//! Request handling inside the background context.
//!
//! [`WorkerState`] is transport-agnostic: the native thread context and
//! the web worker entry point both feed it envelopes and post back
//! whatever it returns.

use tracing::{debug, warn};
use verdant_pipeline::{Classifier, InferenceError, LinearModel, rgba_from_raw};

use crate::protocol::{Envelope, Request, Response};
use crate::source::load_model;

/// Header sent when a response cannot be encoded at all.
const ENCODE_FAILURE_HEADER: &str = r#"{"Fatal":{"reason":"failed to encode response"}}"#;

/// The background context's state: at most one loaded model.
#[derive(Debug, Default)]
pub struct WorkerState {
    model: Option<LinearModel>,
}

impl WorkerState {
    /// A context with no model loaded.
    #[must_use]
    pub const fn new() -> Self {
        Self { model: None }
    }

    /// Whether a model is loaded.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        self.model.is_some()
    }

    /// Answer one decoded request.
    pub fn handle_request(&mut self, request: Request, pixels: Vec<u8>) -> Response {
        match request {
            Request::Init { id, model } => match load_model(&model) {
                Ok(loaded) => {
                    let labels = loaded.labels().to_vec();
                    debug!(id, labels = labels.len(), "model loaded");
                    self.model = Some(loaded);
                    Response::Ready { id, labels }
                }
                Err(error) => {
                    warn!(id, %error, "model failed to load");
                    Response::Failed { id, error }
                }
            },
            Request::Classify {
                id, width, height, ..
            } => {
                let outcome = self.classify(width, height, pixels);
                match outcome {
                    Ok(result) => Response::Classified { id, result },
                    Err(error) => Response::Failed { id, error },
                }
            }
        }
    }

    fn classify(
        &self,
        width: u32,
        height: u32,
        pixels: Vec<u8>,
    ) -> Result<verdant_pipeline::ClassificationResult, InferenceError> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| InferenceError::ModelUnavailable("model not initialized".into()))?;
        let image = rgba_from_raw(width, height, pixels)
            .map_err(|e| InferenceError::InvalidInput(e.to_string()))?;
        model.classify(&image)
    }

    /// Answer one envelope. A header that cannot be parsed yields
    /// [`Response::Fatal`].
    pub fn handle(&mut self, envelope: Envelope) -> Envelope {
        let response = match envelope.decode_request() {
            Ok(request) => self.handle_request(request, envelope.pixels),
            Err(e) => {
                warn!(error = %e, "dropping malformed request");
                Response::Fatal {
                    reason: e.to_string(),
                }
            }
        };
        Envelope::response(&response).unwrap_or_else(|_| Envelope {
            header: ENCODE_FAILURE_HEADER.to_owned(),
            pixels: Vec::new(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::protocol::ModelSource;

    const MODEL: &str =
        r#"{"labels": ["healthy", "leaf_rust"], "grid": 1, "weights": [[-6.0, 12.0, -6.0], [12.0, -2.0, -10.0]], "bias": [0.0, 0.0]}"#;

    fn init(state: &mut WorkerState) -> Response {
        state.handle_request(
            Request::Init {
                id: 1,
                model: ModelSource::Inline(MODEL.into()),
            },
            Vec::new(),
        )
    }

    fn classify_green(state: &mut WorkerState, id: u64) -> Response {
        let pixels = [40u8, 180, 40, 255].repeat(16);
        state.handle_request(
            Request::Classify {
                id,
                width: 4,
                height: 4,
                issued_at_ms: 0,
            },
            pixels,
        )
    }

    #[test]
    fn init_reports_labels() {
        let mut state = WorkerState::new();
        assert_eq!(
            init(&mut state),
            Response::Ready {
                id: 1,
                labels: vec!["healthy".into(), "leaf_rust".into()],
            }
        );
        assert!(state.is_ready());
    }

    #[test]
    fn classify_before_init_fails() {
        let mut state = WorkerState::new();
        assert!(matches!(
            classify_green(&mut state, 2),
            Response::Failed {
                id: 2,
                error: InferenceError::ModelUnavailable(_)
            }
        ));
    }

    #[test]
    fn classify_after_init_echoes_id() {
        let mut state = WorkerState::new();
        init(&mut state);
        let response = classify_green(&mut state, 7);
        assert!(
            matches!(
                &response,
                Response::Classified { id: 7, result } if result.disease_identifier() == "healthy"
            ),
            "{response:?}"
        );
    }

    #[test]
    fn short_payload_is_invalid_input() {
        let mut state = WorkerState::new();
        init(&mut state);
        let response = state.handle_request(
            Request::Classify {
                id: 3,
                width: 4,
                height: 4,
                issued_at_ms: 0,
            },
            vec![0; 10],
        );
        assert!(matches!(
            response,
            Response::Failed {
                error: InferenceError::InvalidInput(_),
                ..
            }
        ));
    }

    #[test]
    fn malformed_envelope_is_fatal() {
        let mut state = WorkerState::new();
        let reply = state.handle(Envelope {
            header: "nope".into(),
            pixels: Vec::new(),
        });
        assert!(matches!(
            reply.decode_response().unwrap(),
            Response::Fatal { .. }
        ));
    }

    #[test]
    fn encode_failure_header_is_valid_fatal() {
        let envelope = Envelope {
            header: ENCODE_FAILURE_HEADER.into(),
            pixels: Vec::new(),
        };
        assert!(matches!(
            envelope.decode_response().unwrap(),
            Response::Fatal { .. }
        ));
    }
}
