//! Messages exchanged between the interactive thread and the background
//! context.
//!
//! Every message is an [`Envelope`]: a small JSON header plus an optional
//! raw pixel payload. Pixel buffers are large, so they travel out-of-band
//! as bytes (a `Uint8Array` across a web worker boundary) instead of being
//! JSON-encoded as number arrays.
//!
//! Requests and responses carry the correlation id the channel assigned.
//! [`Response::Fatal`] has no id: it reports that the context itself is
//! broken and every outstanding request should be abandoned.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use verdant_pipeline::{ClassificationResult, InferenceError};

/// Where the model weights come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelSource {
    /// A JSON weight file on the local filesystem (native contexts only).
    Path(PathBuf),
    /// The JSON weights themselves, already fetched by the caller.
    Inline(String),
}

/// A message to the background context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Load the model. Answered by [`Response::Ready`] or
    /// [`Response::Failed`].
    Init {
        /// Correlation id.
        id: u64,
        /// Weights to load.
        model: ModelSource,
    },
    /// Classify the envelope's pixel payload, a `width × height` RGBA
    /// buffer.
    Classify {
        /// Correlation id.
        id: u64,
        /// Buffer width.
        width: u32,
        /// Buffer height.
        height: u32,
        /// Wall-clock send time in milliseconds since the Unix epoch.
        issued_at_ms: u64,
    },
}

impl Request {
    /// Correlation id.
    #[must_use]
    pub const fn id(&self) -> u64 {
        match self {
            Self::Init { id, .. } | Self::Classify { id, .. } => *id,
        }
    }
}

/// A message from the background context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// The model loaded.
    Ready {
        /// Id of the `Init` request.
        id: u64,
        /// Labels the model can emit.
        labels: Vec<String>,
    },
    /// Classification succeeded.
    Classified {
        /// Id of the `Classify` request.
        id: u64,
        /// The model's answer.
        result: ClassificationResult,
    },
    /// A request failed; the context is still usable.
    Failed {
        /// Id of the failed request.
        id: u64,
        /// Why it failed.
        error: InferenceError,
    },
    /// The context cannot continue.
    Fatal {
        /// What went wrong.
        reason: String,
    },
}

impl Response {
    /// Correlation id, absent for [`Response::Fatal`].
    #[must_use]
    pub const fn id(&self) -> Option<u64> {
        match self {
            Self::Ready { id, .. } | Self::Classified { id, .. } | Self::Failed { id, .. } => {
                Some(*id)
            }
            Self::Fatal { .. } => None,
        }
    }
}

/// Errors encoding or decoding an [`Envelope`] header.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// A message could not be serialized.
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    /// A header could not be parsed.
    #[error("malformed message header: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Wire form of a message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Envelope {
    /// JSON-encoded [`Request`] or [`Response`].
    pub header: String,
    /// Raw RGBA bytes for `Classify`; empty otherwise.
    pub pixels: Vec<u8>,
}

impl Envelope {
    /// Encode a request with its pixel payload.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Encode`] if serialization fails.
    pub fn request(request: &Request, pixels: Vec<u8>) -> Result<Self, ProtocolError> {
        Ok(Self {
            header: serde_json::to_string(request).map_err(ProtocolError::Encode)?,
            pixels,
        })
    }

    /// Encode a response. Responses never carry pixels.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Encode`] if serialization fails.
    pub fn response(response: &Response) -> Result<Self, ProtocolError> {
        Ok(Self {
            header: serde_json::to_string(response).map_err(ProtocolError::Encode)?,
            pixels: Vec::new(),
        })
    }

    /// Parse the header as a request.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Decode`] for a malformed header.
    pub fn decode_request(&self) -> Result<Request, ProtocolError> {
        serde_json::from_str(&self.header).map_err(ProtocolError::Decode)
    }

    /// Parse the header as a response.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Decode`] for a malformed header.
    pub fn decode_response(&self) -> Result<Response, ProtocolError> {
        serde_json::from_str(&self.header).map_err(ProtocolError::Decode)
    }
}
