//! verdant-worker: The background classification context.
//!
//! Holds the model off the interactive thread. The crate has two faces:
//!
//! - an rlib with the [`protocol`] (request/response envelopes) and the
//!   transport-agnostic [`WorkerState`] handler, used by `verdant-io`'s
//!   native thread context and by tests;
//! - on `wasm32`, a cdylib whose start function installs the web worker
//!   `onmessage` handler.
//!
//! Running classification in a worker keeps the browser's main thread
//! free for UI updates and user interaction.

pub mod handler;
pub mod protocol;
pub mod source;
#[cfg(target_arch = "wasm32")]
mod wasm;

pub use handler::WorkerState;
pub use protocol::{Envelope, ModelSource, ProtocolError, Request, Response};
pub use source::load_model;
