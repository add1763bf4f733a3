//! verdant-io: Background execution, tiered inference and analysis
//! sessions.
//!
//! The pipeline and diagnosis crates are pure; this crate adds the parts
//! that wait on something: a [`Channel`] to a background execution
//! context (a native thread or a web worker), timers, the four-tier
//! [`Orchestrator`], the [`Analyzer`] that runs one upload end to end,
//! and the camera capture guard.

pub mod analysis;
pub mod capture;
pub mod channel;
pub mod config;
pub mod orchestrator;
pub mod pending;
#[cfg(not(target_arch = "wasm32"))]
pub mod thread;
pub mod timer;
#[cfg(target_arch = "wasm32")]
pub mod web;

#[cfg(test)]
mod testing;

pub use analysis::{Analysis, AnalysisError, Analyzer, GENERIC_RETRY_MESSAGE, TIMEOUT_MESSAGE};
pub use capture::{CameraSession, MediaTrack};
pub use channel::{
    Channel, ChannelConfig, ChannelError, ChannelStatus, ContextFactory, ExecutionContext, Inbox,
};
pub use config::{ConfigError, VerdantConfig};
pub use orchestrator::{
    MainThreadModel, Orchestrator, OrchestratorError, Strategy, Tier, TierAttempt, TierError,
    TieredClassification,
};
pub use pending::PendingTable;
#[cfg(not(target_arch = "wasm32"))]
pub use thread::{ThreadContext, ThreadContextFactory};
pub use timer::Timer;
#[cfg(not(target_arch = "wasm32"))]
pub use timer::TokioTimer;
#[cfg(target_arch = "wasm32")]
pub use timer::GlooTimer;
#[cfg(target_arch = "wasm32")]
pub use web::{WebWorkerContext, WebWorkerFactory};
