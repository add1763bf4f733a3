//! Timers for request and initialization deadlines.
//!
//! The channel never sleeps directly; it asks a [`Timer`] so native code
//! can use tokio's clock (which tests can pause and advance) and browser
//! code can use `setTimeout`.

use std::future::Future;
use std::time::Duration;

/// A source of sleep futures.
pub trait Timer {
    /// Future that completes once the duration has elapsed.
    type Sleep: Future<Output = ()>;

    /// Sleep for `duration`.
    fn sleep(&self, duration: Duration) -> Self::Sleep;
}

/// Tokio's timer. Must be polled inside a tokio runtime with time enabled.
#[cfg(not(target_arch = "wasm32"))]
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTimer;

#[cfg(not(target_arch = "wasm32"))]
impl Timer for TokioTimer {
    type Sleep = tokio::time::Sleep;

    fn sleep(&self, duration: Duration) -> Self::Sleep {
        tokio::time::sleep(duration)
    }
}

/// Browser `setTimeout` via gloo.
#[cfg(target_arch = "wasm32")]
#[derive(Debug, Clone, Copy, Default)]
pub struct GlooTimer;

#[cfg(target_arch = "wasm32")]
impl Timer for GlooTimer {
    type Sleep = gloo_timers::future::TimeoutFuture;

    fn sleep(&self, duration: Duration) -> Self::Sleep {
        let millis = u32::try_from(duration.as_millis()).unwrap_or(u32::MAX);
        gloo_timers::future::TimeoutFuture::new(millis)
    }
}
