//! Camera capture with guaranteed track release.
//!
//! A [`CameraSession`] owns the live tracks of a camera stream. They are
//! stopped exactly once, whichever way the session ends: a frame is
//! captured, the user cancels or switches away, or the owner is torn down.

use tracing::debug;

/// A live media track that can be stopped.
pub trait MediaTrack {
    /// Stop the track and release the device.
    fn stop(&self);
}

#[cfg(target_arch = "wasm32")]
impl MediaTrack for web_sys::MediaStreamTrack {
    fn stop(&self) {
        Self::stop(self);
    }
}

/// Scoped ownership of camera tracks.
#[derive(Debug)]
pub struct CameraSession<T: MediaTrack> {
    tracks: Vec<T>,
    live: bool,
}

impl<T: MediaTrack> CameraSession<T> {
    /// Take ownership of `tracks`.
    #[must_use]
    pub const fn new(tracks: Vec<T>) -> Self {
        Self { tracks, live: true }
    }

    /// Whether the tracks are still running.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        self.live
    }

    /// Grab a frame with `grab` and stop the tracks, even if `grab`
    /// reports an error.
    pub fn capture<R>(mut self, grab: impl FnOnce(&[T]) -> R) -> R {
        let frame = grab(&self.tracks);
        self.release();
        frame
    }

    /// Stop the tracks. Later calls do nothing.
    pub fn release(&mut self) {
        if !self.live {
            return;
        }
        self.live = false;
        for track in &self.tracks {
            track.stop();
        }
        debug!(tracks = self.tracks.len(), "camera released");
    }
}

impl<T: MediaTrack> Drop for CameraSession<T> {
    fn drop(&mut self) {
        self.release();
    }
}
