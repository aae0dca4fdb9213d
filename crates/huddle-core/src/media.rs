//! Local audio capture capability.
//!
//! Device capture and playback live outside this crate. Sessions only need
//! a track handle they can attach to a link sender and later stop.

use crate::error::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A stoppable, replaceable audio track
pub trait AudioTrack: Send + Sync + fmt::Debug {
    /// Stable track id
    fn id(&self) -> &str;

    /// Stop capturing; a stopped track stays attached but sends silence
    fn stop(&self);

    /// Whether [`AudioTrack::stop`] has been called
    fn is_stopped(&self) -> bool;
}

/// Source of local audio tracks (microphone)
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Open the capture device and return a live track
    async fn acquire(&self) -> Result<Arc<dyn AudioTrack>>;
}

/// Track with no device behind it
#[derive(Debug)]
pub struct SilentTrack {
    id: String,
    stopped: AtomicBool,
}

impl SilentTrack {
    /// Create a new track with the given id
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            stopped: AtomicBool::new(false),
        }
    }
}

impl AudioTrack for SilentTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// [`MediaSource`] handing out [`SilentTrack`]s, for headless members
#[derive(Debug, Default)]
pub struct SilentSource;

#[async_trait]
impl MediaSource for SilentSource {
    async fn acquire(&self) -> Result<Arc<dyn AudioTrack>> {
        let id = format!("mic-{}", uuid::Uuid::new_v4());
        Ok(Arc::new(SilentTrack::new(id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_silent_source_hands_out_fresh_tracks() {
        let source = SilentSource;
        let a = source.acquire().await.unwrap();
        let b = source.acquire().await.unwrap();
        assert_ne!(a.id(), b.id());

        a.stop();
        assert!(a.is_stopped());
        assert!(!b.is_stopped());
    }
}
