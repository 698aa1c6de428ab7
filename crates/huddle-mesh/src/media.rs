use async_trait::async_trait;

use crate::track::{LocalStream, LocalTrack, TrackSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaRequest {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaRequest {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaError {
    #[error("permission to use the {0} was denied")]
    PermissionDenied(TrackSource),
    #[error("no {0} is available")]
    DeviceUnavailable(TrackSource),
    #[error("capture failed: {0}")]
    Capture(String),
}

/// Capture backend. Acquisition may wait on the user or the OS.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn user_media(&self, request: MediaRequest) -> Result<LocalStream, MediaError>;

    async fn display_media(&self) -> Result<LocalTrack, MediaError>;
}
