//! The seam between the connection manager and a WebRTC implementation.
//!
//! A [`PeerLink`] is one peer connection. Its callbacks never call back into
//! the manager directly; they are reported through a [`PeerEventSink`] into
//! the manager's input channel, tagged with the remote id and the
//! connection generation so events from a replaced connection can be told
//! apart.

use async_trait::async_trait;
use huddle_proto::{IceCandidate, MediaKind, SessionDescription};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

use crate::manager::ManagerInput;
use crate::track::LocalTrack;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrackInfo {
    pub id: String,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackChange {
    Added,
    Muted,
    Unmuted,
    Ended,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEventKind {
    LocalCandidate(IceCandidate),
    StateChanged(LinkState),
    RemoteTrack {
        stream_id: String,
        track: RemoteTrackInfo,
        change: TrackChange,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerEvent {
    pub remote_id: String,
    pub generation: u64,
    pub kind: PeerEventKind,
}

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("no {0} sender on this connection")]
    NoSender(MediaKind),
    #[error("peer connection is closed")]
    Closed,
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("webrtc: {0}")]
    Backend(String),
}

/// Where a link reports its callbacks.
#[derive(Clone)]
pub struct PeerEventSink {
    remote_id: String,
    generation: u64,
    tx: mpsc::UnboundedSender<ManagerInput>,
}

impl PeerEventSink {
    pub fn new(
        remote_id: impl Into<String>,
        generation: u64,
        tx: mpsc::UnboundedSender<ManagerInput>,
    ) -> Self {
        Self {
            remote_id: remote_id.into(),
            generation,
            tx,
        }
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, kind: PeerEventKind) {
        let event = PeerEvent {
            remote_id: self.remote_id.clone(),
            generation: self.generation,
            kind,
        };
        if self.tx.send(ManagerInput::Peer(event)).is_err() {
            trace!(remote_id = %self.remote_id, "peer event after manager shut down");
        }
    }
}

/// One peer connection.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Starts sending `track` on a new sender of the track's kind.
    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerError>;

    /// Swaps the track on the existing sender of `kind` without renegotiation.
    async fn replace_track(&self, kind: MediaKind, track: &LocalTrack) -> Result<(), PeerError>;

    /// Leaves the `kind` sender in place with nothing on it.
    async fn clear_track(&self, kind: MediaKind) -> Result<(), PeerError>;

    /// Creates an offer and applies it as the local description.
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerError>;

    /// Creates an answer to the applied remote offer and applies it locally.
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), PeerError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    async fn close(&self);
}

#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create_link(
        &self,
        remote_id: &str,
        sink: PeerEventSink,
    ) -> Result<Arc<dyn PeerLink>, PeerError>;
}
