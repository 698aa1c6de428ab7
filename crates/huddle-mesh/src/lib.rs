//! Huddle mesh: the client half of a meeting.
//!
//! Responsibilities:
//! - talking to the signaling server over a WebSocket
//! - keeping one peer connection per remote participant, full mesh
//! - local track lifecycle: mute, camera toggle, screen-share substitution
//! - recovering individual connections without touching the rest

pub mod config;
pub mod loopback;
pub mod manager;
pub mod media;
pub mod peer;
pub mod rtc;
pub mod signaling;
pub mod state;
pub mod track;

pub use config::MeshConfig;
pub use manager::{
    should_initiate, Command, ConnectionManager, ManagerEvent, ManagerHandle, ManagerInput,
    RemoteStream,
};
pub use media::{MediaDevices, MediaError, MediaRequest};
pub use peer::{PeerError, PeerEvent, PeerFactory, PeerLink};
pub use rtc::RtcPeerFactory;
pub use signaling::SignalingClient;
pub use state::{PeerConnectionState, PeerPhase};
pub use track::{LocalStream, LocalTrack, TrackSource};

#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("connection manager is not running")]
    ChannelClosed,
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("signaling: {0}")]
    Signaling(String),
}

pub type MeshResult<T> = Result<T, MeshError>;
