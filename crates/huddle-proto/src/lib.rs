//! Wire types shared by the signaling server and the mesh clients.
//! Kept in a dedicated crate so browser or other-language clients can be
//! generated from one definition without pulling in runtime code.
//!
//! Every message is a JSON object tagged by `type` (kebab-case message
//! name) with camelCase payload fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Kind of a media track.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// Mutable per-participant flags, owned by the participant's own client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParticipantFlag {
    Audio,
    Video,
    ScreenSharing,
}

impl From<MediaKind> for ParticipantFlag {
    fn from(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => ParticipantFlag::Audio,
            MediaKind::Video => ParticipantFlag::Video,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Opaque session description, shaped like the browser's `RTCSessionDescriptionInit`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Network-path candidate, shaped like the browser's `RTCIceCandidateInit`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: String,
    pub display_name: String,
    pub avatar_url: String,
    pub is_admin: bool,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
    pub joined_at: DateTime<Utc>,
}

impl Participant {
    /// New participants start with audio and video on and no screen share.
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        avatar_url: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            avatar_url: avatar_url.into(),
            is_admin: false,
            audio_enabled: true,
            video_enabled: true,
            screen_sharing: false,
            joined_at: Utc::now(),
        }
    }

    pub fn flag(&self, flag: ParticipantFlag) -> bool {
        match flag {
            ParticipantFlag::Audio => self.audio_enabled,
            ParticipantFlag::Video => self.video_enabled,
            ParticipantFlag::ScreenSharing => self.screen_sharing,
        }
    }

    pub fn set_flag(&mut self, flag: ParticipantFlag, value: bool) {
        match flag {
            ParticipantFlag::Audio => self.audio_enabled = value,
            ParticipantFlag::Video => self.video_enabled = value,
            ParticipantFlag::ScreenSharing => self.screen_sharing = value,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(
        sender_id: impl Into<String>,
        sender_name: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender_id: sender_id.into(),
            sender_name: sender_name.into(),
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Everything a client needs right after joining a room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub room_id: String,
    /// Id assigned to the receiving connection.
    pub participant_id: String,
    pub participant: Participant,
    pub participants: Vec<Participant>,
    pub messages: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
}

/// Messages sent from a client to the signaling server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    JoinRoom {
        room_id: String,
        display_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        avatar_url: Option<String>,
    },
    LeaveRoom {
        room_id: String,
    },
    ToggleMedia {
        kind: MediaKind,
        enabled: bool,
    },
    StartScreenShare,
    StopScreenShare,
    SendMessage {
        text: String,
    },
    HandshakeOffer {
        target_id: String,
        offer: SessionDescription,
    },
    HandshakeAnswer {
        target_id: String,
        answer: SessionDescription,
    },
    NetworkCandidate {
        target_id: String,
        candidate: IceCandidate,
    },
    /// Ask the target to (re)initiate a handshake toward the sender.
    RequestConnection {
        target_id: String,
    },
    Ping,
}

impl ClientMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::JoinRoom { .. } => "join-room",
            ClientMessage::LeaveRoom { .. } => "leave-room",
            ClientMessage::ToggleMedia { .. } => "toggle-media",
            ClientMessage::StartScreenShare => "start-screen-share",
            ClientMessage::StopScreenShare => "stop-screen-share",
            ClientMessage::SendMessage { .. } => "send-message",
            ClientMessage::HandshakeOffer { .. } => "handshake-offer",
            ClientMessage::HandshakeAnswer { .. } => "handshake-answer",
            ClientMessage::NetworkCandidate { .. } => "network-candidate",
            ClientMessage::RequestConnection { .. } => "request-connection",
            ClientMessage::Ping => "ping",
        }
    }
}

/// Messages sent from the signaling server to a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    JoinedRoom {
        room: RoomSnapshot,
    },
    UserJoined {
        participant: Participant,
    },
    UserLeft {
        participant_id: String,
    },
    LeftRoom {
        room_id: String,
    },
    ParticipantsUpdated {
        participants: Vec<Participant>,
    },
    MediaToggled {
        participant_id: String,
        kind: MediaKind,
        enabled: bool,
    },
    ScreenShareStarted {
        participant_id: String,
    },
    ScreenShareStopped {
        participant_id: String,
    },
    NewMessage {
        message: ChatMessage,
    },
    HandshakeOffer {
        sender_id: String,
        offer: SessionDescription,
    },
    HandshakeAnswer {
        sender_id: String,
        answer: SessionDescription,
    },
    NetworkCandidate {
        sender_id: String,
        candidate: IceCandidate,
    },
    ConnectionRequested {
        sender_id: String,
    },
    Pong,
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ServerMessage::JoinedRoom { .. } => "joined-room",
            ServerMessage::UserJoined { .. } => "user-joined",
            ServerMessage::UserLeft { .. } => "user-left",
            ServerMessage::LeftRoom { .. } => "left-room",
            ServerMessage::ParticipantsUpdated { .. } => "participants-updated",
            ServerMessage::MediaToggled { .. } => "media-toggled",
            ServerMessage::ScreenShareStarted { .. } => "screen-share-started",
            ServerMessage::ScreenShareStopped { .. } => "screen-share-stopped",
            ServerMessage::NewMessage { .. } => "new-message",
            ServerMessage::HandshakeOffer { .. } => "handshake-offer",
            ServerMessage::HandshakeAnswer { .. } => "handshake-answer",
            ServerMessage::NetworkCandidate { .. } => "network-candidate",
            ServerMessage::ConnectionRequested { .. } => "connection-requested",
            ServerMessage::Pong => "pong",
            ServerMessage::Error { .. } => "error",
        }
    }
}

/// `POST /api/create-room`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomResponse {
    pub room_id: String,
}

/// `GET /api/room/{roomId}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub room_id: String,
    pub participant_count: usize,
    pub created_at: DateTime<Utc>,
}

/// `GET /health`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub active_rooms: usize,
    pub total_participants: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
}
