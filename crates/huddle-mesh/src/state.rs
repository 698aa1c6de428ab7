use huddle_proto::MediaKind;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Handshake phase of one peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerPhase {
    New,
    Offering,
    Answering,
    Connected,
    Failed,
    Closed,
}

impl PeerPhase {
    pub fn can_advance_to(self, next: PeerPhase) -> bool {
        use PeerPhase::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) | (_, Failed) => true,
            (New, Offering) | (New, Answering) => true,
            // A non-initiator's offer loses to the initiator's.
            (Offering, Answering) => true,
            (Offering, Connected) | (Answering, Connected) => true,
            (Connected, Offering) | (Connected, Answering) => true,
            (Failed, Offering) | (Failed, Answering) | (Failed, Connected) => true,
            _ => false,
        }
    }
}

impl fmt::Display for PeerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeerPhase::New => "new",
            PeerPhase::Offering => "offering",
            PeerPhase::Answering => "answering",
            PeerPhase::Connected => "connected",
            PeerPhase::Failed => "failed",
            PeerPhase::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConnectionState {
    pub remote_id: String,
    pub phase: PeerPhase,
    pub generation: u64,
    /// Sender per kind and the track id it currently sends, if any.
    attached: BTreeMap<MediaKind, Option<String>>,
}

impl PeerConnectionState {
    pub fn new(remote_id: impl Into<String>, generation: u64) -> Self {
        Self {
            remote_id: remote_id.into(),
            phase: PeerPhase::New,
            generation,
            attached: BTreeMap::new(),
        }
    }

    /// Moves to `next` if the transition is allowed.
    pub fn advance(&mut self, next: PeerPhase) -> bool {
        if self.phase == next {
            return true;
        }
        if !self.phase.can_advance_to(next) {
            return false;
        }
        self.phase = next;
        true
    }

    pub fn local_tracks_attached(&self) -> BTreeSet<MediaKind> {
        self.attached
            .iter()
            .filter(|(_, track)| track.is_some())
            .map(|(kind, _)| *kind)
            .collect()
    }

    pub fn attached_track(&self, kind: MediaKind) -> Option<&str> {
        self.attached.get(&kind)?.as_deref()
    }

    /// Whether a sender of `kind` exists, even one with nothing on it.
    pub fn has_sender(&self, kind: MediaKind) -> bool {
        self.attached.contains_key(&kind)
    }

    pub fn attach(&mut self, kind: MediaKind, track_id: impl Into<String>) {
        self.attached.insert(kind, Some(track_id.into()));
    }

    /// Records that the `kind` sender no longer sends anything.
    pub fn detach(&mut self, kind: MediaKind) {
        if let Some(track) = self.attached.get_mut(&kind) {
            *track = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn handshake_paths_are_accepted() {
        let mut offerer = PeerConnectionState::new("b", 1);
        assert!(offerer.advance(PeerPhase::Offering));
        assert!(offerer.advance(PeerPhase::Connected));
        assert!(offerer.advance(PeerPhase::Failed));
        assert!(offerer.advance(PeerPhase::Offering));

        let mut answerer = PeerConnectionState::new("a", 1);
        assert!(answerer.advance(PeerPhase::Answering));
        assert!(answerer.advance(PeerPhase::Connected));
    }

    #[test_timeout::timeout]
    fn closed_is_terminal_and_new_cannot_skip_the_handshake() {
        let mut state = PeerConnectionState::new("b", 3);
        assert!(!state.advance(PeerPhase::Connected));
        assert_eq!(state.phase, PeerPhase::New);
        assert!(state.advance(PeerPhase::Closed));
        assert!(!state.advance(PeerPhase::Offering));
        assert!(!state.advance(PeerPhase::Failed));
        assert_eq!(state.phase, PeerPhase::Closed);
    }

    #[test_timeout::timeout]
    fn attached_kinds_track_latest_substitution() {
        let mut state = PeerConnectionState::new("b", 1);
        state.attach(MediaKind::Video, "camera");
        state.attach(MediaKind::Audio, "mic");
        state.attach(MediaKind::Video, "screen");
        assert_eq!(
            state.local_tracks_attached().into_iter().collect::<Vec<_>>(),
            [MediaKind::Audio, MediaKind::Video]
        );
        assert_eq!(state.attached_track(MediaKind::Video), Some("screen"));
    }

    #[test_timeout::timeout]
    fn detaching_keeps_the_sender() {
        let mut state = PeerConnectionState::new("b", 1);
        state.attach(MediaKind::Audio, "mic");
        state.attach(MediaKind::Video, "screen");
        state.detach(MediaKind::Video);
        state.detach(MediaKind::Audio);
        state.attach(MediaKind::Audio, "mic");

        assert!(state.has_sender(MediaKind::Video));
        assert_eq!(state.attached_track(MediaKind::Video), None);
        assert_eq!(
            state.local_tracks_attached().into_iter().collect::<Vec<_>>(),
            [MediaKind::Audio]
        );
    }
}
