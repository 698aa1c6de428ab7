//! Per-client mesh of peer connections.
//!
//! The manager owns one [`PeerConnectionState`] and one [`PeerLink`] per
//! remote participant in the room. Everything that can change that state
//! (server messages, link callbacks, commands from the presentation layer,
//! capture tracks ending) arrives as a [`ManagerInput`] on a single channel
//! and is handled one input at a time.
//!
//! For every pair of participants the one with the smaller id initiates the
//! handshake (see [`should_initiate`]). The other side only answers, and
//! asks the initiator to offer again with `request-connection` when it needs
//! a new handshake.

use huddle_proto::{
    ChatMessage, ClientMessage, IceCandidate, MediaKind, Participant, ServerMessage,
    SessionDescription, SdpKind,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::media::{MediaDevices, MediaError, MediaRequest};
use crate::peer::{
    LinkState, PeerError, PeerEvent, PeerEventKind, PeerEventSink, PeerFactory, PeerLink,
    RemoteTrackInfo, TrackChange,
};
use crate::state::{PeerConnectionState, PeerPhase};
use crate::track::{LocalStream, LocalTrack};
use crate::MeshError;

/// True when `local_id` is the designated initiator toward `remote_id`.
pub fn should_initiate(local_id: &str, remote_id: &str) -> bool {
    local_id < remote_id
}

/// Requests from the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Join {
        room_id: String,
        display_name: String,
        avatar_url: Option<String>,
    },
    Leave,
    AcquireMedia(MediaRequest),
    ToggleAudio(bool),
    ToggleVideo(bool),
    StartScreenShare,
    StopScreenShare,
    SendChat(String),
    RestartIce(String),
    Shutdown,
}

#[derive(Debug)]
pub enum ManagerInput {
    Server(ServerMessage),
    Peer(PeerEvent),
    Command(Command),
    ScreenShareEnded { track_id: String },
    SignalingClosed,
}

#[derive(Debug, Clone)]
pub enum ManagerEvent {
    Joined {
        room_id: String,
        participant_id: String,
        participants: Vec<Participant>,
        messages: Vec<ChatMessage>,
    },
    Left {
        room_id: String,
    },
    ParticipantsUpdated(Vec<Participant>),
    ParticipantJoined(Participant),
    ParticipantLeft(String),
    LocalMedia(LocalStream),
    RemoteStream {
        remote_id: String,
        stream: RemoteStream,
    },
    ConnectionStateChanged {
        remote_id: String,
        phase: PeerPhase,
    },
    MediaToggled {
        participant_id: String,
        kind: MediaKind,
        enabled: bool,
    },
    ScreenShareChanged {
        participant_id: String,
        sharing: bool,
    },
    ChatMessage(ChatMessage),
    TrackSubstitutionFailed {
        remote_id: String,
        kind: MediaKind,
        reason: String,
    },
    MediaError(MediaError),
    ServerError(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrackState {
    pub info: RemoteTrackInfo,
    pub muted: bool,
    pub ended: bool,
}

#[derive(Debug)]
struct RemoteStreamInner {
    id: String,
    remote_id: String,
    tracks: Vec<RemoteTrackState>,
}

/// Media arriving from one remote participant.
///
/// This is a live handle: tracks that arrive after the stream was first
/// reported show up in [`RemoteStream::tracks`] without a new event.
#[derive(Debug, Clone)]
pub struct RemoteStream {
    inner: Arc<Mutex<RemoteStreamInner>>,
}

impl RemoteStream {
    fn new(id: &str, remote_id: &str) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RemoteStreamInner {
                id: id.to_string(),
                remote_id: remote_id.to_string(),
                tracks: Vec::new(),
            })),
        }
    }

    pub fn id(&self) -> String {
        self.inner.lock().id.clone()
    }

    pub fn remote_id(&self) -> String {
        self.inner.lock().remote_id.clone()
    }

    pub fn tracks(&self) -> Vec<RemoteTrackState> {
        self.inner.lock().tracks.clone()
    }

    /// A track of `kind` that has not ended and is not muted.
    pub fn has_live(&self, kind: MediaKind) -> bool {
        self.inner
            .lock()
            .tracks
            .iter()
            .any(|t| t.info.kind == kind && !t.ended && !t.muted)
    }

    pub fn same_stream(&self, other: &RemoteStream) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn apply(&self, track: RemoteTrackInfo, change: TrackChange) {
        let mut inner = self.inner.lock();
        let position = inner.tracks.iter().position(|t| t.info.id == track.id);
        match (position, change) {
            (None, TrackChange::Added) => inner.tracks.push(RemoteTrackState {
                info: track,
                muted: false,
                ended: false,
            }),
            (None, _) => {}
            (Some(index), change) => {
                let state = &mut inner.tracks[index];
                match change {
                    TrackChange::Added => {
                        state.ended = false;
                        state.muted = false;
                    }
                    TrackChange::Muted => state.muted = true,
                    TrackChange::Unmuted => state.muted = false,
                    TrackChange::Ended => state.ended = true,
                }
            }
        }
    }
}

struct PeerEntry {
    state: PeerConnectionState,
    link: Arc<dyn PeerLink>,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    /// Tracks were added after the handshake started; offer again once connected.
    renegotiate: bool,
}

/// Cloneable way to feed a running manager.
#[derive(Clone)]
pub struct ManagerHandle {
    inputs: mpsc::UnboundedSender<ManagerInput>,
}

impl ManagerHandle {
    pub fn command(&self, command: Command) -> Result<(), MeshError> {
        self.inputs
            .send(ManagerInput::Command(command))
            .map_err(|_| MeshError::ChannelClosed)
    }

    pub fn input_sender(&self) -> mpsc::UnboundedSender<ManagerInput> {
        self.inputs.clone()
    }
}

pub struct ConnectionManager {
    factory: Arc<dyn PeerFactory>,
    media: Arc<dyn MediaDevices>,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    events: mpsc::UnboundedSender<ManagerEvent>,
    inputs_tx: mpsc::UnboundedSender<ManagerInput>,
    inputs_rx: Option<mpsc::UnboundedReceiver<ManagerInput>>,

    local_id: Option<String>,
    room_id: Option<String>,
    /// Join sent, `joined-room` not seen yet.
    joining: Option<String>,
    /// Rooms left before their `joined-room` arrived.
    abandoned: Vec<String>,
    participants: Vec<Participant>,
    peers: HashMap<String, PeerEntry>,
    next_generation: u64,
    remote_streams: HashMap<(String, String), RemoteStream>,

    local_stream: Option<LocalStream>,
    screen: Option<LocalTrack>,
    audio_enabled: bool,
    video_enabled: bool,
}

impl ConnectionManager {
    /// `outbound` carries messages for the signaling server.
    pub fn new(
        factory: Arc<dyn PeerFactory>,
        media: Arc<dyn MediaDevices>,
        outbound: mpsc::UnboundedSender<ClientMessage>,
    ) -> (Self, mpsc::UnboundedReceiver<ManagerEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let manager = Self {
            factory,
            media,
            outbound,
            events,
            inputs_tx,
            inputs_rx: Some(inputs_rx),
            local_id: None,
            room_id: None,
            joining: None,
            abandoned: Vec::new(),
            participants: Vec::new(),
            peers: HashMap::new(),
            next_generation: 1,
            remote_streams: HashMap::new(),
            local_stream: None,
            screen: None,
            audio_enabled: true,
            video_enabled: true,
        };
        (manager, events_rx)
    }

    pub fn handle(&self) -> ManagerHandle {
        ManagerHandle {
            inputs: self.inputs_tx.clone(),
        }
    }

    pub fn local_id(&self) -> Option<&str> {
        self.local_id.as_deref()
    }

    pub fn room_id(&self) -> Option<&str> {
        self.room_id.as_deref()
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn peer_state(&self, remote_id: &str) -> Option<&PeerConnectionState> {
        self.peers.get(remote_id).map(|entry| &entry.state)
    }

    pub fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn local_stream(&self) -> Option<&LocalStream> {
        self.local_stream.as_ref()
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.screen.is_some()
    }

    /// Processes inputs until `Command::Shutdown`. The manager keeps a sender
    /// for its own links, so the channel never closes on its own.
    pub async fn run(mut self) {
        let Some(mut inputs) = self.inputs_rx.take() else {
            warn!("connection manager started twice");
            return;
        };
        while let Some(input) = inputs.recv().await {
            if !self.dispatch(input).await {
                break;
            }
        }
        self.teardown().await;
        if let Some(stream) = self.local_stream.take() {
            stream.stop();
        }
        debug!("connection manager stopped");
    }

    /// Waits for one input and handles it. Returns false after shutdown.
    pub async fn step(&mut self) -> bool {
        let input = match self.inputs_rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        };
        match input {
            Some(input) => self.dispatch(input).await,
            None => false,
        }
    }

    /// Handles every input already queued, without waiting for more.
    pub async fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Some(input) = self.inputs_rx.as_mut().and_then(|rx| rx.try_recv().ok()) {
            self.dispatch(input).await;
            handled += 1;
        }
        handled
    }

    pub async fn dispatch(&mut self, input: ManagerInput) -> bool {
        match input {
            ManagerInput::Server(message) => self.on_server_message(message).await,
            ManagerInput::Peer(event) => self.on_peer_event(event).await,
            ManagerInput::Command(Command::Shutdown) => return false,
            ManagerInput::Command(command) => self.on_command(command).await,
            ManagerInput::ScreenShareEnded { track_id } => {
                if self.screen.as_ref().map(LocalTrack::id) == Some(track_id.as_str()) {
                    info!("screen capture ended by the source");
                    self.stop_screen_share().await;
                }
            }
            ManagerInput::SignalingClosed => {
                warn!("signaling connection closed");
                self.teardown().await;
                self.participants.clear();
                self.local_id = None;
                self.joining = None;
                self.abandoned.clear();
                if let Some(room_id) = self.room_id.take() {
                    self.emit(ManagerEvent::Left { room_id });
                }
                self.emit(ManagerEvent::ServerError(
                    "signaling connection closed".to_string(),
                ));
            }
        }
        true
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Join {
                room_id,
                display_name,
                avatar_url,
            } => self.join(room_id, display_name, avatar_url).await,
            Command::Leave => self.leave().await,
            Command::AcquireMedia(request) => {
                let _ = self.acquire_local_media(request).await;
            }
            Command::ToggleAudio(enabled) => self.toggle_audio(enabled).await,
            Command::ToggleVideo(enabled) => self.toggle_video(enabled).await,
            Command::StartScreenShare => {
                let _ = self.start_screen_share().await;
            }
            Command::StopScreenShare => self.stop_screen_share().await,
            Command::SendChat(text) => self.send_chat(&text),
            Command::RestartIce(remote_id) => self.restart_ice(&remote_id).await,
            Command::Shutdown => {}
        }
    }

    // Room membership

    pub async fn join(&mut self, room_id: String, display_name: String, avatar_url: Option<String>) {
        if self.room_id.as_deref().is_some_and(|current| current != room_id) {
            self.teardown().await;
        }
        self.joining = Some(room_id.clone());
        self.send(ClientMessage::JoinRoom {
            room_id,
            display_name,
            avatar_url,
        });
    }

    /// Leaves the room and closes every peer connection right away.
    pub async fn leave(&mut self) {
        let joined = self.room_id.take();
        let joining = self
            .joining
            .take()
            .filter(|room_id| joined.as_ref() != Some(room_id));
        if let Some(room_id) = &joining {
            // The server seats us anyway; its confirmation is dropped.
            self.abandoned.push(room_id.clone());
        }
        let Some(room_id) = joining.or(joined) else {
            return;
        };
        self.send(ClientMessage::LeaveRoom {
            room_id: room_id.clone(),
        });
        self.teardown().await;
        self.participants.clear();
        self.emit(ManagerEvent::Left { room_id });
    }

    async fn on_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::JoinedRoom { room } => {
                if let Some(index) = self.abandoned.iter().position(|id| *id == room.room_id) {
                    self.abandoned.remove(index);
                    debug!(room_id = %room.room_id, "ignoring join of a room already left");
                    return;
                }
                if self.joining.as_deref() == Some(room.room_id.as_str()) {
                    self.joining = None;
                }
                info!(room_id = %room.room_id, participant_id = %room.participant_id, "joined room");
                self.local_id = Some(room.participant_id.clone());
                self.room_id = Some(room.room_id.clone());
                self.participants = room.participants.clone();
                self.emit(ManagerEvent::Joined {
                    room_id: room.room_id,
                    participant_id: room.participant_id,
                    participants: room.participants,
                    messages: room.messages,
                });
                self.reconcile().await;
            }
            ServerMessage::UserJoined { participant } => {
                if Some(participant.id.as_str()) == self.local_id.as_deref() {
                    return;
                }
                if !self.participants.iter().any(|p| p.id == participant.id) {
                    self.participants.push(participant.clone());
                }
                let remote_id = participant.id.clone();
                self.emit(ManagerEvent::ParticipantJoined(participant));
                self.maybe_initiate(&remote_id).await;
            }
            ServerMessage::UserLeft { participant_id } => {
                self.participants.retain(|p| p.id != participant_id);
                self.close_peer(&participant_id).await;
                self.emit(ManagerEvent::ParticipantLeft(participant_id));
            }
            ServerMessage::LeftRoom { room_id } => {
                debug!(room_id = %room_id, "leave acknowledged");
            }
            ServerMessage::ParticipantsUpdated { participants } => {
                self.participants = participants.clone();
                self.emit(ManagerEvent::ParticipantsUpdated(participants));
                self.reconcile().await;
            }
            ServerMessage::MediaToggled {
                participant_id,
                kind,
                enabled,
            } => self.emit(ManagerEvent::MediaToggled {
                participant_id,
                kind,
                enabled,
            }),
            ServerMessage::ScreenShareStarted { participant_id } => {
                self.emit(ManagerEvent::ScreenShareChanged {
                    participant_id,
                    sharing: true,
                })
            }
            ServerMessage::ScreenShareStopped { participant_id } => {
                self.emit(ManagerEvent::ScreenShareChanged {
                    participant_id,
                    sharing: false,
                })
            }
            ServerMessage::NewMessage { message } => self.emit(ManagerEvent::ChatMessage(message)),
            ServerMessage::HandshakeOffer { sender_id, offer } => self.on_offer(&sender_id, offer).await,
            ServerMessage::HandshakeAnswer { sender_id, answer } => {
                self.on_answer(&sender_id, answer).await
            }
            ServerMessage::NetworkCandidate {
                sender_id,
                candidate,
            } => self.on_candidate(&sender_id, candidate).await,
            ServerMessage::ConnectionRequested { sender_id } => {
                self.on_connection_requested(&sender_id).await
            }
            ServerMessage::Pong => trace!("pong"),
            ServerMessage::Error { message } => {
                warn!(error = %message, "signaling server reported an error");
                self.emit(ManagerEvent::ServerError(message));
            }
        }
    }

    /// Brings the peer set in line with the authoritative participant list.
    async fn reconcile(&mut self) {
        let present: Vec<String> = self.participants.iter().map(|p| p.id.clone()).collect();
        let departed: Vec<String> = self
            .peers
            .keys()
            .filter(|id| !present.contains(id))
            .cloned()
            .collect();
        for remote_id in departed {
            self.close_peer(&remote_id).await;
        }
        for remote_id in present {
            if Some(remote_id.as_str()) != self.local_id.as_deref() {
                self.maybe_initiate(&remote_id).await;
            }
        }
    }

    async fn maybe_initiate(&mut self, remote_id: &str) {
        let Some(local_id) = self.local_id.as_deref() else {
            return;
        };
        if should_initiate(local_id, remote_id) && !self.peers.contains_key(remote_id) {
            self.create_connection(remote_id).await;
        }
    }

    // Handshake

    /// Opens a connection to `remote_id` and sends an offer. A second call
    /// for the same remote is a no-op.
    pub async fn create_connection(&mut self, remote_id: &str) {
        if self.peers.contains_key(remote_id) {
            return;
        }
        if let Err(err) = self.open_link(remote_id).await {
            warn!(remote_id, error = %err, "failed to open peer connection");
            return;
        }
        self.send_offer(remote_id, false).await;
    }

    async fn open_link(&mut self, remote_id: &str) -> Result<(), PeerError> {
        let generation = self.next_generation;
        self.next_generation += 1;
        let sink = PeerEventSink::new(remote_id, generation, self.inputs_tx.clone());
        let link = self.factory.create_link(remote_id, sink).await?;

        let mut state = PeerConnectionState::new(remote_id, generation);
        for kind in [MediaKind::Audio, MediaKind::Video] {
            if let Some(track) = self.outgoing_track(kind) {
                link.add_track(&track).await?;
                state.attach(kind, track.id());
            }
        }
        debug!(remote_id, generation, "peer connection opened");

        self.peers.insert(
            remote_id.to_string(),
            PeerEntry {
                state,
                link,
                remote_description_set: false,
                pending_candidates: Vec::new(),
                renegotiate: false,
            },
        );
        self.emit_phase(remote_id);
        Ok(())
    }

    async fn send_offer(&mut self, remote_id: &str, ice_restart: bool) {
        let Some(entry) = self.peers.get_mut(remote_id) else {
            return;
        };
        if !entry.state.advance(PeerPhase::Offering) {
            debug!(remote_id, phase = %entry.state.phase, "cannot offer from this phase");
            return;
        }
        entry.renegotiate = false;
        let link = Arc::clone(&entry.link);
        self.emit_phase(remote_id);

        match link.create_offer(ice_restart).await {
            Ok(offer) => {
                debug!(remote_id, ice_restart, "sending offer");
                self.send(ClientMessage::HandshakeOffer {
                    target_id: remote_id.to_string(),
                    offer,
                });
            }
            Err(err) => {
                warn!(remote_id, error = %err, "failed to create offer");
                self.mark_failed(remote_id);
            }
        }
    }

    async fn on_offer(&mut self, sender_id: &str, offer: SessionDescription) {
        if offer.kind != SdpKind::Offer {
            debug!(sender_id, "offer message without an offer");
            return;
        }
        let local_id = self.local_id.clone().unwrap_or_default();

        if let Some(entry) = self.peers.get(sender_id) {
            if entry.state.phase == PeerPhase::Offering && should_initiate(&local_id, sender_id) {
                debug!(sender_id, "ignoring offer that collides with ours");
                return;
            }
        } else if let Err(err) = self.open_link(sender_id).await {
            warn!(sender_id, error = %err, "failed to open peer connection for offer");
            return;
        }

        let Some(entry) = self.peers.get_mut(sender_id) else {
            return;
        };
        entry.state.advance(PeerPhase::Answering);
        let link = Arc::clone(&entry.link);
        self.emit_phase(sender_id);

        if let Err(err) = link.set_remote_description(offer).await {
            warn!(sender_id, error = %err, "failed to apply remote offer");
            self.mark_failed(sender_id);
            return;
        }
        self.flush_candidates(sender_id).await;

        match link.create_answer().await {
            Ok(answer) => {
                self.send(ClientMessage::HandshakeAnswer {
                    target_id: sender_id.to_string(),
                    answer,
                });
                self.mark_connected(sender_id).await;
            }
            Err(err) => {
                warn!(sender_id, error = %err, "failed to create answer");
                self.mark_failed(sender_id);
            }
        }
    }

    async fn on_answer(&mut self, sender_id: &str, answer: SessionDescription) {
        let Some(entry) = self.peers.get(sender_id) else {
            debug!(sender_id, "answer for unknown connection");
            return;
        };
        if entry.state.phase != PeerPhase::Offering {
            debug!(sender_id, phase = %entry.state.phase, "answer while not offering");
            return;
        }
        let link = Arc::clone(&entry.link);

        if let Err(err) = link.set_remote_description(answer).await {
            warn!(sender_id, error = %err, "failed to apply remote answer");
            self.mark_failed(sender_id);
            return;
        }
        self.flush_candidates(sender_id).await;
        self.mark_connected(sender_id).await;
    }

    async fn on_candidate(&mut self, sender_id: &str, candidate: IceCandidate) {
        let Some(entry) = self.peers.get_mut(sender_id) else {
            debug!(sender_id, "candidate for unknown connection");
            return;
        };
        if !entry.remote_description_set {
            entry.pending_candidates.push(candidate);
            return;
        }
        let link = Arc::clone(&entry.link);
        if let Err(err) = link.add_ice_candidate(candidate).await {
            debug!(sender_id, error = %err, "candidate rejected");
        }
    }

    async fn flush_candidates(&mut self, remote_id: &str) {
        let Some(entry) = self.peers.get_mut(remote_id) else {
            return;
        };
        entry.remote_description_set = true;
        let pending = std::mem::take(&mut entry.pending_candidates);
        let link = Arc::clone(&entry.link);
        for candidate in pending {
            if let Err(err) = link.add_ice_candidate(candidate).await {
                debug!(remote_id, error = %err, "queued candidate rejected");
            }
        }
    }

    async fn on_connection_requested(&mut self, sender_id: &str) {
        let local_id = self.local_id.clone().unwrap_or_default();
        let Some(entry) = self.peers.get(sender_id) else {
            // Older clients ask before offering, whatever the id order.
            self.create_connection(sender_id).await;
            return;
        };
        if !should_initiate(&local_id, sender_id) {
            debug!(sender_id, "connection request from the initiating side");
            return;
        }
        match entry.state.phase {
            // The asking side may have seen ICE fail while this side did not.
            PeerPhase::Connected | PeerPhase::Failed => self.send_offer(sender_id, true).await,
            phase => {
                debug!(sender_id, %phase, "handshake already in progress");
                if let Some(entry) = self.peers.get_mut(sender_id) {
                    entry.renegotiate = true;
                }
            }
        }
    }

    /// Recovers one failed connection. The initiator offers with an ICE
    /// restart; the other side asks the initiator to do so.
    pub async fn restart_ice(&mut self, remote_id: &str) {
        if !self.peers.contains_key(remote_id) {
            debug!(remote_id, "ice restart for unknown connection");
            return;
        }
        let local_id = self.local_id.clone().unwrap_or_default();
        if should_initiate(&local_id, remote_id) {
            info!(remote_id, "restarting ice");
            self.send_offer(remote_id, true).await;
        } else {
            info!(remote_id, "asking initiator to restart ice");
            self.send(ClientMessage::RequestConnection {
                target_id: remote_id.to_string(),
            });
        }
    }

    async fn mark_connected(&mut self, remote_id: &str) {
        let Some(entry) = self.peers.get_mut(remote_id) else {
            return;
        };
        if !entry.state.advance(PeerPhase::Connected) {
            return;
        }
        let renegotiate = entry.renegotiate;
        self.emit_phase(remote_id);
        if renegotiate {
            self.renegotiate(remote_id).await;
        }
    }

    fn mark_failed(&mut self, remote_id: &str) {
        if let Some(entry) = self.peers.get_mut(remote_id) {
            if entry.state.advance(PeerPhase::Failed) {
                self.emit_phase(remote_id);
            }
        }
    }

    /// Starts a new offer/answer round after local tracks were added.
    async fn renegotiate(&mut self, remote_id: &str) {
        let local_id = self.local_id.clone().unwrap_or_default();
        if should_initiate(&local_id, remote_id) {
            self.send_offer(remote_id, false).await;
        } else {
            if let Some(entry) = self.peers.get_mut(remote_id) {
                entry.renegotiate = false;
            }
            self.send(ClientMessage::RequestConnection {
                target_id: remote_id.to_string(),
            });
        }
    }

    async fn close_peer(&mut self, remote_id: &str) {
        let Some(mut entry) = self.peers.remove(remote_id) else {
            return;
        };
        entry.state.advance(PeerPhase::Closed);
        entry.link.close().await;
        self.remote_streams.retain(|(owner, _), _| owner != remote_id);
        debug!(remote_id, generation = entry.state.generation, "peer connection closed");
        self.emit(ManagerEvent::ConnectionStateChanged {
            remote_id: remote_id.to_string(),
            phase: PeerPhase::Closed,
        });
    }

    async fn teardown(&mut self) {
        for remote_id in self.peer_ids() {
            self.close_peer(&remote_id).await;
        }
        self.remote_streams.clear();
    }

    // Link callbacks

    async fn on_peer_event(&mut self, event: PeerEvent) {
        let PeerEvent {
            remote_id,
            generation,
            kind,
        } = event;
        match self.peers.get(&remote_id) {
            Some(entry) if entry.state.generation == generation => {}
            _ => {
                trace!(remote_id = %remote_id, generation, "event from a stale connection");
                return;
            }
        }

        match kind {
            PeerEventKind::LocalCandidate(candidate) => {
                self.send(ClientMessage::NetworkCandidate {
                    target_id: remote_id,
                    candidate,
                });
            }
            PeerEventKind::StateChanged(LinkState::Failed) => {
                warn!(remote_id = %remote_id, "peer connection failed");
                self.mark_failed(&remote_id);
                self.restart_ice(&remote_id).await;
            }
            PeerEventKind::StateChanged(LinkState::Connected) => {
                let recovered = self
                    .peers
                    .get(&remote_id)
                    .is_some_and(|entry| entry.state.phase == PeerPhase::Failed);
                if recovered {
                    self.mark_connected(&remote_id).await;
                }
            }
            PeerEventKind::StateChanged(state) => {
                debug!(remote_id = %remote_id, ?state, "link state changed");
            }
            PeerEventKind::RemoteTrack {
                stream_id,
                track,
                change,
            } => self.on_remote_track(remote_id, stream_id, track, change),
        }
    }

    fn on_remote_track(
        &mut self,
        remote_id: String,
        stream_id: String,
        track: RemoteTrackInfo,
        change: TrackChange,
    ) {
        let key = (remote_id.clone(), stream_id.clone());
        let (stream, is_new) = match self.remote_streams.get(&key) {
            Some(stream) => (stream.clone(), false),
            None if change == TrackChange::Added => {
                let stream = RemoteStream::new(&stream_id, &remote_id);
                self.remote_streams.insert(key, stream.clone());
                (stream, true)
            }
            None => return,
        };
        stream.apply(track, change);
        if is_new || change != TrackChange::Added {
            self.emit(ManagerEvent::RemoteStream { remote_id, stream });
        }
    }

    // Local media

    /// Captures camera and microphone and starts sending them to every peer.
    pub async fn acquire_local_media(&mut self, request: MediaRequest) -> Result<(), MediaError> {
        let stream = match self.media.user_media(request).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "failed to acquire local media");
                self.emit(ManagerEvent::MediaError(err.clone()));
                return Err(err);
            }
        };
        if let Some(track) = stream.audio_track() {
            track.set_enabled(self.audio_enabled);
        }
        if let Some(track) = stream.video_track() {
            track.set_enabled(self.video_enabled);
        }
        if let Some(previous) = self.local_stream.replace(stream.clone()) {
            previous.stop();
        }
        self.emit(ManagerEvent::LocalMedia(stream));

        for kind in [MediaKind::Audio, MediaKind::Video] {
            if let Some(track) = self.outgoing_track(kind) {
                self.attach_everywhere(&track).await;
            }
        }
        Ok(())
    }

    /// Sends `track` on every connection, replacing in place where a sender
    /// exists and adding a sender (plus renegotiation) where none does.
    async fn attach_everywhere(&mut self, track: &LocalTrack) {
        let kind = track.kind();
        for remote_id in self.peer_ids() {
            let has_sender = self
                .peers
                .get(&remote_id)
                .is_some_and(|entry| entry.state.has_sender(kind));
            if has_sender {
                self.substitute_track(&remote_id, track).await;
                continue;
            }

            let Some(entry) = self.peers.get_mut(&remote_id) else {
                continue;
            };
            let link = Arc::clone(&entry.link);
            match link.add_track(track).await {
                Ok(()) => {
                    let Some(entry) = self.peers.get_mut(&remote_id) else {
                        continue;
                    };
                    entry.state.attach(kind, track.id());
                    if entry.state.phase == PeerPhase::Connected {
                        self.renegotiate(&remote_id).await;
                    } else {
                        entry.renegotiate = true;
                    }
                }
                Err(err) => {
                    warn!(remote_id = %remote_id, %kind, error = %err, "failed to add track");
                }
            }
        }
    }

    /// Puts `track` on the `kind` sender of one connection. Returns whether
    /// anything changed; substituting the track already sent is a no-op.
    pub async fn substitute_track(&mut self, remote_id: &str, track: &LocalTrack) -> bool {
        let kind = track.kind();
        let Some(entry) = self.peers.get(remote_id) else {
            return false;
        };
        if entry.state.attached_track(kind) == Some(track.id()) {
            return false;
        }
        let link = Arc::clone(&entry.link);
        match link.replace_track(kind, track).await {
            Ok(()) => {
                if let Some(entry) = self.peers.get_mut(remote_id) {
                    entry.state.attach(kind, track.id());
                }
                true
            }
            Err(err) => {
                warn!(remote_id, %kind, error = %err, "track substitution failed");
                self.emit(ManagerEvent::TrackSubstitutionFailed {
                    remote_id: remote_id.to_string(),
                    kind,
                    reason: err.to_string(),
                });
                false
            }
        }
    }

    async fn substitute_everywhere(&mut self, track: &LocalTrack) {
        for remote_id in self.peer_ids() {
            self.substitute_track(&remote_id, track).await;
        }
    }

    /// Stops sending anything of `kind` while keeping the senders for later.
    async fn clear_everywhere(&mut self, kind: MediaKind) {
        for remote_id in self.peer_ids() {
            let Some(entry) = self.peers.get(&remote_id) else {
                continue;
            };
            if entry.state.attached_track(kind).is_none() {
                continue;
            }
            let link = Arc::clone(&entry.link);
            match link.clear_track(kind).await {
                Ok(()) => {
                    if let Some(entry) = self.peers.get_mut(&remote_id) {
                        entry.state.detach(kind);
                    }
                }
                Err(err) => {
                    warn!(remote_id = %remote_id, %kind, error = %err, "failed to clear sender");
                    self.emit(ManagerEvent::TrackSubstitutionFailed {
                        remote_id,
                        kind,
                        reason: err.to_string(),
                    });
                }
            }
        }
    }

    fn outgoing_track(&self, kind: MediaKind) -> Option<LocalTrack> {
        match kind {
            MediaKind::Audio => self.local_stream.as_ref()?.audio_track().cloned(),
            MediaKind::Video => self
                .screen
                .clone()
                .or_else(|| self.local_stream.as_ref()?.video_track().cloned()),
        }
    }

    pub async fn toggle_audio(&mut self, enabled: bool) {
        self.audio_enabled = enabled;
        if let Some(track) = self.outgoing_track(MediaKind::Audio) {
            track.set_enabled(enabled);
            self.substitute_everywhere(&track).await;
        }
        self.send(ClientMessage::ToggleMedia {
            kind: MediaKind::Audio,
            enabled,
        });
    }

    pub async fn toggle_video(&mut self, enabled: bool) {
        self.video_enabled = enabled;
        let camera = self
            .local_stream
            .as_ref()
            .and_then(|stream| stream.video_track().cloned());
        if let Some(camera) = camera {
            camera.set_enabled(enabled);
            if self.screen.is_none() {
                self.substitute_everywhere(&camera).await;
            }
        }
        self.send(ClientMessage::ToggleMedia {
            kind: MediaKind::Video,
            enabled,
        });
    }

    /// Sends a display capture in place of the camera on every connection.
    /// The camera track is kept for [`Self::stop_screen_share`].
    pub async fn start_screen_share(&mut self) -> Result<(), MediaError> {
        if self.screen.is_some() {
            return Ok(());
        }
        let screen = match self.media.display_media().await {
            Ok(track) => track,
            Err(err) => {
                warn!(error = %err, "failed to start screen share");
                self.emit(ManagerEvent::MediaError(err.clone()));
                return Err(err);
            }
        };
        info!(track_id = %screen.id(), "screen share started");
        self.screen = Some(screen.clone());
        self.attach_everywhere(&screen).await;

        let watcher = screen.clone();
        let inputs = self.inputs_tx.clone();
        tokio::spawn(async move {
            watcher.ended().await;
            let _ = inputs.send(ManagerInput::ScreenShareEnded {
                track_id: watcher.id().to_string(),
            });
        });

        self.send(ClientMessage::StartScreenShare);
        if let Some(local_id) = self.local_id.clone() {
            self.emit(ManagerEvent::ScreenShareChanged {
                participant_id: local_id,
                sharing: true,
            });
        }
        Ok(())
    }

    /// Puts the camera back on every connection, capturing it again if the
    /// retained track has ended. Without a camera the video senders go quiet.
    pub async fn stop_screen_share(&mut self) {
        let Some(screen) = self.screen.take() else {
            return;
        };
        screen.stop();
        info!("screen share stopped");

        let camera_ended = self
            .local_stream
            .as_ref()
            .and_then(LocalStream::video_track)
            .is_some_and(LocalTrack::is_ended);
        if camera_ended {
            self.reacquire_camera().await;
        }

        match self.outgoing_track(MediaKind::Video) {
            Some(camera) => self.substitute_everywhere(&camera).await,
            None => self.clear_everywhere(MediaKind::Video).await,
        }

        self.send(ClientMessage::StopScreenShare);
        if let Some(local_id) = self.local_id.clone() {
            self.emit(ManagerEvent::ScreenShareChanged {
                participant_id: local_id,
                sharing: false,
            });
        }
    }

    async fn reacquire_camera(&mut self) {
        let request = MediaRequest {
            audio: false,
            video: true,
        };
        match self.media.user_media(request).await {
            Ok(fresh) => {
                let Some(camera) = fresh.video_track().cloned() else {
                    return;
                };
                camera.set_enabled(self.video_enabled);
                if let Some(stream) = self.local_stream.as_mut() {
                    stream.replace_video(camera);
                    let stream = stream.clone();
                    self.emit(ManagerEvent::LocalMedia(stream));
                }
                debug!("camera reacquired after screen share");
            }
            Err(err) => {
                warn!(error = %err, "failed to reacquire camera");
                self.emit(ManagerEvent::MediaError(err));
            }
        }
    }

    pub fn send_chat(&self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        self.send(ClientMessage::SendMessage {
            text: text.to_string(),
        });
    }

    fn send(&self, message: ClientMessage) {
        let name = message.name();
        if self.outbound.send(message).is_err() {
            warn!(message = name, "signaling channel closed; message dropped");
        }
    }

    fn emit(&self, event: ManagerEvent) {
        if self.events.send(event).is_err() {
            trace!("no listener for manager events");
        }
    }

    fn emit_phase(&self, remote_id: &str) {
        if let Some(entry) = self.peers.get(remote_id) {
            self.emit(ManagerEvent::ConnectionStateChanged {
                remote_id: remote_id.to_string(),
                phase: entry.state.phase,
            });
        }
    }
}
