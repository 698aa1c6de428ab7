use dashmap::DashMap;
use huddle_proto::{
    ChatMessage, ClientMessage, HealthStatus, MediaKind, Participant, ParticipantFlag, RoomInfo,
    ServerMessage,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::registry::RoomRegistry;

/// Rooms above this size still work, but the mesh gets expensive.
pub const MESH_SOFT_CEILING: usize = 6;

pub type Outbox = mpsc::UnboundedSender<ServerMessage>;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("sender {0} is not in a room")]
    NotInRoom(String),
    #[error("target {0} is not connected to the sender's room")]
    UnknownTarget(String),
    #[error("channel to {0} is closed")]
    ChannelClosed(String),
}

struct PeerHandle {
    tx: Outbox,
    room_id: Option<String>,
    last_seen: Instant,
}

/// Connection table plus room registry.
///
/// Lock order: the registry mutex is taken before any `peers` entry, and
/// every broadcast caused by a mutation is queued while the registry is
/// still locked, so all members observe mutations in the same order.
pub struct SignalingHub {
    registry: Mutex<RoomRegistry>,
    peers: DashMap<String, PeerHandle>,
    config: Arc<Config>,
}

impl SignalingHub {
    pub fn new(config: Config) -> Self {
        Self {
            registry: Mutex::new(RoomRegistry::new(config.admin_succession)),
            peers: DashMap::new(),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Registers a connection and returns its participant id.
    pub fn connect(&self, tx: Outbox) -> String {
        let id = Uuid::new_v4().to_string();
        self.peers.insert(
            id.clone(),
            PeerHandle {
                tx,
                room_id: None,
                last_seen: Instant::now(),
            },
        );
        debug!(participant_id = %id, "connection registered");
        id
    }

    /// Drops a connection, leaving its room as if it had sent `leave-room`
    /// without waiting for the acknowledgement.
    pub fn disconnect(&self, id: &str) {
        let mut registry = self.registry.lock();
        if let Some(room_id) = self.current_room(id) {
            self.leave_locked(&mut registry, id, &room_id, false);
        }
        if self.peers.remove(id).is_some() {
            debug!(participant_id = %id, "connection dropped");
        }
    }

    /// Refreshes liveness for a connection.
    pub fn touch(&self, id: &str) {
        if let Some(mut peer) = self.peers.get_mut(id) {
            peer.last_seen = Instant::now();
        }
    }

    pub fn is_connected(&self, id: &str) -> bool {
        self.peers.contains_key(id)
    }

    pub fn handle(&self, id: &str, message: ClientMessage) {
        if !self.peers.contains_key(id) {
            debug!(participant_id = %id, message = message.name(), "message from unknown connection");
            return;
        }

        match message {
            ClientMessage::JoinRoom {
                room_id,
                display_name,
                avatar_url,
            } => self.join(id, &room_id, display_name, avatar_url),
            ClientMessage::LeaveRoom { room_id } => {
                let mut registry = self.registry.lock();
                match self.current_room(id) {
                    Some(current) if current == room_id => {
                        self.leave_locked(&mut registry, id, &current, true);
                    }
                    other => {
                        debug!(participant_id = %id, requested = %room_id, current = ?other, "leave for a room the connection is not in");
                    }
                }
            }
            ClientMessage::ToggleMedia { kind, enabled } => self.toggle_media(id, kind, enabled),
            ClientMessage::StartScreenShare => self.set_screen_share(id, true),
            ClientMessage::StopScreenShare => self.set_screen_share(id, false),
            ClientMessage::SendMessage { text } => self.send_chat(id, &text),
            ClientMessage::HandshakeOffer { target_id, offer } => self.relay_logged(
                id,
                &target_id,
                ServerMessage::HandshakeOffer {
                    sender_id: id.to_string(),
                    offer,
                },
            ),
            ClientMessage::HandshakeAnswer { target_id, answer } => self.relay_logged(
                id,
                &target_id,
                ServerMessage::HandshakeAnswer {
                    sender_id: id.to_string(),
                    answer,
                },
            ),
            ClientMessage::NetworkCandidate {
                target_id,
                candidate,
            } => self.relay_logged(
                id,
                &target_id,
                ServerMessage::NetworkCandidate {
                    sender_id: id.to_string(),
                    candidate,
                },
            ),
            ClientMessage::RequestConnection { target_id } => self.relay_logged(
                id,
                &target_id,
                ServerMessage::ConnectionRequested {
                    sender_id: id.to_string(),
                },
            ),
            ClientMessage::Ping => {
                self.touch(id);
                self.send_to(id, ServerMessage::Pong);
            }
        }
    }

    fn join(&self, id: &str, room_id: &str, display_name: String, avatar_url: Option<String>) {
        let mut registry = self.registry.lock();

        match self.current_room(id) {
            Some(current) if current == room_id => {
                if let Some(room) = registry.snapshot(room_id, id) {
                    self.send_to(id, ServerMessage::JoinedRoom { room });
                }
                return;
            }
            Some(previous) => self.leave_locked(&mut registry, id, &previous, false),
            None => {}
        }

        let display_name = display_name.trim().to_string();
        let avatar_url = avatar_url
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| self.config.avatar_url_for(&display_name));
        let participant =
            registry.add_participant(room_id, Participant::new(id, display_name, avatar_url));
        if let Some(mut peer) = self.peers.get_mut(id) {
            peer.room_id = Some(room_id.to_string());
        }

        let participants = registry.participants(room_id);
        info!(
            room_id,
            participant_id = %id,
            admin = participant.is_admin,
            size = participants.len(),
            "participant joined"
        );
        if participants.len() > MESH_SOFT_CEILING {
            warn!(
                room_id,
                size = participants.len(),
                ceiling = MESH_SOFT_CEILING,
                "room exceeds the mesh soft ceiling"
            );
        }

        if let Some(room) = registry.snapshot(room_id, id) {
            self.send_to(id, ServerMessage::JoinedRoom { room });
        }
        self.broadcast(
            &participants,
            Some(id),
            &ServerMessage::UserJoined { participant },
        );
        self.broadcast(
            &participants,
            None,
            &ServerMessage::ParticipantsUpdated {
                participants: participants.clone(),
            },
        );
    }

    fn leave_locked(&self, registry: &mut RoomRegistry, id: &str, room_id: &str, acknowledge: bool) {
        if let Some(mut peer) = self.peers.get_mut(id) {
            peer.room_id = None;
        }

        let Some(departure) = registry.remove_participant(room_id, id) else {
            debug!(room_id, participant_id = %id, "leave for unknown participant");
            return;
        };
        info!(
            room_id,
            participant_id = %id,
            remaining = departure.remaining.len(),
            room_deleted = departure.room_deleted,
            "participant left"
        );
        if let Some(promoted) = &departure.promoted {
            info!(room_id, participant_id = %promoted, "admin handed over");
        }

        self.broadcast(
            &departure.remaining,
            None,
            &ServerMessage::UserLeft {
                participant_id: id.to_string(),
            },
        );
        if !departure.remaining.is_empty() {
            self.broadcast(
                &departure.remaining,
                None,
                &ServerMessage::ParticipantsUpdated {
                    participants: departure.remaining.clone(),
                },
            );
        }
        if acknowledge {
            self.send_to(
                id,
                ServerMessage::LeftRoom {
                    room_id: room_id.to_string(),
                },
            );
        }
    }

    fn toggle_media(&self, id: &str, kind: MediaKind, enabled: bool) {
        let mut registry = self.registry.lock();
        let Some(room_id) = self.current_room(id) else {
            debug!(participant_id = %id, "toggle-media outside a room");
            return;
        };
        let Some(participants) =
            registry.set_participant_flag(&room_id, id, ParticipantFlag::from(kind), enabled)
        else {
            return;
        };
        debug!(room_id = %room_id, participant_id = %id, %kind, enabled, "media toggled");

        self.broadcast(
            &participants,
            None,
            &ServerMessage::ParticipantsUpdated {
                participants: participants.clone(),
            },
        );
        self.broadcast(
            &participants,
            None,
            &ServerMessage::MediaToggled {
                participant_id: id.to_string(),
                kind,
                enabled,
            },
        );
    }

    fn set_screen_share(&self, id: &str, sharing: bool) {
        let mut registry = self.registry.lock();
        let Some(room_id) = self.current_room(id) else {
            debug!(participant_id = %id, "screen share outside a room");
            return;
        };
        let Some(participants) =
            registry.set_participant_flag(&room_id, id, ParticipantFlag::ScreenSharing, sharing)
        else {
            return;
        };

        self.broadcast(
            &participants,
            None,
            &ServerMessage::ParticipantsUpdated {
                participants: participants.clone(),
            },
        );
        let event = if sharing {
            ServerMessage::ScreenShareStarted {
                participant_id: id.to_string(),
            }
        } else {
            ServerMessage::ScreenShareStopped {
                participant_id: id.to_string(),
            }
        };
        self.broadcast(&participants, Some(id), &event);
    }

    fn send_chat(&self, id: &str, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }

        let mut registry = self.registry.lock();
        let Some(room_id) = self.current_room(id) else {
            debug!(participant_id = %id, "chat outside a room");
            return;
        };
        let Some(sender_name) = registry
            .participant(&room_id, id)
            .map(|p| p.display_name.clone())
        else {
            return;
        };
        let Some(message) = registry.append_message(&room_id, ChatMessage::new(id, sender_name, text))
        else {
            return;
        };

        let participants = registry.participants(&room_id);
        self.broadcast(&participants, None, &ServerMessage::NewMessage { message });
    }

    /// Delivers a handshake payload to `target_id` when both sides share a room.
    pub fn relay(&self, sender_id: &str, target_id: &str, message: ServerMessage) -> Result<(), RelayError> {
        let _registry = self.registry.lock();
        let room_id = self
            .current_room(sender_id)
            .ok_or_else(|| RelayError::NotInRoom(sender_id.to_string()))?;
        let target = self
            .peers
            .get(target_id)
            .filter(|peer| peer.room_id.as_deref() == Some(room_id.as_str()))
            .ok_or_else(|| RelayError::UnknownTarget(target_id.to_string()))?;
        target
            .tx
            .send(message)
            .map_err(|_| RelayError::ChannelClosed(target_id.to_string()))
    }

    fn relay_logged(&self, sender_id: &str, target_id: &str, message: ServerMessage) {
        let name = message.name();
        if let Err(err) = self.relay(sender_id, target_id, message) {
            debug!(sender_id, target_id, message = name, error = %err, "relay dropped");
        }
    }

    /// Evicts connections silent for longer than `timeout`.
    pub fn sweep_stale(&self, timeout: Duration) -> Vec<String> {
        let stale: Vec<String> = self
            .peers
            .iter()
            .filter(|entry| entry.last_seen.elapsed() > timeout)
            .map(|entry| entry.key().clone())
            .collect();
        for id in &stale {
            info!(participant_id = %id, "evicting connection after heartbeat timeout");
            self.disconnect(id);
        }
        stale
    }

    /// Periodically evicts silent connections and expires reservations.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(hub.config.maintenance_interval());
            loop {
                interval.tick().await;
                hub.sweep_stale(hub.config.heartbeat_timeout());
                let expired = hub
                    .registry
                    .lock()
                    .sweep_reservations(hub.config.reservation_ttl());
                if !expired.is_empty() {
                    debug!(count = expired.len(), "expired room reservations");
                }
            }
        })
    }

    pub fn create_room(&self) -> String {
        self.registry.lock().reserve_room()
    }

    pub fn room_info(&self, room_id: &str) -> Option<RoomInfo> {
        self.registry.lock().room_info(room_id)
    }

    pub fn participants(&self, room_id: &str) -> Vec<Participant> {
        self.registry.lock().participants(room_id)
    }

    pub fn health(&self) -> HealthStatus {
        let registry = self.registry.lock();
        HealthStatus {
            status: "ok".to_string(),
            timestamp: chrono::Utc::now(),
            active_rooms: registry.active_rooms(),
            total_participants: registry.total_participants(),
        }
    }

    /// Reports a protocol error to one connection only.
    pub fn reject(&self, id: &str, message: impl Into<String>) {
        self.send_to(
            id,
            ServerMessage::Error {
                message: message.into(),
            },
        );
    }

    fn current_room(&self, id: &str) -> Option<String> {
        self.peers.get(id).and_then(|peer| peer.room_id.clone())
    }

    fn send_to(&self, id: &str, message: ServerMessage) {
        if let Some(peer) = self.peers.get(id) {
            let _ = peer.tx.send(message);
        }
    }

    fn broadcast(&self, participants: &[Participant], except: Option<&str>, message: &ServerMessage) {
        for participant in participants {
            if Some(participant.id.as_str()) == except {
                continue;
            }
            self.send_to(&participant.id, message.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdminSuccession;
    use huddle_proto::{IceCandidate, SessionDescription};

    struct Client {
        id: String,
        rx: mpsc::UnboundedReceiver<ServerMessage>,
    }

    impl Client {
        fn connect(hub: &SignalingHub) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            let id = hub.connect(tx);
            Self { id, rx }
        }

        fn drain(&mut self) -> Vec<ServerMessage> {
            let mut out = Vec::new();
            while let Ok(msg) = self.rx.try_recv() {
                out.push(msg);
            }
            out
        }

        fn names(&mut self) -> Vec<&'static str> {
            self.drain().iter().map(ServerMessage::name).collect()
        }
    }

    fn join(hub: &SignalingHub, client: &Client, room_id: &str, name: &str) {
        hub.handle(
            &client.id,
            ClientMessage::JoinRoom {
                room_id: room_id.into(),
                display_name: name.into(),
                avatar_url: None,
            },
        );
    }

    #[test_timeout::timeout]
    fn join_sends_snapshot_then_membership_events() {
        let hub = SignalingHub::new(Config::default());
        let mut a = Client::connect(&hub);
        let mut b = Client::connect(&hub);

        join(&hub, &a, "R1", "Ada");
        let first = a.drain();
        match &first[0] {
            ServerMessage::JoinedRoom { room } => {
                assert_eq!(room.participant_id, a.id);
                assert!(room.participant.is_admin);
                assert!(room.participant.avatar_url.contains("Ada"));
            }
            other => panic!("expected joined-room, got {other:?}"),
        }

        join(&hub, &b, "R1", "Bob");
        assert_eq!(a.names(), ["user-joined", "participants-updated"]);
        let to_b = b.drain();
        assert_eq!(to_b[0].name(), "joined-room");
        match &to_b[1] {
            ServerMessage::ParticipantsUpdated { participants } => {
                let ids: Vec<_> = participants.iter().map(|p| p.id.clone()).collect();
                assert_eq!(ids, [a.id.clone(), b.id.clone()]);
                assert!(!participants[1].is_admin);
            }
            other => panic!("expected participants-updated, got {other:?}"),
        }
    }

    #[test_timeout::timeout]
    fn relays_reach_only_the_target_and_carry_the_sender() {
        let hub = SignalingHub::new(Config::default());
        let mut a = Client::connect(&hub);
        let mut b = Client::connect(&hub);
        let mut c = Client::connect(&hub);
        join(&hub, &a, "R1", "Ada");
        join(&hub, &b, "R1", "Bob");
        join(&hub, &c, "R1", "Cy");
        a.drain();
        b.drain();
        c.drain();

        hub.handle(
            &a.id,
            ClientMessage::HandshakeOffer {
                target_id: b.id.clone(),
                offer: SessionDescription::offer("v=0"),
            },
        );
        hub.handle(
            &b.id,
            ClientMessage::NetworkCandidate {
                target_id: a.id.clone(),
                candidate: IceCandidate {
                    candidate: "candidate:1".into(),
                    sdp_mid: Some("0".into()),
                    sdp_mline_index: Some(0),
                    username_fragment: None,
                },
            },
        );

        assert_eq!(
            b.drain(),
            [ServerMessage::HandshakeOffer {
                sender_id: a.id.clone(),
                offer: SessionDescription::offer("v=0"),
            }]
        );
        match a.drain().as_slice() {
            [ServerMessage::NetworkCandidate { sender_id, .. }] => assert_eq!(sender_id, &b.id),
            other => panic!("unexpected {other:?}"),
        }
        assert!(c.drain().is_empty());
    }

    #[test_timeout::timeout]
    fn relays_to_departed_or_foreign_targets_are_dropped() {
        let hub = SignalingHub::new(Config::default());
        let a = Client::connect(&hub);
        let b = Client::connect(&hub);
        let mut outsider = Client::connect(&hub);
        join(&hub, &a, "R1", "Ada");
        join(&hub, &b, "R1", "Bob");
        join(&hub, &outsider, "R2", "Oz");
        outsider.drain();

        let err = hub
            .relay(&a.id, &outsider.id, ServerMessage::ConnectionRequested { sender_id: a.id.clone() })
            .expect_err("different rooms");
        assert!(matches!(err, RelayError::UnknownTarget(_)));

        hub.disconnect(&b.id);
        let err = hub
            .relay(&a.id, &b.id, ServerMessage::ConnectionRequested { sender_id: a.id.clone() })
            .expect_err("departed");
        assert!(matches!(err, RelayError::UnknownTarget(_)));

        hub.handle(&a.id, ClientMessage::RequestConnection { target_id: b.id.clone() });
        assert!(outsider.drain().is_empty());
    }

    #[test_timeout::timeout]
    fn leaving_notifies_the_rest_and_deletes_empty_rooms() {
        let hub = SignalingHub::new(Config::default());
        let mut a = Client::connect(&hub);
        let mut b = Client::connect(&hub);
        join(&hub, &a, "R1", "Ada");
        join(&hub, &b, "R1", "Bob");
        a.drain();
        b.drain();

        hub.handle(&b.id, ClientMessage::LeaveRoom { room_id: "R1".into() });
        assert_eq!(b.names(), ["left-room"]);
        let to_a = a.drain();
        assert_eq!(
            to_a[0],
            ServerMessage::UserLeft {
                participant_id: b.id.clone()
            }
        );
        assert_eq!(to_a[1].name(), "participants-updated");

        hub.disconnect(&a.id);
        assert!(hub.room_info("R1").is_none());
        assert_eq!(hub.health().active_rooms, 0);
    }

    #[test_timeout::timeout]
    fn leave_for_another_room_is_ignored() {
        let hub = SignalingHub::new(Config::default());
        let mut a = Client::connect(&hub);
        join(&hub, &a, "R1", "Ada");
        a.drain();
        hub.handle(&a.id, ClientMessage::LeaveRoom { room_id: "R2".into() });
        assert!(a.drain().is_empty());
        assert_eq!(hub.participants("R1").len(), 1);
    }

    #[test_timeout::timeout]
    fn toggles_are_broadcast_to_everyone() {
        let hub = SignalingHub::new(Config::default());
        let mut a = Client::connect(&hub);
        let mut b = Client::connect(&hub);
        join(&hub, &a, "R1", "Ada");
        join(&hub, &b, "R1", "Bob");
        a.drain();
        b.drain();

        hub.handle(
            &a.id,
            ClientMessage::ToggleMedia {
                kind: MediaKind::Video,
                enabled: false,
            },
        );
        assert_eq!(a.names(), ["participants-updated", "media-toggled"]);
        assert_eq!(b.names(), ["participants-updated", "media-toggled"]);

        let list = hub.participants("R1");
        assert!(!list[0].video_enabled);
        assert!(list[1].video_enabled);

        hub.handle(&b.id, ClientMessage::StartScreenShare);
        assert_eq!(a.names(), ["participants-updated", "screen-share-started"]);
        assert_eq!(b.names(), ["participants-updated"]);
        assert!(hub.participants("R1")[1].screen_sharing);
    }

    #[test_timeout::timeout]
    fn chat_is_trimmed_and_empty_text_dropped() {
        let hub = SignalingHub::new(Config::default());
        let mut a = Client::connect(&hub);
        join(&hub, &a, "R1", "Ada");
        a.drain();

        hub.handle(&a.id, ClientMessage::SendMessage { text: "   ".into() });
        assert!(a.drain().is_empty());

        hub.handle(&a.id, ClientMessage::SendMessage { text: "  hi  ".into() });
        match a.drain().as_slice() {
            [ServerMessage::NewMessage { message }] => {
                assert_eq!(message.text, "hi");
                assert_eq!(message.sender_name, "Ada");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test_timeout::timeout]
    fn joining_another_room_leaves_the_first() {
        let hub = SignalingHub::new(Config::default());
        let mut a = Client::connect(&hub);
        let mut b = Client::connect(&hub);
        join(&hub, &a, "R1", "Ada");
        join(&hub, &b, "R1", "Bob");
        a.drain();
        b.drain();

        join(&hub, &b, "R2", "Bob");
        assert_eq!(a.names(), ["user-left", "participants-updated"]);
        let to_b = b.names();
        assert_eq!(to_b.first(), Some(&"joined-room"));
        assert!(!to_b.contains(&"left-room"));
        assert_eq!(hub.participants("R1").len(), 1);

        join(&hub, &b, "R2", "Bob");
        assert_eq!(b.names(), ["joined-room"]);
        assert_eq!(hub.participants("R2").len(), 1);
    }

    #[test_timeout::timeout]
    fn admin_succession_follows_config() {
        let hub = SignalingHub::new(Config {
            admin_succession: AdminSuccession::Oldest,
            ..Config::default()
        });
        let a = Client::connect(&hub);
        let b = Client::connect(&hub);
        join(&hub, &a, "R1", "Ada");
        join(&hub, &b, "R1", "Bob");
        hub.disconnect(&a.id);
        assert!(hub.participants("R1")[0].is_admin);
    }

    #[test_timeout::timeout]
    fn silent_connections_are_evicted() {
        let hub = SignalingHub::new(Config::default());
        let a = Client::connect(&hub);
        let mut b = Client::connect(&hub);
        join(&hub, &a, "R1", "Ada");
        join(&hub, &b, "R1", "Bob");
        b.drain();

        std::thread::sleep(Duration::from_millis(20));
        hub.touch(&b.id);
        let evicted = hub.sweep_stale(Duration::from_millis(10));
        assert_eq!(evicted, [a.id.clone()]);
        assert!(!hub.is_connected(&a.id));
        assert_eq!(b.names(), ["user-left", "participants-updated"]);
    }

    #[test_timeout::timeout]
    fn ping_is_answered_with_pong() {
        let hub = SignalingHub::new(Config::default());
        let mut a = Client::connect(&hub);
        hub.handle(&a.id, ClientMessage::Ping);
        assert_eq!(a.drain(), [ServerMessage::Pong]);
    }
}
