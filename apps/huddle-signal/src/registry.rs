use chrono::{DateTime, Utc};
use huddle_proto::{ChatMessage, Participant, ParticipantFlag, RoomInfo, RoomSnapshot};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::AdminSuccession;

/// A live room. Only exists while it has at least one participant.
#[derive(Debug, Clone)]
pub struct Room {
    pub id: String,
    /// Join order.
    pub participants: Vec<Participant>,
    pub messages: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
}

impl Room {
    fn info(&self) -> RoomInfo {
        RoomInfo {
            room_id: self.id.clone(),
            participant_count: self.participants.len(),
            created_at: self.created_at,
        }
    }
}

/// Result of removing a participant from a room.
#[derive(Debug, Clone)]
pub struct Departure {
    pub removed: Participant,
    pub remaining: Vec<Participant>,
    pub room_deleted: bool,
    /// Participant promoted to admin, if the policy promoted anyone.
    pub promoted: Option<String>,
}

/// In-memory rooms plus reserved-but-unjoined room ids.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<String, Room>,
    reservations: HashMap<String, DateTime<Utc>>,
    admin_succession: AdminSuccession,
}

impl RoomRegistry {
    pub fn new(admin_succession: AdminSuccession) -> Self {
        Self {
            admin_succession,
            ..Self::default()
        }
    }

    /// Returns the room's info, reserving the id when no room exists yet.
    pub fn create_or_get_room(&mut self, room_id: &str) -> RoomInfo {
        if let Some(room) = self.rooms.get(room_id) {
            return room.info();
        }
        let created_at = *self
            .reservations
            .entry(room_id.to_string())
            .or_insert_with(Utc::now);
        RoomInfo {
            room_id: room_id.to_string(),
            participant_count: 0,
            created_at,
        }
    }

    /// Reserves a fresh 8-character upper-case hex room id.
    pub fn reserve_room(&mut self) -> String {
        loop {
            let candidate = Uuid::new_v4().simple().to_string()[..8].to_ascii_uppercase();
            if self.rooms.contains_key(&candidate) || self.reservations.contains_key(&candidate) {
                continue;
            }
            self.reservations.insert(candidate.clone(), Utc::now());
            debug!(room_id = %candidate, "reserved room");
            return candidate;
        }
    }

    /// Adds `participant` to the room, creating the room on demand.
    ///
    /// The first participant of a new room becomes admin. Adding a
    /// participant that is already present returns the stored record.
    pub fn add_participant(&mut self, room_id: &str, mut participant: Participant) -> Participant {
        let reserved_at = self.reservations.remove(room_id);
        let room = self.rooms.entry(room_id.to_string()).or_insert_with(|| {
            info!(room_id, "room created");
            Room {
                id: room_id.to_string(),
                participants: Vec::new(),
                messages: Vec::new(),
                created_at: reserved_at.unwrap_or_else(Utc::now),
            }
        });

        if let Some(existing) = room.participants.iter().find(|p| p.id == participant.id) {
            return existing.clone();
        }

        participant.is_admin = room.participants.is_empty();
        room.participants.push(participant.clone());
        participant
    }

    /// Removes a participant; deletes the room when it becomes empty.
    pub fn remove_participant(&mut self, room_id: &str, participant_id: &str) -> Option<Departure> {
        let room = self.rooms.get_mut(room_id)?;
        let index = room.participants.iter().position(|p| p.id == participant_id)?;
        let removed = room.participants.remove(index);

        if room.participants.is_empty() {
            self.rooms.remove(room_id);
            info!(room_id, "room deleted");
            return Some(Departure {
                removed,
                remaining: Vec::new(),
                room_deleted: true,
                promoted: None,
            });
        }

        let mut promoted = None;
        if removed.is_admin
            && self.admin_succession == AdminSuccession::Oldest
            && !room.participants.iter().any(|p| p.is_admin)
        {
            if let Some(successor) = room.participants.first_mut() {
                successor.is_admin = true;
                promoted = Some(successor.id.clone());
            }
        }

        Some(Departure {
            removed,
            remaining: room.participants.clone(),
            room_deleted: false,
            promoted,
        })
    }

    pub fn append_message(&mut self, room_id: &str, message: ChatMessage) -> Option<ChatMessage> {
        let room = self.rooms.get_mut(room_id)?;
        room.messages.push(message.clone());
        Some(message)
    }

    /// Sets one flag on one participant and returns the updated list.
    pub fn set_participant_flag(
        &mut self,
        room_id: &str,
        participant_id: &str,
        flag: ParticipantFlag,
        value: bool,
    ) -> Option<Vec<Participant>> {
        let room = self.rooms.get_mut(room_id)?;
        let participant = room.participants.iter_mut().find(|p| p.id == participant_id)?;
        participant.set_flag(flag, value);
        Some(room.participants.clone())
    }

    pub fn participants(&self, room_id: &str) -> Vec<Participant> {
        self.rooms
            .get(room_id)
            .map(|room| room.participants.clone())
            .unwrap_or_default()
    }

    pub fn participant(&self, room_id: &str, participant_id: &str) -> Option<&Participant> {
        self.rooms
            .get(room_id)?
            .participants
            .iter()
            .find(|p| p.id == participant_id)
    }

    pub fn room(&self, room_id: &str) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    /// Info for a live room or a reservation.
    pub fn room_info(&self, room_id: &str) -> Option<RoomInfo> {
        if let Some(room) = self.rooms.get(room_id) {
            return Some(room.info());
        }
        self.reservations.get(room_id).map(|created_at| RoomInfo {
            room_id: room_id.to_string(),
            participant_count: 0,
            created_at: *created_at,
        })
    }

    pub fn snapshot(&self, room_id: &str, participant_id: &str) -> Option<RoomSnapshot> {
        let room = self.rooms.get(room_id)?;
        let participant = room.participants.iter().find(|p| p.id == participant_id)?;
        Some(RoomSnapshot {
            room_id: room.id.clone(),
            participant_id: participant_id.to_string(),
            participant: participant.clone(),
            participants: room.participants.clone(),
            messages: room.messages.clone(),
            created_at: room.created_at,
        })
    }

    pub fn active_rooms(&self) -> usize {
        self.rooms.len()
    }

    pub fn total_participants(&self) -> usize {
        self.rooms.values().map(|room| room.participants.len()).sum()
    }

    /// Drops reservations older than `ttl` and returns their ids.
    pub fn sweep_reservations(&mut self, ttl: Duration) -> Vec<String> {
        let now = Utc::now();
        let expired: Vec<String> = self
            .reservations
            .iter()
            .filter(|(_, reserved_at)| {
                (now - **reserved_at)
                    .to_std()
                    .map(|age| age >= ttl)
                    .unwrap_or(false)
            })
            .map(|(room_id, _)| room_id.clone())
            .collect();
        for room_id in &expired {
            self.reservations.remove(room_id);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guest(id: &str) -> Participant {
        Participant::new(id, format!("guest-{id}"), "https://avatars.test/x.svg")
    }

    fn ids(participants: &[Participant]) -> Vec<&str> {
        participants.iter().map(|p| p.id.as_str()).collect()
    }

    #[test_timeout::timeout]
    fn participants_follow_join_order_and_emptied_rooms_disappear() {
        let mut registry = RoomRegistry::default();
        registry.add_participant("R1", guest("a"));
        registry.add_participant("R1", guest("b"));
        registry.add_participant("R1", guest("c"));
        assert_eq!(ids(&registry.participants("R1")), ["a", "b", "c"]);

        let departure = registry.remove_participant("R1", "b").expect("b was present");
        assert_eq!(ids(&departure.remaining), ["a", "c"]);
        assert!(!departure.room_deleted);

        registry.add_participant("R1", guest("d"));
        assert_eq!(ids(&registry.participants("R1")), ["a", "c", "d"]);

        registry.remove_participant("R1", "a");
        registry.remove_participant("R1", "c");
        let last = registry.remove_participant("R1", "d").expect("d was present");
        assert!(last.room_deleted);
        assert!(registry.room("R1").is_none());
        assert!(registry.room_info("R1").is_none());
        assert!(registry.participants("R1").is_empty());
        assert_eq!(registry.active_rooms(), 0);
    }

    #[test_timeout::timeout]
    fn only_the_first_joiner_is_admin() {
        let mut registry = RoomRegistry::default();
        assert!(registry.add_participant("R1", guest("a")).is_admin);
        assert!(!registry.add_participant("R1", guest("b")).is_admin);
        assert!(registry.add_participant("R2", guest("c")).is_admin);
    }

    #[test_timeout::timeout]
    fn admin_is_not_replaced_by_default() {
        let mut registry = RoomRegistry::new(AdminSuccession::None);
        registry.add_participant("R1", guest("a"));
        registry.add_participant("R1", guest("b"));
        let departure = registry.remove_participant("R1", "a").expect("a was present");
        assert!(departure.promoted.is_none());
        assert!(registry.participants("R1").iter().all(|p| !p.is_admin));
    }

    #[test_timeout::timeout]
    fn oldest_remaining_participant_inherits_admin() {
        let mut registry = RoomRegistry::new(AdminSuccession::Oldest);
        registry.add_participant("R1", guest("a"));
        registry.add_participant("R1", guest("b"));
        registry.add_participant("R1", guest("c"));

        let departure = registry.remove_participant("R1", "a").expect("a was present");
        assert_eq!(departure.promoted.as_deref(), Some("b"));
        let admins: Vec<_> = departure.remaining.iter().filter(|p| p.is_admin).collect();
        assert_eq!(admins.len(), 1);
        assert_eq!(admins[0].id, "b");

        let departure = registry.remove_participant("R1", "c").expect("c was present");
        assert!(departure.promoted.is_none());
    }

    #[test_timeout::timeout]
    fn flags_change_only_the_named_participant() {
        let mut registry = RoomRegistry::default();
        registry.add_participant("R1", guest("a"));
        registry.add_participant("R1", guest("b"));

        registry.set_participant_flag("R1", "a", ParticipantFlag::Video, false);
        registry.set_participant_flag("R1", "b", ParticipantFlag::Audio, false);
        let list = registry
            .set_participant_flag("R1", "a", ParticipantFlag::Audio, true)
            .expect("a is in R1");

        let a = list.iter().find(|p| p.id == "a").expect("a listed");
        let b = list.iter().find(|p| p.id == "b").expect("b listed");
        assert!(a.audio_enabled && !a.video_enabled);
        assert!(!b.audio_enabled && b.video_enabled);

        assert!(registry
            .set_participant_flag("R1", "ghost", ParticipantFlag::Audio, false)
            .is_none());
        assert!(registry
            .set_participant_flag("nowhere", "a", ParticipantFlag::Audio, false)
            .is_none());
    }

    #[test_timeout::timeout]
    fn rejoining_returns_the_stored_participant() {
        let mut registry = RoomRegistry::default();
        registry.add_participant("R1", guest("a"));
        registry.set_participant_flag("R1", "a", ParticipantFlag::Video, false);
        let again = registry.add_participant("R1", guest("a"));
        assert!(!again.video_enabled);
        assert_eq!(registry.participants("R1").len(), 1);
    }

    #[test_timeout::timeout]
    fn messages_are_kept_in_order_and_reach_the_snapshot() {
        let mut registry = RoomRegistry::default();
        registry.add_participant("R1", guest("a"));
        registry.append_message("R1", ChatMessage::new("a", "guest-a", "hello"));
        registry.append_message("R1", ChatMessage::new("a", "guest-a", "again"));
        assert!(registry
            .append_message("R9", ChatMessage::new("a", "guest-a", "lost"))
            .is_none());

        let snapshot = registry.snapshot("R1", "a").expect("a is in R1");
        let texts: Vec<_> = snapshot.messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, ["hello", "again"]);
        assert_eq!(snapshot.participant.id, "a");
        assert!(snapshot.participant.is_admin);
    }

    #[test_timeout::timeout]
    fn reservations_are_visible_until_joined_or_swept() {
        let mut registry = RoomRegistry::default();
        let room_id = registry.reserve_room();
        assert_eq!(room_id.len(), 8);
        assert!(room_id
            .chars()
            .all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c)));

        let info = registry.room_info(&room_id).expect("reserved");
        assert_eq!(info.participant_count, 0);
        assert_eq!(registry.active_rooms(), 0);

        registry.add_participant(&room_id, guest("a"));
        let joined = registry.room_info(&room_id).expect("live room");
        assert_eq!(joined.participant_count, 1);
        assert_eq!(joined.created_at, info.created_at);

        let pending = registry.reserve_room();
        assert!(registry.sweep_reservations(Duration::from_secs(3600)).is_empty());
        assert_eq!(registry.sweep_reservations(Duration::ZERO), vec![pending.clone()]);
        assert!(registry.room_info(&pending).is_none());
        assert!(registry.room_info(&room_id).is_some());
    }

    #[test_timeout::timeout]
    fn create_or_get_room_does_not_materialise_an_empty_room() {
        let mut registry = RoomRegistry::default();
        let info = registry.create_or_get_room("R1");
        assert_eq!(info.participant_count, 0);
        assert!(registry.room("R1").is_none());
        assert_eq!(registry.active_rooms(), 0);

        registry.add_participant("R1", guest("a"));
        assert_eq!(registry.create_or_get_room("R1").participant_count, 1);
        assert_eq!(registry.total_participants(), 1);
    }
}
