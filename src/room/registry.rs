//! Room registry: the single owner of presence state.
//!
//! Rooms live in a `DashMap`; every mutation holds the room's entry for its
//! whole duration, including the [`PresenceSink`] callback, so two connections
//! touching the same room can never interleave and each room's events reach
//! the sink in the order they were applied.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::{Room, RoomSummary};
use crate::auth::Identity;
use crate::clock::Clock;
use crate::sync::presence::{
    Cursor, IdlePolicy, Participant, PresenceSink, PresenceStatus, StatusCause,
};
use crate::sync::{ConnectionId, RoomId};

/// Map of room id to live roster
pub struct RoomRegistry {
    rooms: DashMap<RoomId, Room>,
    sink: Arc<dyn PresenceSink>,
    clock: Arc<dyn Clock>,
}

impl RoomRegistry {
    pub fn new(sink: Arc<dyn PresenceSink>, clock: Arc<dyn Clock>) -> Self {
        Self {
            rooms: DashMap::new(),
            sink,
            clock,
        }
    }

    /// Add a participant, creating the room if needed. Returns the roster.
    ///
    /// A user already on the roster is replaced in place, never duplicated.
    pub fn join(&self, room_id: &str, identity: &Identity, connection: ConnectionId) -> Vec<Participant> {
        let now = self.clock.now();
        let mut room = self
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Room::new(room_id, now));

        let participant = Participant::new(identity, connection, now);
        match room.position(&identity.user_id) {
            Some(idx) => room.participants[idx] = participant.clone(),
            None => room.participants.push(participant.clone()),
        }

        self.sink.on_join(&room, &participant);
        room.snapshot()
    }

    /// Remove a participant regardless of which connection owns the entry.
    /// Returns false when there was nothing to remove.
    pub fn leave(&self, room_id: &str, user_id: &str) -> bool {
        self.remove(room_id, user_id, None)
    }

    /// Remove a participant only if `connection` still owns the roster entry
    pub fn leave_connection(&self, room_id: &str, user_id: &str, connection: ConnectionId) -> bool {
        self.remove(room_id, user_id, Some(connection))
    }

    fn remove(&self, room_id: &str, user_id: &str, owner: Option<ConnectionId>) -> bool {
        let now_empty = {
            let Some(mut room) = self.rooms.get_mut(room_id) else {
                return false;
            };
            let Some(idx) = room.position(user_id) else {
                return false;
            };
            if owner.is_some_and(|c| room.participants[idx].connection != c) {
                debug!(
                    "Skipping leave of {} from {}: entry owned by another connection",
                    user_id, room_id
                );
                return false;
            }

            room.participants.remove(idx);
            self.sink.on_leave(&room, user_id);
            room.is_empty()
        };

        // A join may have landed between releasing the entry and this check
        if now_empty && self.rooms.remove_if(room_id, |_, room| room.is_empty()).is_some() {
            info!("Room {} closed", room_id);
        }

        true
    }

    /// Move a participant's cursor. Counts as activity.
    pub fn update_cursor(&self, room_id: &str, user_id: &str, cursor: Cursor) -> bool {
        let now = self.clock.now();
        let Some(mut room) = self.rooms.get_mut(room_id) else {
            debug!("Cursor update for missing room {}", room_id);
            return false;
        };
        let Some(participant) = room.participant_mut(user_id) else {
            debug!("Cursor update for {} who is not in {}", user_id, room_id);
            return false;
        };

        participant.cursor = Some(cursor);
        let promoted = participant.touch(now);
        let participant = participant.clone();

        if promoted {
            self.sink.on_status(&room, &participant, StatusCause::Activity);
        }
        self.sink.on_cursor(&room, &participant);
        true
    }

    /// Set a participant's status explicitly
    pub fn update_status(&self, room_id: &str, user_id: &str, status: PresenceStatus) -> bool {
        let now = self.clock.now();
        let Some(mut room) = self.rooms.get_mut(room_id) else {
            debug!("Status update for missing room {}", room_id);
            return false;
        };
        let Some(participant) = room.participant_mut(user_id) else {
            debug!("Status update for {} who is not in {}", user_id, room_id);
            return false;
        };

        participant.status = status;
        participant.last_active = now;
        let participant = participant.clone();

        self.sink.on_status(&room, &participant, StatusCause::Client);
        true
    }

    /// Record activity for a participant, then run `then` while the room is
    /// still held. Returns false (and skips `then`) if the user is not present
    /// or their roster entry is owned by another connection.
    pub fn record_activity<F>(&self, room_id: &str, user_id: &str, connection: ConnectionId, then: F) -> bool
    where
        F: FnOnce(&Room, &Participant),
    {
        let now = self.clock.now();
        let Some(mut room) = self.rooms.get_mut(room_id) else {
            return false;
        };
        let Some(participant) = room.participant_mut(user_id) else {
            return false;
        };
        if participant.connection != connection {
            debug!(
                "Activity from {} in {} ignored: entry owned by another connection",
                user_id, room_id
            );
            return false;
        }

        let promoted = participant.touch(now);
        let participant = participant.clone();

        if promoted {
            self.sink.on_status(&room, &participant, StatusCause::Activity);
        }
        then(&room, &participant);
        true
    }

    /// Apply idle demotions to one room. Returns the number of transitions.
    pub fn demote_idle(&self, room_id: &str, policy: &IdlePolicy) -> usize {
        let now = self.clock.now();
        let Some(mut room) = self.rooms.get_mut(room_id) else {
            return 0;
        };

        let mut demoted = Vec::new();
        for participant in room.participants.iter_mut() {
            if let Some(next) = policy.demotion(participant.status, participant.idle_for(now)) {
                participant.status = next;
                demoted.push(participant.clone());
            }
        }

        for participant in &demoted {
            self.sink.on_status(&room, participant, StatusCause::Sweep);
        }
        demoted.len()
    }

    /// Copy of a room's roster, `None` if the room does not exist
    pub fn snapshot(&self, room_id: &str) -> Option<Vec<Participant>> {
        self.rooms.get(room_id).map(|room| room.snapshot())
    }

    pub fn contains(&self, room_id: &str, user_id: &str) -> bool {
        self.rooms
            .get(room_id)
            .is_some_and(|room| room.participant(user_id).is_some())
    }

    pub fn room_ids(&self) -> Vec<RoomId> {
        self.rooms.iter().map(|r| r.key().clone()).collect()
    }

    pub fn summaries(&self) -> Vec<RoomSummary> {
        self.rooms.iter().map(|r| RoomSummary::from(r.value())).collect()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Participants across all rooms
    pub fn participant_count(&self) -> usize {
        self.rooms.iter().map(|r| r.len()).sum()
    }
}
