//! Rooms and the registry that owns them.
//!
//! A room is the set of participants currently collaborating on one
//! assessment. Rooms only exist while they have participants; the
//! [`RoomRegistry`] creates them on first join and deletes them on last leave.

mod registry;

pub use registry::RoomRegistry;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::sync::presence::Participant;
use crate::sync::{ConnectionId, RoomId};

/// Live roster of one room
#[derive(Debug, Clone)]
pub struct Room {
    id: RoomId,
    /// Participants in join order, at most one per user
    participants: Vec<Participant>,
    created_at: DateTime<Utc>,
}

impl Room {
    pub(crate) fn new(id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            participants: Vec::new(),
            created_at,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_participants(id: impl Into<String>, participants: Vec<Participant>) -> Self {
        Self {
            id: id.into(),
            participants,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn participant(&self, user_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    /// Connections currently attached to this room
    pub fn connections(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.participants.iter().map(|p| p.connection)
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Immutable copy of the roster
    pub fn snapshot(&self) -> Vec<Participant> {
        self.participants.clone()
    }

    fn position(&self, user_id: &str) -> Option<usize> {
        self.participants.iter().position(|p| p.user_id == user_id)
    }

    fn participant_mut(&mut self, user_id: &str) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.user_id == user_id)
    }
}

/// Summary of a room for listings
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub room_id: RoomId,
    pub participant_count: usize,
    pub created_at: DateTime<Utc>,
}

impl From<&Room> for RoomSummary {
    fn from(room: &Room) -> Self {
        Self {
            room_id: room.id.clone(),
            participant_count: room.len(),
            created_at: room.created_at,
        }
    }
}
