//! Presence state for participants in an assessment room.
//!
//! This module holds the ephemeral per-user state the registry mutates:
//! - Presence status (active/idle/offline)
//! - Cursor position within the document
//! - Last activity timestamp driving the idle state machine
//!
//! It also defines [`PresenceSink`], the statically known listener the registry
//! notifies on every roster mutation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{ConnectionId, UserId};
use crate::auth::Identity;
use crate::room::Room;

/// Cursor position in the shared document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub x: f64,
    pub y: f64,
    /// Document section the cursor is in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
}

impl Cursor {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y, section: None }
    }

    pub fn in_section(mut self, section: impl Into<String>) -> Self {
        self.section = Some(section.into());
        self
    }
}

/// Presence status for a participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    /// Recently active
    #[default]
    Active,
    /// No activity past the idle threshold
    Idle,
    /// No activity past the offline threshold; still on the roster
    Offline,
}

/// Why a participant's status changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCause {
    /// The participant sent an explicit status change
    Client,
    /// Activity promoted an idle/offline participant back to active
    Activity,
    /// The idle sweeper demoted the participant
    Sweep,
}

impl StatusCause {
    /// Whether the participant itself triggered the change
    pub fn is_self_sourced(self) -> bool {
        !matches!(self, StatusCause::Sweep)
    }
}

/// One user's live presence in one room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: UserId,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub status: PresenceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
    pub last_active: DateTime<Utc>,
    /// Connection that owns this roster entry
    #[serde(skip)]
    pub connection: ConnectionId,
}

impl Participant {
    pub fn new(identity: &Identity, connection: ConnectionId, now: DateTime<Utc>) -> Self {
        Self {
            user_id: identity.user_id.clone(),
            email: identity.email.clone(),
            name: identity.name.clone(),
            status: PresenceStatus::Active,
            cursor: None,
            last_active: now,
            connection,
        }
    }

    /// Record activity. Returns true when this promoted the participant back to active.
    pub fn touch(&mut self, now: DateTime<Utc>) -> bool {
        self.last_active = now;
        if self.status != PresenceStatus::Active {
            self.status = PresenceStatus::Active;
            return true;
        }
        false
    }

    /// Time since the last activity, zero if the clock went backwards
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_active).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Idle thresholds for the presence state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdlePolicy {
    pub idle_after: Duration,
    pub offline_after: Duration,
}

impl IdlePolicy {
    pub fn new(idle_after: Duration, offline_after: Duration) -> Self {
        Self {
            idle_after,
            offline_after,
        }
    }

    /// Status a participant should be demoted to, if any.
    ///
    /// Only demotes: promotion back to active happens on activity, never here.
    pub fn demotion(&self, current: PresenceStatus, idle_for: Duration) -> Option<PresenceStatus> {
        if idle_for >= self.offline_after && current != PresenceStatus::Offline {
            Some(PresenceStatus::Offline)
        } else if idle_for >= self.idle_after && current == PresenceStatus::Active {
            Some(PresenceStatus::Idle)
        } else {
            None
        }
    }
}

impl Default for IdlePolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(5 * 60), Duration::from_secs(30 * 60))
    }
}

/// Listener notified synchronously by the registry on every roster mutation.
///
/// Calls happen while the room is locked, so each sink observes a room's
/// events in exactly the order they were applied.
pub trait PresenceSink: Send + Sync {
    /// A participant joined (or re-joined) `room`
    fn on_join(&self, room: &Room, participant: &Participant);

    /// `user_id` left; `room` holds the remaining participants
    fn on_leave(&self, room: &Room, user_id: &str);

    /// A participant moved their cursor
    fn on_cursor(&self, room: &Room, participant: &Participant);

    /// A participant's status changed
    fn on_status(&self, room: &Room, participant: &Participant, cause: StatusCause);
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex;

    /// Event captured by [`RecordingSink`]
    #[derive(Debug, Clone, PartialEq)]
    pub enum Recorded {
        Join(String, UserId),
        Leave(String, UserId),
        Cursor(String, UserId),
        Status(String, UserId, PresenceStatus, StatusCause),
    }

    /// Sink that records everything it sees
    #[derive(Default)]
    pub struct RecordingSink {
        pub events: Mutex<Vec<Recorded>>,
    }

    impl RecordingSink {
        pub fn take(&self) -> Vec<Recorded> {
            std::mem::take(&mut *self.events.lock())
        }
    }

    impl PresenceSink for RecordingSink {
        fn on_join(&self, room: &Room, participant: &Participant) {
            self.events
                .lock()
                .push(Recorded::Join(room.id().to_string(), participant.user_id.clone()));
        }

        fn on_leave(&self, room: &Room, user_id: &str) {
            self.events
                .lock()
                .push(Recorded::Leave(room.id().to_string(), user_id.to_string()));
        }

        fn on_cursor(&self, room: &Room, participant: &Participant) {
            self.events
                .lock()
                .push(Recorded::Cursor(room.id().to_string(), participant.user_id.clone()));
        }

        fn on_status(&self, room: &Room, participant: &Participant, cause: StatusCause) {
            self.events.lock().push(Recorded::Status(
                room.id().to_string(),
                participant.user_id.clone(),
                participant.status,
                cause,
            ));
        }
    }
}
