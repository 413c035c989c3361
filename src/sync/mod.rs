//! Real-time collaboration over WebSocket.
//!
//! This module moves messages between participants of an assessment room.
//! It provides:
//! - JSON WebSocket protocol
//! - Presence state and the [`presence::PresenceSink`] seam
//! - Fan-out of presence events to room connections
//! - Edit and comment relays
//! - The idle sweeper
//! - [`CollabServer`], which binds connections to rooms and handles disconnects

pub mod broadcast;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod sweeper;

pub use server::CollabServer;

use std::time::Duration;
use thiserror::Error;

/// Identifier of a shared document (assessment)
pub type RoomId = String;

/// Identifier of an authenticated user
pub type UserId = String;

/// Identifier of a single transport connection
pub type ConnectionId = uuid::Uuid;

/// Result type for collaboration operations
pub type CollabResult<T> = Result<T, CollabError>;

/// Errors that can occur while handling room-scoped messages
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollabError {
    /// Message for a room the connection has not joined
    #[error("User {user_id} is not a participant of room {room_id}")]
    NotAParticipant { room_id: RoomId, user_id: UserId },

    /// An edit or comment could not be relayed
    #[error("Relay failed: {0}")]
    RelayFailure(String),

    /// Delivery to a single recipient failed
    #[error("Transport failure for connection {0}")]
    Transport(ConnectionId),

    /// Connection id is not registered
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// Room-scoped message without a room id
    #[error("Room id is required")]
    MissingRoomId,

    #[error("Room not found: {0}")]
    RoomNotFound(RoomId),
}

/// Tuning for presence and relay behavior
#[derive(Debug, Clone)]
pub struct CollabConfig {
    /// No activity for this long demotes active → idle
    pub idle_after: Duration,
    /// No activity for this long demotes to offline
    pub offline_after: Duration,
    /// Idle sweeper period
    pub sweep_interval: Duration,
    /// Largest serialized edit or comment payload that will be relayed
    pub max_edit_bytes: usize,
}

impl CollabConfig {
    pub fn idle_policy(&self) -> presence::IdlePolicy {
        presence::IdlePolicy::new(self.idle_after, self.offline_after)
    }
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            idle_after: Duration::from_secs(5 * 60),
            offline_after: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
            max_edit_bytes: 256 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collab_error_display() {
        let err = CollabError::NotAParticipant {
            room_id: "r1".to_string(),
            user_id: "u1".to_string(),
        };
        assert_eq!(err.to_string(), "User u1 is not a participant of room r1");
    }

    #[test]
    fn test_collab_config_default() {
        let config = CollabConfig::default();
        assert_eq!(config.idle_policy(), presence::IdlePolicy::default());
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
    }
}
