//! Edit and comment relays.
//!
//! Edits and comments are persisted elsewhere; these relays only stamp them
//! with the server time and forward them to the other connections in the
//! room. The sender's activity is recorded in the same room critical section
//! as the fan-out, so a promotion back to active is always seen first.

use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use super::broadcast::Broadcaster;
use super::protocol::{Editor, ServerMessage};
use super::{CollabError, CollabResult, ConnectionId};
use crate::auth::Identity;
use crate::clock::Clock;
use crate::room::RoomRegistry;

/// Forwards edits and comments to room peers
pub struct Relay {
    registry: Arc<RoomRegistry>,
    broadcaster: Arc<Broadcaster>,
    clock: Arc<dyn Clock>,
    max_payload_bytes: usize,
}

impl Relay {
    pub fn new(
        registry: Arc<RoomRegistry>,
        broadcaster: Arc<Broadcaster>,
        clock: Arc<dyn Clock>,
        max_payload_bytes: usize,
    ) -> Self {
        Self {
            registry,
            broadcaster,
            clock,
            max_payload_bytes,
        }
    }

    /// Relay an edit to every other connection in the room.
    /// Returns the number of recipients.
    pub fn edit(
        &self,
        origin: ConnectionId,
        identity: &Identity,
        room_id: &str,
        section: &str,
        data: Value,
        version: Value,
    ) -> CollabResult<usize> {
        require_room(room_id)?;
        if section.is_empty() {
            return Err(CollabError::RelayFailure("section is required".to_string()));
        }
        if data.is_null() {
            return Err(CollabError::RelayFailure("edit has no data".to_string()));
        }
        if version.is_null() {
            return Err(CollabError::RelayFailure("edit has no version".to_string()));
        }
        self.check_size(&data)?;

        let msg = ServerMessage::AssessmentEdited {
            user_id: identity.user_id.clone(),
            section: section.to_string(),
            data,
            version,
            timestamp: self.clock.now(),
            editor: Editor {
                id: identity.user_id.clone(),
                email: identity.email.clone(),
                name: identity.name.clone(),
            },
        };

        let delivered = self.forward(origin, identity, room_id, &msg)?;
        debug!(
            "Relayed edit of {} in {} from {} to {} peers",
            section, room_id, identity.user_id, delivered
        );
        Ok(delivered)
    }

    /// Relay a newly created comment to every other connection in the room
    pub fn comment(
        &self,
        origin: ConnectionId,
        identity: &Identity,
        room_id: &str,
        comment: Value,
    ) -> CollabResult<usize> {
        require_room(room_id)?;
        self.check_size(&comment)?;

        let msg = ServerMessage::CommentAdded {
            comment,
            user_id: identity.user_id.clone(),
            timestamp: self.clock.now(),
        };

        let delivered = self.forward(origin, identity, room_id, &msg)?;
        debug!(
            "Relayed comment in {} from {} to {} peers",
            room_id, identity.user_id, delivered
        );
        Ok(delivered)
    }

    fn forward(
        &self,
        origin: ConnectionId,
        identity: &Identity,
        room_id: &str,
        msg: &ServerMessage,
    ) -> CollabResult<usize> {
        let mut delivered = 0;
        let present = self
            .registry
            .record_activity(room_id, &identity.user_id, origin, |room, _| {
                delivered = self.broadcaster.fan_out(room, Some(origin), msg);
            });

        if !present {
            return Err(CollabError::NotAParticipant {
                room_id: room_id.to_string(),
                user_id: identity.user_id.clone(),
            });
        }
        Ok(delivered)
    }

    fn check_size(&self, payload: &Value) -> CollabResult<()> {
        let size = serde_json::to_vec(payload)
            .map_err(|e| CollabError::RelayFailure(e.to_string()))?
            .len();
        if size > self.max_payload_bytes {
            return Err(CollabError::RelayFailure(format!(
                "payload too large: {} bytes (max: {})",
                size, self.max_payload_bytes
            )));
        }
        Ok(())
    }
}

fn require_room(room_id: &str) -> CollabResult<()> {
    if room_id.is_empty() {
        return Err(CollabError::RelayFailure("room id is required".to_string()));
    }
    Ok(())
}
