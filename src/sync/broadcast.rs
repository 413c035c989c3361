//! Presence broadcaster.
//!
//! Holds the outbound channel of every live connection and fans room events
//! out to them. Delivery is fire-and-forget: a closed channel is logged and
//! skipped, never allowed to stop delivery to the rest of the room.

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use super::presence::{Participant, PresenceSink, StatusCause};
use super::protocol::ServerMessage;
use super::{CollabError, CollabResult, ConnectionId};
use crate::room::Room;

/// Outbound channel to one connection
pub type Outbox = mpsc::UnboundedSender<ServerMessage>;

/// Connection table and room fan-out
#[derive(Default)]
pub struct Broadcaster {
    connections: DashMap<ConnectionId, Outbox>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, connection: ConnectionId, outbox: Outbox) {
        self.connections.insert(connection, outbox);
    }

    pub fn unregister(&self, connection: ConnectionId) -> bool {
        self.connections.remove(&connection).is_some()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Send to a single connection
    pub fn send(&self, connection: ConnectionId, msg: ServerMessage) -> CollabResult<()> {
        let outbox = self
            .connections
            .get(&connection)
            .ok_or(CollabError::UnknownConnection(connection))?;

        outbox
            .send(msg)
            .map_err(|_| CollabError::Transport(connection))
    }

    /// Deliver `msg` to every connection in `room` except `exclude`.
    /// Returns the number of successful deliveries.
    pub fn fan_out(&self, room: &Room, exclude: Option<ConnectionId>, msg: &ServerMessage) -> usize {
        let mut delivered = 0;
        for connection in room.connections() {
            if Some(connection) == exclude {
                continue;
            }
            match self.send(connection, msg.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => debug!("Dropped event for room {}: {}", room.id(), e),
            }
        }
        delivered
    }
}

impl PresenceSink for Broadcaster {
    fn on_join(&self, room: &Room, participant: &Participant) {
        self.fan_out(
            room,
            Some(participant.connection),
            &ServerMessage::user_joined(participant),
        );

        let roster = ServerMessage::ActiveUsers {
            users: room.snapshot(),
        };
        if let Err(e) = self.send(participant.connection, roster) {
            debug!("Could not deliver roster to {}: {}", participant.user_id, e);
        }
    }

    fn on_leave(&self, room: &Room, user_id: &str) {
        self.fan_out(
            room,
            None,
            &ServerMessage::UserLeft {
                user_id: user_id.to_string(),
            },
        );
    }

    fn on_cursor(&self, room: &Room, participant: &Participant) {
        let Some(cursor) = participant.cursor.clone() else {
            return;
        };
        let msg = ServerMessage::CursorUpdate {
            user_id: participant.user_id.clone(),
            email: participant.email.clone(),
            name: participant.name.clone(),
            cursor,
        };
        self.fan_out(room, Some(participant.connection), &msg);
    }

    fn on_status(&self, room: &Room, participant: &Participant, cause: StatusCause) {
        let exclude = cause.is_self_sourced().then_some(participant.connection);
        self.fan_out(room, exclude, &ServerMessage::user_status(participant));
    }
}
