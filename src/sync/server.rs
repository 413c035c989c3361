//! CollabServer: binds connections to rooms and dispatches their messages.
//!
//! Each live connection has one entry in the connection table holding the
//! authenticated identity and, once joined, the room it is bound to. Messages
//! are dispatched synchronously; all presence state lives in the
//! [`RoomRegistry`], and events leave through the [`Broadcaster`].

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::broadcast::Broadcaster;
use super::presence::{Cursor, Participant, PresenceSink, PresenceStatus};
use super::protocol::{ClientMessage, ServerMessage};
use super::relay::Relay;
use super::sweeper::IdleSweeper;
use super::{CollabConfig, CollabError, CollabResult, ConnectionId, RoomId};
use crate::auth::Identity;
use crate::clock::{Clock, SystemClock};
use crate::room::RoomRegistry;

/// Room a connection has joined, and the identity it joined with
#[derive(Debug, Clone)]
struct Binding {
    room_id: RoomId,
    identity: Identity,
}

/// Per-connection state
#[derive(Debug)]
struct Connection {
    identity: Identity,
    binding: Option<Binding>,
    /// Set once by `disconnect`; a closed connection can never bind again
    closed: bool,
}

/// The collaboration server
pub struct CollabServer {
    config: CollabConfig,
    registry: Arc<RoomRegistry>,
    broadcaster: Arc<Broadcaster>,
    relay: Relay,
    clock: Arc<dyn Clock>,
    /// Live connections
    connections: DashMap<ConnectionId, Arc<Mutex<Connection>>>,
    started_at: Instant,
    shutdown_tx: broadcast::Sender<()>,
}

impl CollabServer {
    /// Create a server driven by the system clock
    pub fn new(config: CollabConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CollabConfig, clock: Arc<dyn Clock>) -> Self {
        let broadcaster = Arc::new(Broadcaster::new());
        let registry = Arc::new(RoomRegistry::new(
            broadcaster.clone() as Arc<dyn PresenceSink>,
            clock.clone(),
        ));
        let relay = Relay::new(
            registry.clone(),
            broadcaster.clone(),
            clock.clone(),
            config.max_edit_bytes,
        );
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            registry,
            broadcaster,
            relay,
            clock,
            connections: DashMap::new(),
            started_at: Instant::now(),
            shutdown_tx,
        }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Get a shutdown receiver
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Initiate graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Register an authenticated connection. Returns its id and the receiving
    /// end of its outbound channel.
    pub fn connect(&self, identity: Identity) -> (ConnectionId, mpsc::UnboundedReceiver<ServerMessage>) {
        let connection_id = ConnectionId::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        info!("Connection {} opened for {}", connection_id, identity.user_id);
        self.broadcaster.register(connection_id, tx);
        self.connections.insert(
            connection_id,
            Arc::new(Mutex::new(Connection {
                identity,
                binding: None,
                closed: false,
            })),
        );

        (connection_id, rx)
    }

    /// Send a message to one connection
    pub fn send_to(&self, connection_id: ConnectionId, msg: ServerMessage) -> CollabResult<()> {
        self.broadcaster.send(connection_id, msg)
    }

    /// Dispatch one decoded client message.
    ///
    /// Failures never escape: they are logged, and a failed edit is reported
    /// to the sender with `edit-error`.
    pub fn handle_message(&self, connection_id: ConnectionId, msg: ClientMessage) {
        let room_id = msg.room_id().map(str::to_string);
        let result = match msg {
            ClientMessage::JoinRoom { room_id, name } => {
                self.join_room(connection_id, &room_id, name).map(drop)
            }
            ClientMessage::LeaveRoom { room_id, user_id } => {
                self.leave_room(connection_id, &room_id, &user_id).map(drop)
            }
            ClientMessage::CursorMove {
                room_id,
                position,
                section,
            } => {
                let cursor = Cursor {
                    x: position.x,
                    y: position.y,
                    section,
                };
                self.move_cursor(connection_id, &room_id, cursor)
            }
            ClientMessage::StatusChange { room_id, status } => {
                self.change_status(connection_id, &room_id, status.into())
            }
            ClientMessage::CommentAdd { room_id, comment } => {
                self.comment(connection_id, &room_id, comment).map(drop)
            }
            ClientMessage::AssessmentEdit {
                room_id,
                section,
                data,
                version,
            } => {
                if let Err(e) = self.edit(connection_id, &room_id, &section, data, version) {
                    warn!("Edit from {} in room {} not relayed: {}", connection_id, room_id, e);
                    self.reject_edit(connection_id, e.to_string(), section);
                }
                Ok(())
            }
            ClientMessage::Ping { timestamp } => self.send_to(
                connection_id,
                ServerMessage::Pong {
                    timestamp,
                    server_time: self.clock.now().timestamp_millis(),
                },
            ),
        };

        if let Err(e) = result {
            debug!(
                "Dropped message from {} for room {:?}: {}",
                connection_id, room_id, e
            );
        }
    }

    /// Report a failed edit to the connection that sent it
    pub fn reject_edit(&self, connection_id: ConnectionId, message: impl Into<String>, section: impl Into<String>) {
        let reply = ServerMessage::edit_error(message, section, self.clock.now());
        if let Err(e) = self.send_to(connection_id, reply) {
            debug!("Could not report edit error: {}", e);
        }
    }

    /// Join a room, leaving the connection's previous room first.
    /// Returns the roster after the join.
    pub fn join_room(
        &self,
        connection_id: ConnectionId,
        room_id: &str,
        name: Option<String>,
    ) -> CollabResult<Vec<Participant>> {
        if room_id.is_empty() {
            return Err(CollabError::MissingRoomId);
        }
        let connection = self.connection(connection_id)?;
        self.join_connection(connection_id, &connection, room_id, name)
    }

    fn join_connection(
        &self,
        connection_id: ConnectionId,
        connection: &Mutex<Connection>,
        room_id: &str,
        name: Option<String>,
    ) -> CollabResult<Vec<Participant>> {
        let mut connection = connection.lock();
        // Lost a race with disconnect after the table lookup
        if connection.closed {
            return Err(CollabError::UnknownConnection(connection_id));
        }

        if let Some(previous) = connection.binding.take() {
            if previous.room_id != room_id {
                self.detach(connection_id, &previous);
            }
        }

        let mut identity = connection.identity.clone();
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            identity.name = Some(name);
        }

        let roster = self.registry.join(room_id, &identity, connection_id);
        info!("User {} joined room {}", identity.user_id, room_id);

        connection.binding = Some(Binding {
            room_id: room_id.to_string(),
            identity,
        });
        Ok(roster)
    }

    /// Explicitly leave a room. Returns whether a roster entry was removed.
    pub fn leave_room(&self, connection_id: ConnectionId, room_id: &str, user_id: &str) -> CollabResult<bool> {
        let connection = self.connection(connection_id)?;
        let mut connection = connection.lock();

        let bound = connection
            .binding
            .as_ref()
            .is_some_and(|b| b.room_id == room_id && b.identity.user_id == user_id);
        if !bound {
            return Err(CollabError::NotAParticipant {
                room_id: room_id.to_string(),
                user_id: user_id.to_string(),
            });
        }

        match connection.binding.take() {
            Some(binding) => Ok(self.detach(connection_id, &binding)),
            None => Ok(false),
        }
    }

    pub fn move_cursor(&self, connection_id: ConnectionId, room_id: &str, cursor: Cursor) -> CollabResult<()> {
        let identity = self.member(connection_id, room_id)?;
        if !self.registry.update_cursor(room_id, &identity.user_id, cursor) {
            return Err(not_a_participant(room_id, &identity));
        }
        Ok(())
    }

    pub fn change_status(
        &self,
        connection_id: ConnectionId,
        room_id: &str,
        status: PresenceStatus,
    ) -> CollabResult<()> {
        let identity = self.member(connection_id, room_id)?;
        if !self.registry.update_status(room_id, &identity.user_id, status) {
            return Err(not_a_participant(room_id, &identity));
        }
        Ok(())
    }

    /// Relay an edit to the rest of the room. Returns the number of recipients.
    pub fn edit(
        &self,
        connection_id: ConnectionId,
        room_id: &str,
        section: &str,
        data: Value,
        version: Value,
    ) -> CollabResult<usize> {
        let identity = self.member(connection_id, room_id)?;
        self.relay
            .edit(connection_id, &identity, room_id, section, data, version)
    }

    /// Relay a comment to the rest of the room. Returns the number of recipients.
    pub fn comment(&self, connection_id: ConnectionId, room_id: &str, comment: Value) -> CollabResult<usize> {
        let identity = self.member(connection_id, room_id)?;
        self.relay.comment(connection_id, &identity, room_id, comment)
    }

    /// Tear down a closed connection. Safe to call more than once; only the
    /// first call leaves the bound room.
    pub fn disconnect(&self, connection_id: ConnectionId) -> bool {
        let Some((_, connection)) = self.connections.remove(&connection_id) else {
            return false;
        };

        {
            let mut connection = connection.lock();
            connection.closed = true;
            if let Some(binding) = connection.binding.take() {
                self.detach(connection_id, &binding);
            }
        }
        self.broadcaster.unregister(connection_id);

        info!("Connection {} closed", connection_id);
        true
    }

    /// Start the idle sweeper
    pub fn start_background_tasks(self: Arc<Self>) -> BackgroundTaskHandles {
        let sweeper = IdleSweeper::new(self.registry.clone(), self.config.idle_policy());
        info!(
            "Idle sweeper started (every {:?}, idle after {:?}, offline after {:?})",
            self.config.sweep_interval, self.config.idle_after, self.config.offline_after
        );

        BackgroundTaskHandles {
            sweeper_task: sweeper.spawn(self.config.sweep_interval, self.shutdown_receiver()),
        }
    }

    /// Get server statistics
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            active_rooms: self.registry.room_count(),
            active_participants: self.registry.participant_count(),
            connections: self.connections.len(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    fn connection(&self, connection_id: ConnectionId) -> CollabResult<Arc<Mutex<Connection>>> {
        self.connections
            .get(&connection_id)
            .map(|c| c.clone())
            .ok_or(CollabError::UnknownConnection(connection_id))
    }

    /// Identity the connection joined `room_id` with
    fn member(&self, connection_id: ConnectionId, room_id: &str) -> CollabResult<Identity> {
        if room_id.is_empty() {
            return Err(CollabError::MissingRoomId);
        }
        let connection = self.connection(connection_id)?;
        let connection = connection.lock();
        if connection.closed {
            return Err(CollabError::UnknownConnection(connection_id));
        }

        match &connection.binding {
            Some(binding) if binding.room_id == room_id => Ok(binding.identity.clone()),
            _ => Err(not_a_participant(room_id, &connection.identity)),
        }
    }

    fn detach(&self, connection_id: ConnectionId, binding: &Binding) -> bool {
        let removed = self
            .registry
            .leave_connection(&binding.room_id, &binding.identity.user_id, connection_id);
        if removed {
            info!("User {} left room {}", binding.identity.user_id, binding.room_id);
        }
        removed
    }
}

fn not_a_participant(room_id: &str, identity: &Identity) -> CollabError {
    CollabError::NotAParticipant {
        room_id: room_id.to_string(),
        user_id: identity.user_id.clone(),
    }
}

/// Server statistics
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub active_rooms: usize,
    pub active_participants: usize,
    pub connections: usize,
    pub uptime_seconds: u64,
}

/// Handles for background tasks
pub struct BackgroundTaskHandles {
    pub sweeper_task: tokio::task::JoinHandle<()>,
}

impl BackgroundTaskHandles {
    /// Wait for all tasks to complete
    pub async fn wait(self) {
        let _ = self.sweeper_task.await;
    }
}
