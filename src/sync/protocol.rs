//! JSON WebSocket protocol for room presence and relays.
//!
//! Every frame is a JSON object whose `type` field names the event
//! (`join-room`, `cursor-update`, ...) with camelCase payload fields.
//! Legacy clients that still speak `join-assessment` / `leave-assessment`
//! with an `assessmentId` field are accepted as well.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::presence::{Cursor, Participant, PresenceStatus};
use super::{RoomId, UserId};

/// Maximum inbound frame size (1MB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Protocol errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::InvalidFormat(err.to_string())
    }
}

/// Pointer position inside the assessment page
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// Statuses a client may set on itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    Active,
    Idle,
}

impl From<ClientStatus> for PresenceStatus {
    fn from(status: ClientStatus) -> Self {
        match status {
            ClientStatus::Active => PresenceStatus::Active,
            ClientStatus::Idle => PresenceStatus::Idle,
        }
    }
}

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Join a room; user id and email come from the authenticated identity
    #[serde(alias = "join-assessment")]
    JoinRoom {
        #[serde(alias = "assessmentId")]
        room_id: RoomId,
        /// Display name override
        #[serde(default)]
        name: Option<String>,
    },

    /// Leave a room
    #[serde(alias = "leave-assessment")]
    LeaveRoom {
        #[serde(alias = "assessmentId")]
        room_id: RoomId,
        user_id: UserId,
    },

    /// Cursor moved
    CursorMove {
        #[serde(alias = "assessmentId")]
        room_id: RoomId,
        position: Position,
        #[serde(default)]
        section: Option<String>,
    },

    /// Explicit status change
    StatusChange {
        #[serde(alias = "assessmentId")]
        room_id: RoomId,
        status: ClientStatus,
    },

    /// A comment was created and should be shown to the room
    CommentAdd {
        #[serde(alias = "assessmentId")]
        room_id: RoomId,
        comment: Value,
    },

    /// A section of the assessment was edited.
    ///
    /// Fields default when absent so an incomplete edit still reaches the
    /// relay and is answered with `edit-error`.
    AssessmentEdit {
        #[serde(default, alias = "assessmentId")]
        room_id: RoomId,
        #[serde(default)]
        section: String,
        #[serde(default)]
        data: Value,
        /// Opaque version, passed through untouched
        #[serde(default)]
        version: Value,
    },

    /// Keepalive
    Ping {
        #[serde(default)]
        timestamp: u64,
    },
}

impl ClientMessage {
    /// Room the message is scoped to, if any
    pub fn room_id(&self) -> Option<&str> {
        match self {
            ClientMessage::JoinRoom { room_id, .. }
            | ClientMessage::LeaveRoom { room_id, .. }
            | ClientMessage::CursorMove { room_id, .. }
            | ClientMessage::StatusChange { room_id, .. }
            | ClientMessage::CommentAdd { room_id, .. }
            | ClientMessage::AssessmentEdit { room_id, .. } => Some(room_id),
            ClientMessage::Ping { .. } => None,
        }
    }
}

/// Identity of the user who made an edit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Editor {
    pub id: UserId,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Another participant joined the room
    UserJoined {
        user_id: UserId,
        email: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        status: PresenceStatus,
    },

    /// Full roster, sent only to the connection that just joined
    ActiveUsers { users: Vec<Participant> },

    /// Another participant's cursor moved
    CursorUpdate {
        user_id: UserId,
        email: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        cursor: Cursor,
    },

    /// A participant's status changed
    UserStatusChange {
        user_id: UserId,
        status: PresenceStatus,
    },

    /// A comment was added by another participant
    CommentAdded {
        comment: Value,
        user_id: UserId,
        timestamp: DateTime<Utc>,
    },

    /// A section was edited by another participant
    AssessmentEdited {
        user_id: UserId,
        section: String,
        data: Value,
        version: Value,
        timestamp: DateTime<Utc>,
        editor: Editor,
    },

    /// A participant left the room
    UserLeft { user_id: UserId },

    /// An edit from this connection was not relayed
    EditError {
        message: String,
        section: String,
        timestamp: DateTime<Utc>,
    },

    /// Keepalive response
    Pong { timestamp: u64, server_time: i64 },

    /// Frame could not be processed
    Error { code: ErrorCode, message: String },
}

impl ServerMessage {
    pub fn user_joined(participant: &Participant) -> Self {
        ServerMessage::UserJoined {
            user_id: participant.user_id.clone(),
            email: participant.email.clone(),
            name: participant.name.clone(),
            status: participant.status,
        }
    }

    pub fn user_status(participant: &Participant) -> Self {
        ServerMessage::UserStatusChange {
            user_id: participant.user_id.clone(),
            status: participant.status,
        }
    }

    pub fn edit_error(message: impl Into<String>, section: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        ServerMessage::EditError {
            message: message.into(),
            section: section.into(),
            timestamp,
        }
    }
}

/// Error codes for `error` frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    InvalidMessage,
    MessageTooLarge,
}

impl From<&ProtocolError> for ErrorCode {
    fn from(err: &ProtocolError) -> Self {
        match err {
            ProtocolError::InvalidFormat(_) => ErrorCode::InvalidMessage,
            ProtocolError::MessageTooLarge(..) => ErrorCode::MessageTooLarge,
        }
    }
}

/// Decode an inbound text frame
pub fn decode_client(text: &str) -> Result<ClientMessage, ProtocolError> {
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(text.len(), MAX_MESSAGE_SIZE));
    }
    Ok(serde_json::from_str(text)?)
}

/// Section named by an `assessment-edit` frame that failed to decode.
///
/// Returns `None` when the frame is not an edit at all; an edit without a
/// usable section yields an empty string.
pub fn undecodable_edit_section(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    if value.get("type")?.as_str()? != "assessment-edit" {
        return None;
    }
    let section = value
        .get("section")
        .and_then(Value::as_str)
        .unwrap_or_default();
    Some(section.to_string())
}

/// Encode an outbound frame
pub fn encode_server(msg: &ServerMessage) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(msg)?)
}

#[cfg(test)]
pub fn decode_server(text: &str) -> ServerMessage {
    serde_json::from_str(text).unwrap()
}
