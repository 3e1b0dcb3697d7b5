//! Message protocol definitions
//!
//! JSON envelope `{"type", "payload", "timestamp"}` shared with browser
//! clients. Outbound events use Serde's adjacently tagged enum; inbound
//! frames are decoded in two stages so that an unknown type can be told
//! apart from a malformed payload.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::FrameError;
use crate::types::{ConnectionId, UserId};

/// Hub → Client event
///
/// Per-connection FIFO is the only ordering guarantee; timestamps from
/// different producers may interleave.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    #[serde(flatten)]
    pub body: EventBody,
    pub timestamp: DateTime<Utc>,
}

/// Kind-specific event data
///
/// Tags are part of the wire contract. New kinds are added, existing tags
/// are never repurposed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EventBody {
    /// A message was delivered to the recipient's mailbox
    #[serde(rename = "new_email")]
    NewMail(NewMailNotice),
    /// A recipient opened a message the user sent
    #[serde(rename = "read_email")]
    ReadReceipt(ReadReceiptNotice),
    /// Another user is typing to this user
    Typing(TypingNotice),
    /// A user's connection came, went or changed status
    Presence(PresenceNotice),
    /// Administrator broadcast
    #[serde(rename = "system_notification")]
    SystemNotice(SystemNoticePayload),
    /// Keepalive
    Ping,
    /// Keepalive answer
    Pong,
    /// Something the client sent could not be handled
    Error(ErrorPayload),
    /// Informational message from the hub
    Info(InfoPayload),
}

/// Closed set of event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NewMail,
    ReadReceipt,
    Typing,
    Presence,
    SystemNotice,
    KeepalivePing,
    KeepalivePong,
    Error,
    Info,
}

impl EventKind {
    /// Wire tag for this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::NewMail => "new_email",
            EventKind::ReadReceipt => "read_email",
            EventKind::Typing => "typing",
            EventKind::Presence => "presence",
            EventKind::SystemNotice => "system_notification",
            EventKind::KeepalivePing => "ping",
            EventKind::KeepalivePong => "pong",
            EventKind::Error => "error",
            EventKind::Info => "info",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewMailNotice {
    pub email_id: i64,
    pub sender_id: UserId,
    pub sender_name: String,
    pub sender_email: String,
    pub subject: String,
    pub preview: String,
    pub has_attachment: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadReceiptNotice {
    pub email_id: i64,
    pub reader_id: UserId,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypingNotice {
    /// Always the sending connection's own user, never client-supplied
    pub from_user_id: UserId,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceNotice {
    pub user_id: UserId,
    pub status: PresenceStatus,
    pub client_id: ConnectionId,
}

/// Presence status values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
    Away,
    Busy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemNoticePayload {
    pub title: String,
    pub message: String,
    pub level: NoticeLevel,
    pub from: String,
}

/// Severity shown with a system notice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    #[default]
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

/// Error codes for `EventBody::Error`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Not JSON, or payload does not fit the type
    InvalidMessage,
    /// Type tag the hub does not handle
    UnknownType,
    /// Binary or other non-text frame
    UnsupportedFrame,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InfoPayload {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ConnectionId>,
}

impl Event {
    /// Wrap a body with the current time
    pub fn new(body: EventBody) -> Self {
        Self {
            body,
            timestamp: Utc::now(),
        }
    }

    pub fn kind(&self) -> EventKind {
        match &self.body {
            EventBody::NewMail(_) => EventKind::NewMail,
            EventBody::ReadReceipt(_) => EventKind::ReadReceipt,
            EventBody::Typing(_) => EventKind::Typing,
            EventBody::Presence(_) => EventKind::Presence,
            EventBody::SystemNotice(_) => EventKind::SystemNotice,
            EventBody::Ping => EventKind::KeepalivePing,
            EventBody::Pong => EventKind::KeepalivePong,
            EventBody::Error(_) => EventKind::Error,
            EventBody::Info(_) => EventKind::Info,
        }
    }

    /// Welcome sent to a freshly registered connection
    pub fn connected(client_id: ConnectionId) -> Self {
        Self::new(EventBody::Info(InfoPayload {
            message: "connected".to_string(),
            client_id: Some(client_id),
        }))
    }

    pub fn presence(user_id: UserId, status: PresenceStatus, client_id: ConnectionId) -> Self {
        Self::new(EventBody::Presence(PresenceNotice {
            user_id,
            status,
            client_id,
        }))
    }

    pub fn typing(from_user_id: UserId, is_typing: bool) -> Self {
        Self::new(EventBody::Typing(TypingNotice {
            from_user_id,
            is_typing,
        }))
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(EventBody::Error(ErrorPayload {
            code,
            message: message.into(),
        }))
    }

    pub fn ping() -> Self {
        Self::new(EventBody::Ping)
    }

    pub fn pong() -> Self {
        Self::new(EventBody::Pong)
    }
}

/// Convert a decode failure into the error event sent back to the client
impl From<FrameError> for Event {
    fn from(err: FrameError) -> Self {
        let code = match &err {
            FrameError::Malformed(_) | FrameError::InvalidPayload { .. } => {
                ErrorCode::InvalidMessage
            }
            FrameError::UnknownKind(_) => ErrorCode::UnknownType,
            FrameError::Binary => ErrorCode::UnsupportedFrame,
        };
        Event::error(code, err.to_string())
    }
}

/// Client → Hub message
///
/// Only the kinds the dispatch policy acts on. Anything else surfaces as
/// `FrameError::UnknownKind` from [`ClientMessage::decode`].
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Typing indicator aimed at one user
    Typing(TypingRequest),
    /// Status change for the sending user
    Presence(PresenceRequest),
    /// Keepalive from the client
    Ping,
    /// Answer to a hub keepalive
    Pong,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TypingRequest {
    pub to_user_id: UserId,
    #[serde(default)]
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PresenceRequest {
    pub status: PresenceStatus,
}

/// Envelope read before the payload is interpreted
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
}

impl ClientMessage {
    /// Decode a text frame
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|e| FrameError::Malformed(e.to_string()))?;

        match envelope.kind.as_str() {
            "typing" => parse_payload(&envelope.kind, envelope.payload).map(ClientMessage::Typing),
            "presence" => {
                parse_payload(&envelope.kind, envelope.payload).map(ClientMessage::Presence)
            }
            "ping" => Ok(ClientMessage::Ping),
            "pong" => Ok(ClientMessage::Pong),
            _ => Err(FrameError::UnknownKind(envelope.kind)),
        }
    }
}

fn parse_payload<T: DeserializeOwned>(kind: &str, payload: serde_json::Value) -> Result<T, FrameError> {
    serde_json::from_value(payload).map_err(|e| FrameError::InvalidPayload {
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}
