//! JSON wire protocol shared by the transport client and the relay.
//!
//! Every frame on the socket is one [`Envelope`]:
//! ```text
//! {
//!   "id": "…", "type": "collaboration_event", "payload": { … },
//!   "timestamp": 1700000000000,
//!   "userId": "…", "projectId": "…", "sequenceNumber": 42,
//!   "senderId": "…"
//! }
//! ```
//!
//! The payload is opaque to the transport except for the two reserved
//! kinds it handles itself: `heartbeat` ([`Heartbeat`]) and `connection`
//! ([`PresenceNotice`]).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

/// Stream key used for envelopes that carry no `userId`.
pub const ANONYMOUS_STREAM: &str = "anonymous";

/// Closed set of envelope kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Presence bookkeeping emitted by the relay (reserved)
    Connection,
    /// Liveness ping/pong (reserved)
    Heartbeat,
    Comment,
    Cursor,
    UserStatus,
    /// Carries a [`crate::events::CollaborationEvent`]
    CollaborationEvent,
    FeedbackUpdate,
    ProjectSync,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Connection => "connection",
            MessageType::Heartbeat => "heartbeat",
            MessageType::Comment => "comment",
            MessageType::Cursor => "cursor",
            MessageType::UserStatus => "user_status",
            MessageType::CollaborationEvent => "collaboration_event",
            MessageType::FeedbackUpdate => "feedback_update",
            MessageType::ProjectSync => "project_sync",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single framed message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub payload: Value,
    /// Sender-side epoch millis
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// Monotonically increasing per sender
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<u64>,
    /// Instance id of the sending transport; one user may have several
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
}

impl Envelope {
    /// Create an envelope with a fresh id and the current timestamp.
    pub fn new(kind: MessageType, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            payload,
            timestamp: now_millis(),
            user_id: None,
            project_id: None,
            sequence_number: None,
            sender_id: None,
        }
    }

    /// Create a heartbeat envelope.
    pub fn heartbeat(kind: HeartbeatKind) -> Self {
        Self::new(
            MessageType::Heartbeat,
            serde_json::json!({ "kind": kind }),
        )
    }

    /// Create a `connection` presence notice.
    pub fn presence(user_id: impl Into<String>, status: PresenceStatus) -> Self {
        let notice = PresenceNotice {
            user_id: user_id.into(),
            status,
        };
        Self::new(
            MessageType::Connection,
            serde_json::to_value(&notice).unwrap_or(Value::Null),
        )
    }

    /// Serialize to the JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Json(e.to_string()))
    }

    /// Parse and validate a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|e| ProtocolError::Json(e.to_string()))?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Structural checks serde cannot express.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.id.is_empty() {
            return Err(ProtocolError::InvalidEnvelope("empty id"));
        }
        if self.user_id.as_deref() == Some("") {
            return Err(ProtocolError::InvalidEnvelope("empty userId"));
        }
        if self.sender_id.as_deref() == Some("") {
            return Err(ProtocolError::InvalidEnvelope("empty senderId"));
        }
        Ok(())
    }

    /// Key of the logical stream this envelope's sequence number belongs to.
    pub fn stream_key(&self) -> StreamKey {
        StreamKey {
            user_id: self
                .user_id
                .clone()
                .unwrap_or_else(|| ANONYMOUS_STREAM.to_string()),
            sender_id: self.sender_id.clone(),
        }
    }

    /// Decode the heartbeat payload (`None` for other kinds or bad payloads).
    pub fn heartbeat_kind(&self) -> Option<HeartbeatKind> {
        if self.kind != MessageType::Heartbeat {
            return None;
        }
        serde_json::from_value::<Heartbeat>(self.payload.clone())
            .ok()
            .map(|h| h.kind)
    }

    /// Decode the `connection` presence payload.
    pub fn presence_notice(&self) -> Result<PresenceNotice, ProtocolError> {
        if self.kind != MessageType::Connection {
            return Err(ProtocolError::InvalidPayload {
                kind: self.kind,
                reason: "not a connection envelope".into(),
            });
        }
        serde_json::from_value(self.payload.clone()).map_err(|e| ProtocolError::InvalidPayload {
            kind: self.kind,
            reason: e.to_string(),
        })
    }
}

/// Identifies one sender's sequence stream: the user plus the sending
/// transport instance, when the envelope names one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub user_id: String,
    pub sender_id: Option<String>,
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sender_id {
            Some(sender) => write!(f, "{}/{sender}", self.user_id),
            None => f.write_str(&self.user_id),
        }
    }
}

/// Optional routing metadata attached by [`crate::client::TransportClient::send`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub user_id: Option<String>,
    pub project_id: Option<String>,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatKind {
    Ping,
    Pong,
}

/// Payload of a `heartbeat` envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub kind: HeartbeatKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// Payload of a `connection` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceNotice {
    pub user_id: String,
    pub status: PresenceStatus,
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("malformed JSON: {0}")]
    Json(String),
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(&'static str),
    #[error("binary frame is not valid UTF-8")]
    InvalidUtf8,
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: MessageType, reason: String },
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
