//! Collaboration events carried in `collaboration_event` envelopes.
//!
//! On the wire an event is `{ type, data, userId, projectId, timestamp }`
//! where `data` has a fixed shape per `type`. Decoding goes through
//! [`RawEvent`] so an unknown `type` or a `data` that does not match its
//! type is rejected as a whole.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::ot::EditOperation;
use crate::presence::{CursorPosition, ParticipantProfile, SelectionRange};

/// Closed set of collaboration event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollabEventType {
    CommentAdded,
    CommentUpdated,
    CommentDeleted,
    CommentResolved,
    UserJoined,
    UserLeft,
    UserTyping,
    CursorMoved,
    SelectionChanged,
    DocumentOperation,
    ProjectUpdated,
}

impl fmt::Display for CollabEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CollabEventType::CommentAdded => "comment_added",
            CollabEventType::CommentUpdated => "comment_updated",
            CollabEventType::CommentDeleted => "comment_deleted",
            CollabEventType::CommentResolved => "comment_resolved",
            CollabEventType::UserJoined => "user_joined",
            CollabEventType::UserLeft => "user_left",
            CollabEventType::UserTyping => "user_typing",
            CollabEventType::CursorMoved => "cursor_moved",
            CollabEventType::SelectionChanged => "selection_changed",
            CollabEventType::DocumentOperation => "document_operation",
            CollabEventType::ProjectUpdated => "project_updated",
        };
        f.write_str(name)
    }
}

/// Feedback comment pinned to a point in the video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: String,
    pub content: String,
    pub author_id: String,
    pub author_name: String,
    /// Seconds into the video the comment refers to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub resolved: bool,
    pub created_at: u64,
}

/// What the caller supplies to add a comment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommentDraft {
    pub content: String,
    pub video_time: Option<f64>,
    pub parent_id: Option<String>,
}

impl CommentDraft {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn at(mut self, video_time: f64) -> Self {
        self.video_time = Some(video_time);
        self
    }

    pub fn reply_to(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentEdit {
    pub comment_id: String,
    pub content: String,
    pub edited_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentRef {
    pub comment_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentResolution {
    pub comment_id: String,
    pub resolved_by: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Departure {
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingState {
    pub is_typing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment_id: Option<String>,
}

/// Event body, one variant per [`CollabEventType`].
#[derive(Debug, Clone, PartialEq)]
pub enum EventBody {
    CommentAdded(Comment),
    CommentUpdated(CommentEdit),
    CommentDeleted(CommentRef),
    CommentResolved(CommentResolution),
    UserJoined(ParticipantProfile),
    UserLeft(Departure),
    UserTyping(TypingState),
    CursorMoved(CursorPosition),
    SelectionChanged(SelectionRange),
    DocumentOperation(EditOperation),
    ProjectUpdated(Value),
}

impl EventBody {
    pub fn event_type(&self) -> CollabEventType {
        match self {
            EventBody::CommentAdded(_) => CollabEventType::CommentAdded,
            EventBody::CommentUpdated(_) => CollabEventType::CommentUpdated,
            EventBody::CommentDeleted(_) => CollabEventType::CommentDeleted,
            EventBody::CommentResolved(_) => CollabEventType::CommentResolved,
            EventBody::UserJoined(_) => CollabEventType::UserJoined,
            EventBody::UserLeft(_) => CollabEventType::UserLeft,
            EventBody::UserTyping(_) => CollabEventType::UserTyping,
            EventBody::CursorMoved(_) => CollabEventType::CursorMoved,
            EventBody::SelectionChanged(_) => CollabEventType::SelectionChanged,
            EventBody::DocumentOperation(_) => CollabEventType::DocumentOperation,
            EventBody::ProjectUpdated(_) => CollabEventType::ProjectUpdated,
        }
    }

    fn to_data(&self) -> Result<Value, serde_json::Error> {
        match self {
            EventBody::CommentAdded(d) => serde_json::to_value(d),
            EventBody::CommentUpdated(d) => serde_json::to_value(d),
            EventBody::CommentDeleted(d) => serde_json::to_value(d),
            EventBody::CommentResolved(d) => serde_json::to_value(d),
            EventBody::UserJoined(d) => serde_json::to_value(d),
            EventBody::UserLeft(d) => serde_json::to_value(d),
            EventBody::UserTyping(d) => serde_json::to_value(d),
            EventBody::CursorMoved(d) => serde_json::to_value(d),
            EventBody::SelectionChanged(d) => serde_json::to_value(d),
            EventBody::DocumentOperation(d) => serde_json::to_value(d),
            EventBody::ProjectUpdated(d) => Ok(d.clone()),
        }
    }

    fn from_data(kind: CollabEventType, data: Value) -> Result<Self, serde_json::Error> {
        use serde_json::from_value;
        Ok(match kind {
            CollabEventType::CommentAdded => EventBody::CommentAdded(from_value(data)?),
            CollabEventType::CommentUpdated => EventBody::CommentUpdated(from_value(data)?),
            CollabEventType::CommentDeleted => EventBody::CommentDeleted(from_value(data)?),
            CollabEventType::CommentResolved => EventBody::CommentResolved(from_value(data)?),
            CollabEventType::UserJoined => EventBody::UserJoined(from_value(data)?),
            CollabEventType::UserLeft => EventBody::UserLeft(from_value(data)?),
            CollabEventType::UserTyping => EventBody::UserTyping(from_value(data)?),
            CollabEventType::CursorMoved => EventBody::CursorMoved(from_value(data)?),
            CollabEventType::SelectionChanged => EventBody::SelectionChanged(from_value(data)?),
            CollabEventType::DocumentOperation => EventBody::DocumentOperation(from_value(data)?),
            CollabEventType::ProjectUpdated => EventBody::ProjectUpdated(data),
        })
    }
}

/// A collaboration event tagged with its actor and project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEvent", into = "RawEvent")]
pub struct CollaborationEvent {
    pub body: EventBody,
    pub user_id: String,
    pub project_id: String,
    pub timestamp: u64,
}

impl CollaborationEvent {
    pub fn event_type(&self) -> CollabEventType {
        self.body.event_type()
    }
}

/// Untyped wire form of [`CollaborationEvent`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    #[serde(rename = "type")]
    pub kind: CollabEventType,
    pub data: Value,
    pub user_id: String,
    pub project_id: String,
    pub timestamp: u64,
}

impl TryFrom<RawEvent> for CollaborationEvent {
    type Error = String;

    fn try_from(raw: RawEvent) -> Result<Self, Self::Error> {
        let body = EventBody::from_data(raw.kind, raw.data)
            .map_err(|e| format!("invalid {} data: {e}", raw.kind))?;
        Ok(Self {
            body,
            user_id: raw.user_id,
            project_id: raw.project_id,
            timestamp: raw.timestamp,
        })
    }
}

impl From<CollaborationEvent> for RawEvent {
    fn from(event: CollaborationEvent) -> Self {
        Self {
            kind: event.body.event_type(),
            // Every body type serializes infallibly (string keys, finite data)
            data: event.body.to_data().unwrap_or(Value::Null),
            user_id: event.user_id,
            project_id: event.project_id,
            timestamp: event.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ot::{OperationDraft, VectorClock};
    use serde_json::json;

    fn event(body: EventBody) -> CollaborationEvent {
        CollaborationEvent {
            body,
            user_id: "alice".into(),
            project_id: "proj".into(),
            timestamp: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_comment_added_wire_shape() {
        let comment = Comment {
            id: "c1".into(),
            content: "hi".into(),
            author_id: "alice".into(),
            author_name: "Alice".into(),
            video_time: Some(12.5),
            parent_id: None,
            resolved: false,
            created_at: 1,
        };
        let value = serde_json::to_value(event(EventBody::CommentAdded(comment))).unwrap();

        assert_eq!(value["type"], "comment_added");
        assert_eq!(value["data"]["content"], "hi");
        assert_eq!(value["data"]["videoTime"], 12.5);
        assert_eq!(value["userId"], "alice");
        assert_eq!(value["projectId"], "proj");
    }

    #[test]
    fn test_document_operation_roundtrip() {
        let op = crate::ot::EditOperation::from_draft(
            OperationDraft::insert(3, "abc"),
            "op1".into(),
            "alice".into(),
            5,
            [("alice", 2)].into_iter().collect::<VectorClock>(),
        );
        let original = event(EventBody::DocumentOperation(op));
        let text = serde_json::to_string(&original).unwrap();
        let parsed: CollaborationEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, original);
        assert_eq!(parsed.event_type(), CollabEventType::DocumentOperation);
    }

    #[test]
    fn test_unknown_event_type_rejected() {
        let value = json!({
            "type": "comment_exploded", "data": {},
            "userId": "a", "projectId": "p", "timestamp": 1
        });
        assert!(serde_json::from_value::<CollaborationEvent>(value).is_err());
    }

    #[test]
    fn test_mismatched_data_rejected() {
        let value = json!({
            "type": "cursor_moved", "data": { "commentId": "c1" },
            "userId": "a", "projectId": "p", "timestamp": 1
        });
        let err = serde_json::from_value::<CollaborationEvent>(value).unwrap_err();
        assert!(err.to_string().contains("cursor_moved"));
    }

    #[test]
    fn test_project_updated_passes_data_through() {
        let value = json!({
            "type": "project_updated", "data": { "title": "Cut v2" },
            "userId": "a", "projectId": "p", "timestamp": 1
        });
        let parsed: CollaborationEvent = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.body, EventBody::ProjectUpdated(json!({ "title": "Cut v2" })));
    }

    #[test]
    fn test_typing_state_optional_comment() {
        let value = serde_json::to_value(TypingState {
            is_typing: true,
            comment_id: None,
        })
        .unwrap();
        assert_eq!(value, json!({ "isTyping": true }));
    }

    #[test]
    fn test_comment_draft_builder() {
        let draft = CommentDraft::new("fix the fade").at(3.0).reply_to("c0");
        assert_eq!(draft.video_time, Some(3.0));
        assert_eq!(draft.parent_id.as_deref(), Some("c0"));
    }
}
