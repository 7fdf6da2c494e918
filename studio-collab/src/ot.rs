//! Edit operations, vector clocks and the position-based transform.
//!
//! The transform is position based: an incoming operation is shifted
//! right past the content of every earlier local insert that lands at or
//! before it. Delete/delete and format conflicts are left untouched, so
//! replicas are not guaranteed to converge under every interleaving.
//! Positions and lengths count Unicode scalar values.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Insert,
    Delete,
    Retain,
    Format,
}

/// Per-user logical counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<String, u64>);

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user_id: &str) -> u64 {
        self.0.get(user_id).copied().unwrap_or(0)
    }

    /// Advance `user_id` by one and return the new value.
    pub fn increment(&mut self, user_id: &str) -> u64 {
        let counter = self.0.entry(user_id.to_string()).or_insert(0);
        *counter = counter.saturating_add(1);
        *counter
    }

    /// Per-key maximum; no entry ever decreases.
    pub fn merge(&mut self, other: &VectorClock) {
        for (user, &remote) in &other.0 {
            let local = self.0.entry(user.clone()).or_insert(0);
            *local = (*local).max(remote);
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl<K: Into<String>> FromIterator<(K, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (K, u64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// An operation before the session stamps identity and causality on it.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationDraft {
    pub kind: OperationKind,
    pub position: usize,
    pub content: Option<String>,
    pub attributes: Option<Map<String, Value>>,
    pub length: Option<usize>,
}

impl OperationDraft {
    pub fn insert(position: usize, content: impl Into<String>) -> Self {
        Self {
            kind: OperationKind::Insert,
            position,
            content: Some(content.into()),
            attributes: None,
            length: None,
        }
    }

    pub fn delete(position: usize, length: usize) -> Self {
        Self {
            kind: OperationKind::Delete,
            position,
            content: None,
            attributes: None,
            length: Some(length),
        }
    }

    pub fn retain(position: usize, length: usize) -> Self {
        Self {
            kind: OperationKind::Retain,
            position,
            content: None,
            attributes: None,
            length: Some(length),
        }
    }

    pub fn format(position: usize, length: usize, attributes: Map<String, Value>) -> Self {
        Self {
            kind: OperationKind::Format,
            position,
            content: None,
            attributes: Some(attributes),
            length: Some(length),
        }
    }
}

/// A broadcast edit. Immutable once sent; transforms produce new values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditOperation {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: OperationKind,
    pub position: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
    pub user_id: String,
    pub timestamp: u64,
    pub vector_clock: VectorClock,
}

impl EditOperation {
    pub fn from_draft(
        draft: OperationDraft,
        id: String,
        user_id: String,
        timestamp: u64,
        vector_clock: VectorClock,
    ) -> Self {
        Self {
            id,
            kind: draft.kind,
            position: draft.position,
            content: draft.content,
            attributes: draft.attributes,
            length: draft.length,
            user_id,
            timestamp,
            vector_clock,
        }
    }

    /// Length of inserted content in scalar values (0 when absent).
    pub fn content_len(&self) -> usize {
        self.content.as_deref().map_or(0, |c| c.chars().count())
    }
}

/// Shift `remote` past one earlier local operation. Remote positions are
/// untrusted, so the shift saturates instead of overflowing.
fn shift_past(remote: &EditOperation, position: usize, local: &EditOperation) -> usize {
    if local.kind != OperationKind::Insert {
        return position;
    }
    let shifts = match remote.kind {
        OperationKind::Insert => position >= local.position,
        OperationKind::Delete => position > local.position,
        _ => false,
    };
    if shifts {
        position.saturating_add(local.content_len())
    } else {
        position
    }
}

/// Transform `remote` against every buffered local operation created
/// strictly before it, in buffer order.
pub fn transform<'a>(
    remote: &EditOperation,
    local: impl IntoIterator<Item = &'a EditOperation>,
) -> EditOperation {
    let position = local
        .into_iter()
        .filter(|l| l.timestamp < remote.timestamp)
        .fold(remote.position, |pos, l| shift_past(remote, pos, l));

    EditOperation {
        position,
        ..remote.clone()
    }
}

/// Bounded history of local operations; the oldest is evicted on overflow.
#[derive(Debug, Clone)]
pub struct OperationsBuffer {
    operations: VecDeque<EditOperation>,
    capacity: usize,
}

impl OperationsBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            operations: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    /// Append, returning the evicted operation if the buffer was full.
    pub fn push(&mut self, op: EditOperation) -> Option<EditOperation> {
        let evicted = if self.operations.len() >= self.capacity {
            self.operations.pop_front()
        } else {
            None
        };
        self.operations.push_back(op);
        evicted
    }

    pub fn iter(&self) -> impl Iterator<Item = &EditOperation> {
        self.operations.iter()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn to_vec(&self) -> Vec<EditOperation> {
        self.operations.iter().cloned().collect()
    }
}
