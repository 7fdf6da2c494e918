//! Per-project collaboration session on top of the transport client.
//!
//! Translates domain actions (comments, typing, cursor, selection, edits)
//! into `collaboration_event` envelopes, and inbound envelopes back into
//! [`SessionEvent`]s while keeping the participant roster, vector clock
//! and operations buffer current.
//!
//! Unlike the transport, session listeners fan out: every listener
//! registered for a topic is called, and [`CollaborationManager::on`]
//! returns an id to remove exactly that listener.
//!
//! ```text
//!  UI action ──► CollaborationManager ──► TransportClient::send ──► relay
//!                                                                    │
//!  UI ◄── SessionEvent ◄── receive() ◄── TransportEvent::Message ◄──┘
//! ```

use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::client::{
    ConnectionState, TransportClient, TransportError, TransportEvent, TransportEventKind,
};
use crate::config::{CollabConfig, ConflictResolution, TransportConfig};
use crate::events::{
    CollabEventType, CollaborationEvent, Comment, CommentDraft, CommentEdit, CommentRef,
    CommentResolution, Departure, EventBody, TypingState,
};
use crate::lock;
use crate::ot::{transform, EditOperation, OperationDraft, OperationsBuffer, VectorClock};
use crate::presence::{
    CursorPosition, Participant, ParticipantProfile, ParticipantRoster, SelectionRange,
};
use crate::protocol::{now_millis, Envelope, MessageType, SendOptions};
use crate::timers::TimerSet;

/// Local typing indicators revert to idle after this long.
pub const TYPING_TIMEOUT: Duration = Duration::from_secs(3);

const GLOBAL_TYPING_KEY: &str = "global";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CollabError {
    #[error("{0} is disabled in the session config")]
    FeatureDisabled(&'static str),
    #[error("collaboration session has been stopped")]
    SessionStopped,
    #[error("failed to serialize event: {0}")]
    Serialization(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Started,
    /// Terminal
    Stopped,
}

/// Events delivered to session listeners.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A remote collaboration event (document operations already transformed)
    Remote(CollaborationEvent),
    ConnectionChanged(ConnectionState),
    Reconnecting { attempt: u32, delay: Duration },
    UserStatus { user_id: String, online: bool },
    Error(TransportError),
}

/// What a listener subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// One collaboration event type
    Event(CollabEventType),
    /// Every collaboration event
    AnyEvent,
    Connection,
    UserStatus,
    Error,
}

impl Topic {
    fn matches(&self, event: &SessionEvent) -> bool {
        match (self, event) {
            (Topic::Event(kind), SessionEvent::Remote(e)) => e.event_type() == *kind,
            (Topic::AnyEvent, SessionEvent::Remote(_)) => true,
            (
                Topic::Connection,
                SessionEvent::ConnectionChanged(_) | SessionEvent::Reconnecting { .. },
            ) => true,
            (Topic::UserStatus, SessionEvent::UserStatus { .. }) => true,
            (Topic::Error, SessionEvent::Error(_)) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub type SessionListener = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

type SessionRegistry = Arc<Mutex<Vec<Weak<SessionInner>>>>;

enum Routing {
    /// The session owns the transport's listener slots
    Direct,
    /// A provider owns the slots and fans events out to its sessions
    Shared(SessionRegistry),
}

struct SessionState {
    lifecycle: Lifecycle,
    roster: ParticipantRoster,
    /// Typing keys currently announced as active
    typing: HashSet<String>,
    clock: VectorClock,
    operations: OperationsBuffer,
    /// Remote users this session re-announced itself to since they joined
    greeted: HashSet<String>,
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(ListenerId, Topic, SessionListener)>,
}

struct SessionInner {
    config: CollabConfig,
    transport: TransportClient,
    routing: Routing,
    state: Mutex<SessionState>,
    listeners: Mutex<Listeners>,
    typing_timers: TimerSet,
}

/// Collaboration session for one project membership.
#[derive(Clone)]
pub struct CollaborationManager {
    inner: Arc<SessionInner>,
}

impl CollaborationManager {
    /// Create a session that registers directly on `transport`.
    ///
    /// The transport keeps one listener per event kind, so only one
    /// direct session should be attached to a transport at a time; use
    /// [`CollaborationProvider`] to share a transport across projects.
    pub fn new(config: CollabConfig, transport: TransportClient) -> Self {
        Self::with_routing(config, transport, Routing::Direct)
    }

    fn with_routing(config: CollabConfig, transport: TransportClient, routing: Routing) -> Self {
        let operations = OperationsBuffer::new(config.max_operations_buffer);
        Self {
            inner: Arc::new(SessionInner {
                config,
                transport,
                routing,
                state: Mutex::new(SessionState {
                    lifecycle: Lifecycle::Uninitialized,
                    roster: ParticipantRoster::new(),
                    typing: HashSet::new(),
                    clock: VectorClock::new(),
                    operations,
                    greeted: HashSet::new(),
                }),
                listeners: Mutex::new(Listeners::default()),
                typing_timers: TimerSet::new(),
            }),
        }
    }

    /// Connect the transport and announce this user to the project.
    pub async fn start(&self) -> Result<(), CollabError> {
        let inner = &self.inner;
        {
            let mut state = lock(&inner.state);
            match state.lifecycle {
                Lifecycle::Stopped => return Err(CollabError::SessionStopped),
                Lifecycle::Started => return Ok(()),
                Lifecycle::Uninitialized => {}
            }
            let profile = inner.profile();
            state.roster.join(&profile, now_millis());
        }

        if let Routing::Direct = inner.routing {
            inner.attach_direct();
        }
        inner.transport.connect().await?;

        lock(&inner.state).lifecycle = Lifecycle::Started;
        inner.broadcast(EventBody::UserJoined(inner.profile()))?;
        log::info!(
            "{} joined project {}",
            inner.config.user_name,
            inner.config.project_id
        );
        Ok(())
    }

    /// Leave the project and tear the session down for good.
    ///
    /// Announces `user_left` when still connected, cancels every pending
    /// typing timer, then disconnects the transport (for provider
    /// sessions, only once no other session is still live).
    pub fn stop(&self) {
        let inner = &self.inner;
        {
            let mut state = lock(&inner.state);
            if state.lifecycle == Lifecycle::Stopped {
                return;
            }
            state.lifecycle = Lifecycle::Stopped;
            state.typing.clear();
        }

        if inner.transport.is_connected() {
            let departure = Departure {
                user_id: inner.config.user_id.clone(),
            };
            if let Err(e) = inner.broadcast(EventBody::UserLeft(departure)) {
                log::warn!("Failed to announce departure: {e}");
            }
        }
        inner.typing_timers.clear();

        let me = Arc::as_ptr(inner);
        let last_session = match &inner.routing {
            Routing::Direct => true,
            Routing::Shared(registry) => lock(registry)
                .iter()
                .filter(|s| s.as_ptr() != me)
                .filter_map(Weak::upgrade)
                .all(|s| !s.is_started()),
        };
        if last_session {
            inner.transport.disconnect();
        }

        // Detach only now so this session still hears the final disconnect
        match &inner.routing {
            Routing::Direct => {
                for kind in TRANSPORT_KINDS {
                    inner.transport.off(kind);
                }
            }
            Routing::Shared(registry) => {
                lock(registry).retain(|s| s.strong_count() > 0 && s.as_ptr() != me);
            }
        }
        log::info!(
            "{} left project {}",
            inner.config.user_name,
            inner.config.project_id
        );
    }

    /// Broadcast a new comment and return its id.
    ///
    /// The caller applies the comment to its own view; the session keeps
    /// no comment storage.
    pub fn add_comment(&self, draft: CommentDraft) -> Result<String, CollabError> {
        let config = &self.inner.config;
        let comment = Comment {
            id: Uuid::new_v4().to_string(),
            content: draft.content,
            author_id: config.user_id.clone(),
            author_name: config.user_name.clone(),
            video_time: draft.video_time,
            parent_id: draft.parent_id,
            resolved: false,
            created_at: now_millis(),
        };
        let id = comment.id.clone();
        self.inner.broadcast(EventBody::CommentAdded(comment))?;
        Ok(id)
    }

    pub fn update_comment(
        &self,
        comment_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<(), CollabError> {
        let edit = CommentEdit {
            comment_id: comment_id.into(),
            content: content.into(),
            edited_at: now_millis(),
        };
        self.inner.broadcast(EventBody::CommentUpdated(edit))?;
        Ok(())
    }

    pub fn delete_comment(&self, comment_id: impl Into<String>) -> Result<(), CollabError> {
        let target = CommentRef {
            comment_id: comment_id.into(),
        };
        self.inner.broadcast(EventBody::CommentDeleted(target))?;
        Ok(())
    }

    pub fn resolve_comment(&self, comment_id: impl Into<String>) -> Result<(), CollabError> {
        let resolution = CommentResolution {
            comment_id: comment_id.into(),
            resolved_by: self.inner.config.user_id.clone(),
        };
        self.inner.broadcast(EventBody::CommentResolved(resolution))?;
        Ok(())
    }

    /// Announce whether the local user is typing, optionally in a comment thread.
    ///
    /// Repeating the current state is a no-op. `true` reverts to `false`
    /// on its own after [`TYPING_TIMEOUT`]; each comment id has its own
    /// timer.
    pub fn set_typing(&self, is_typing: bool, comment_id: Option<&str>) -> Result<(), CollabError> {
        SessionInner::set_typing(&self.inner, is_typing, comment_id.map(str::to_string))
    }

    /// Broadcast the local pointer; does nothing when cursor tracking is off.
    pub fn update_cursor(&self, position: CursorPosition) -> Result<(), CollabError> {
        if !self.inner.config.enable_cursor_tracking {
            return Ok(());
        }
        self.inner.broadcast(EventBody::CursorMoved(position))?;
        Ok(())
    }

    pub fn update_selection(&self, selection: SelectionRange) -> Result<(), CollabError> {
        self.inner.broadcast(EventBody::SelectionChanged(selection))?;
        Ok(())
    }

    /// Stamp, buffer and broadcast a local edit. Returns the operation id.
    pub fn apply_operation(&self, draft: OperationDraft) -> Result<String, CollabError> {
        let inner = &self.inner;
        if !inner.config.enable_operational_transform {
            return Err(CollabError::FeatureDisabled("operational transform"));
        }

        let operation = {
            let mut state = lock(&inner.state);
            state.clock.increment(&inner.config.user_id);
            let operation = EditOperation::from_draft(
                draft,
                Uuid::new_v4().to_string(),
                inner.config.user_id.clone(),
                now_millis(),
                state.clock.clone(),
            );
            if let Some(evicted) = state.operations.push(operation.clone()) {
                log::trace!("Operations buffer full, evicted {}", evicted.id);
            }
            operation
        };

        let id = operation.id.clone();
        inner.broadcast(EventBody::DocumentOperation(operation))?;
        Ok(id)
    }

    /// Register a listener; every listener on a topic is called.
    pub fn on<F>(&self, topic: Topic, listener: F) -> ListenerId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let mut listeners = lock(&self.inner.listeners);
        listeners.next_id += 1;
        let id = ListenerId(listeners.next_id);
        listeners.entries.push((id, topic, Arc::new(listener)));
        id
    }

    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.inner.listeners);
        let before = listeners.entries.len();
        listeners.entries.retain(|(existing, _, _)| *existing != id);
        listeners.entries.len() != before
    }

    /// Feed one inbound envelope through the session.
    ///
    /// This is what the transport listener calls; hosts with their own
    /// delivery channel may call it directly.
    pub fn receive(&self, envelope: &Envelope) {
        self.inner.handle_envelope(envelope);
    }

    pub fn get_collaboration_users(&self) -> Vec<Participant> {
        lock(&self.inner.state).roster.participants()
    }

    pub fn get_user(&self, user_id: &str) -> Option<Participant> {
        lock(&self.inner.state).roster.get(user_id).cloned()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.transport.is_connected()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        lock(&self.inner.state).lifecycle
    }

    pub fn vector_clock(&self) -> VectorClock {
        lock(&self.inner.state).clock.clone()
    }

    pub fn buffered_operations(&self) -> Vec<EditOperation> {
        lock(&self.inner.state).operations.to_vec()
    }

    /// Typing timers still scheduled.
    pub fn pending_timers(&self) -> usize {
        self.inner.typing_timers.pending()
    }

    pub fn config(&self) -> &CollabConfig {
        &self.inner.config
    }

    pub fn transport(&self) -> &TransportClient {
        &self.inner.transport
    }
}

const TRANSPORT_KINDS: [TransportEventKind; 5] = [
    TransportEventKind::ConnectionChange,
    TransportEventKind::Message,
    TransportEventKind::UserStatus,
    TransportEventKind::Error,
    TransportEventKind::ReconnectAttempt,
];

impl SessionInner {
    fn profile(&self) -> ParticipantProfile {
        ParticipantProfile {
            user_id: self.config.user_id.clone(),
            name: self.config.user_name.clone(),
            color: self.config.user_color.clone(),
            avatar: self.config.avatar.clone(),
        }
    }

    fn is_started(&self) -> bool {
        lock(&self.state).lifecycle == Lifecycle::Started
    }

    fn attach_direct(self: &Arc<Self>) {
        for kind in TRANSPORT_KINDS {
            let weak = Arc::downgrade(self);
            self.transport.on(kind, move |event| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_transport_event(event);
                }
            });
        }
    }

    fn broadcast(&self, body: EventBody) -> Result<String, CollabError> {
        let event = CollaborationEvent {
            body,
            user_id: self.config.user_id.clone(),
            project_id: self.config.project_id.clone(),
            timestamp: now_millis(),
        };
        let payload =
            serde_json::to_value(&event).map_err(|e| CollabError::Serialization(e.to_string()))?;
        let options = SendOptions::new()
            .user(self.config.user_id.as_str())
            .project(self.config.project_id.as_str());
        Ok(self
            .transport
            .send(MessageType::CollaborationEvent, payload, options))
    }

    fn set_typing(
        self: &Arc<Self>,
        is_typing: bool,
        comment_id: Option<String>,
    ) -> Result<(), CollabError> {
        if !self.config.enable_typing_indicators {
            return Ok(());
        }
        let key = comment_id
            .clone()
            .unwrap_or_else(|| GLOBAL_TYPING_KEY.to_string());
        {
            let mut state = lock(&self.state);
            if state.lifecycle == Lifecycle::Stopped {
                return Ok(());
            }
            let changed = if is_typing {
                state.typing.insert(key.clone())
            } else {
                state.typing.remove(&key)
            };
            if !changed {
                return Ok(());
            }
        }

        let timer_key = format!("typing:{key}");
        if is_typing {
            let weak = Arc::downgrade(self);
            let target = comment_id.clone();
            self.typing_timers
                .schedule(timer_key, TYPING_TIMEOUT, async move {
                    if let Some(inner) = weak.upgrade() {
                        if let Err(e) = SessionInner::set_typing(&inner, false, target) {
                            log::warn!("Failed to clear typing indicator: {e}");
                        }
                    }
                });
        } else {
            self.typing_timers.cancel(&timer_key);
        }

        self.broadcast(EventBody::UserTyping(TypingState {
            is_typing,
            comment_id,
        }))?;
        Ok(())
    }

    fn on_transport_event(&self, event: &TransportEvent) {
        match event {
            TransportEvent::Message(envelope) => self.handle_envelope(envelope),
            TransportEvent::ConnectionChanged(state) => {
                self.emit(&SessionEvent::ConnectionChanged(*state))
            }
            TransportEvent::ReconnectAttempt { attempt, delay } => {
                self.emit(&SessionEvent::Reconnecting {
                    attempt: *attempt,
                    delay: *delay,
                })
            }
            TransportEvent::UserStatus { user_id, online } => {
                {
                    let mut state = lock(&self.state);
                    state.roster.set_online(user_id, *online, now_millis());
                    if !*online {
                        state.greeted.remove(user_id);
                    }
                }
                self.emit(&SessionEvent::UserStatus {
                    user_id: user_id.clone(),
                    online: *online,
                });
            }
            TransportEvent::Error(e) => self.emit(&SessionEvent::Error(e.clone())),
        }
    }

    fn handle_envelope(&self, envelope: &Envelope) {
        if envelope.kind != MessageType::CollaborationEvent {
            return;
        }
        let event: CollaborationEvent = match serde_json::from_value(envelope.payload.clone()) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("Dropping malformed collaboration event {}: {e}", envelope.id);
                return;
            }
        };
        if event.project_id != self.config.project_id {
            return;
        }
        if event.user_id == self.config.user_id {
            log::trace!("Ignoring echo of own {} event", event.event_type());
            return;
        }

        let (event, greet) = self.apply_remote(event);
        if greet {
            // The newcomer subscribed after our own join went out
            log::debug!("Re-announcing {} to {}", self.config.user_id, event.user_id);
            if let Err(e) = self.broadcast(EventBody::UserJoined(self.profile())) {
                log::warn!("Failed to re-announce to {}: {e}", event.user_id);
            }
        }
        self.emit(&SessionEvent::Remote(event));
    }

    /// Fold a remote event into local state, returning what listeners see
    /// and whether the sender should be told about the local user.
    fn apply_remote(&self, mut event: CollaborationEvent) -> (CollaborationEvent, bool) {
        let mut state = lock(&self.state);
        let user = event.user_id.as_str();
        let at = event.timestamp;
        let mut greet = false;

        match &mut event.body {
            EventBody::UserJoined(profile) => {
                state.roster.join(profile, at);
                greet = state.lifecycle == Lifecycle::Started
                    && state.greeted.insert(profile.user_id.clone());
            }
            EventBody::UserLeft(departure) => {
                state.roster.leave(&departure.user_id, at);
                state.greeted.remove(&departure.user_id);
            }
            EventBody::UserTyping(typing) => {
                state.roster.set_typing(user, typing.is_typing, at);
            }
            EventBody::CursorMoved(cursor) => {
                state.roster.move_cursor(user, cursor.clone(), at);
            }
            EventBody::SelectionChanged(selection) => {
                state.roster.change_selection(user, selection.clone(), at);
            }
            EventBody::DocumentOperation(operation) => {
                state.clock.merge(&operation.vector_clock);
                if self.config.conflict_resolution == ConflictResolution::OperationalTransform {
                    let transformed = transform(operation, state.operations.iter());
                    if transformed.position != operation.position {
                        log::debug!(
                            "Transformed operation {} from {} to {}",
                            operation.id,
                            operation.position,
                            transformed.position
                        );
                    }
                    *operation = transformed;
                }
            }
            _ => {}
        }
        drop(state);
        (event, greet)
    }

    fn emit(&self, event: &SessionEvent) {
        let matching: Vec<SessionListener> = lock(&self.listeners)
            .entries
            .iter()
            .filter(|(_, topic, _)| topic.matches(event))
            .map(|(_, _, listener)| listener.clone())
            .collect();
        for listener in matching {
            listener(event);
        }
    }
}

/// Owns the process-wide transport and hands out sessions bound to it.
///
/// The provider holds the transport's listener slots and forwards every
/// transport event to each live session; sessions ignore events for
/// other projects.
pub struct CollaborationProvider {
    transport: TransportClient,
    sessions: SessionRegistry,
}

impl CollaborationProvider {
    pub fn new(config: TransportConfig) -> Self {
        let transport = TransportClient::new(config);
        let sessions: SessionRegistry = Arc::new(Mutex::new(Vec::new()));

        for kind in TRANSPORT_KINDS {
            let registry = Arc::downgrade(&sessions);
            transport.on(kind, move |event| {
                let Some(registry) = registry.upgrade() else {
                    return;
                };
                let live: Vec<Arc<SessionInner>> =
                    lock(&registry).iter().filter_map(Weak::upgrade).collect();
                for session in live {
                    session.on_transport_event(event);
                }
            });
        }

        Self {
            transport,
            sessions,
        }
    }

    pub fn transport(&self) -> &TransportClient {
        &self.transport
    }

    /// Create a session for one project on the shared transport.
    pub fn session(&self, config: CollabConfig) -> CollaborationManager {
        let manager = CollaborationManager::with_routing(
            config,
            self.transport.clone(),
            Routing::Shared(self.sessions.clone()),
        );
        let mut sessions = lock(&self.sessions);
        sessions.retain(|s| s.strong_count() > 0);
        sessions.push(Arc::downgrade(&manager.inner));
        manager
    }

    /// Sessions created here that are still alive and not stopped.
    pub fn active_sessions(&self) -> usize {
        lock(&self.sessions)
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|s| lock(&s.state).lifecycle != Lifecycle::Stopped)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ot::OperationKind;
    use serde_json::json;

    fn config(user: &str) -> CollabConfig {
        CollabConfig::new("proj-1", user, user.to_uppercase())
    }

    fn offline_manager(config: CollabConfig) -> CollaborationManager {
        let transport = TransportClient::new(TransportConfig::new("ws://127.0.0.1:9"));
        CollaborationManager::new(config, transport)
    }

    fn remote(user: &str, body: EventBody, timestamp: u64) -> Envelope {
        let event = CollaborationEvent {
            body,
            user_id: user.into(),
            project_id: "proj-1".into(),
            timestamp,
        };
        let mut envelope = Envelope::new(
            MessageType::CollaborationEvent,
            serde_json::to_value(&event).unwrap(),
        );
        envelope.user_id = Some(user.into());
        envelope
    }

    fn joined(user: &str) -> Envelope {
        remote(
            user,
            EventBody::UserJoined(ParticipantProfile {
                user_id: user.into(),
                name: user.to_uppercase(),
                color: "#ff0000".into(),
                avatar: None,
            }),
            1,
        )
    }

    fn remote_op(user: &str, draft: OperationDraft, clock: VectorClock, timestamp: u64) -> Envelope {
        let op = EditOperation::from_draft(draft, format!("{user}-op"), user.into(), timestamp, clock);
        remote(user, EventBody::DocumentOperation(op), timestamp)
    }

    fn record(manager: &CollaborationManager, topic: Topic) -> Arc<Mutex<Vec<SessionEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        manager.on(topic, move |event| sink.lock().unwrap().push(event.clone()));
        seen
    }

    fn queued_types(manager: &CollaborationManager) -> Vec<CollabEventType> {
        manager
            .transport()
            .queued()
            .into_iter()
            .map(|e| {
                serde_json::from_value::<CollaborationEvent>(e.payload)
                    .unwrap()
                    .event_type()
            })
            .collect()
    }

    #[test]
    fn test_comment_actions_queue_before_start() {
        let manager = offline_manager(config("alice"));
        let id = manager
            .add_comment(CommentDraft::new("hi").at(4.0))
            .unwrap();
        manager.update_comment(&id, "hello").unwrap();
        manager.resolve_comment(&id).unwrap();
        manager.delete_comment(&id).unwrap();

        assert_eq!(
            queued_types(&manager),
            vec![
                CollabEventType::CommentAdded,
                CollabEventType::CommentUpdated,
                CollabEventType::CommentResolved,
                CollabEventType::CommentDeleted,
            ]
        );
        let first = &manager.transport().queued()[0];
        assert_eq!(first.user_id.as_deref(), Some("alice"));
        assert_eq!(first.project_id.as_deref(), Some("proj-1"));
        assert_eq!(first.payload["data"]["id"], json!(id));
    }

    #[test]
    fn test_cursor_tracking_disabled_sends_nothing() {
        let mut cfg = config("alice");
        cfg.enable_cursor_tracking = false;
        let manager = offline_manager(cfg);

        manager.update_cursor(CursorPosition::new(1.0, 2.0)).unwrap();
        manager.update_selection(SelectionRange::new(0.0, 1.0)).unwrap();
        assert_eq!(queued_types(&manager), vec![CollabEventType::SelectionChanged]);
    }

    #[test]
    fn test_apply_operation_requires_ot() {
        let mut cfg = config("alice");
        cfg.enable_operational_transform = false;
        let manager = offline_manager(cfg);

        let err = manager.apply_operation(OperationDraft::insert(0, "x")).unwrap_err();
        assert_eq!(err, CollabError::FeatureDisabled("operational transform"));
        assert_eq!(manager.transport().queued_len(), 0);
    }

    #[test]
    fn test_apply_operation_increments_own_clock() {
        let manager = offline_manager(config("alice"));
        for expected in 1..=3 {
            manager.apply_operation(OperationDraft::insert(0, "x")).unwrap();
            assert_eq!(manager.vector_clock().get("alice"), expected);
        }

        let ops = manager.buffered_operations();
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[2].vector_clock.get("alice"), 3);
        assert_eq!(ops[0].vector_clock.get("alice"), 1);
    }

    #[test]
    fn test_operations_buffer_bounded() {
        let mut cfg = config("alice");
        cfg.max_operations_buffer = 2;
        let manager = offline_manager(cfg);
        let ids: Vec<_> = (0..3)
            .map(|i| manager.apply_operation(OperationDraft::insert(i, "x")).unwrap())
            .collect();

        let buffered: Vec<_> = manager.buffered_operations().into_iter().map(|o| o.id).collect();
        assert_eq!(buffered, ids[1..].to_vec());
    }

    #[test]
    fn test_remote_clock_merged_per_key() {
        let manager = offline_manager(config("A"));
        manager.apply_operation(OperationDraft::insert(0, "x")).unwrap();
        manager.receive(&remote_op(
            "B",
            OperationDraft::insert(0, "y"),
            [("B", 2)].into_iter().collect(),
            now_millis() + 10_000,
        ));
        assert_eq!(manager.vector_clock(), [("A", 1), ("B", 2)].into_iter().collect());

        manager.receive(&remote_op(
            "B",
            OperationDraft::insert(0, "z"),
            [("A", 3), ("B", 1)].into_iter().collect(),
            now_millis() + 10_000,
        ));
        assert_eq!(manager.vector_clock(), [("A", 3), ("B", 2)].into_iter().collect());
    }

    #[test]
    fn test_remote_insert_transformed_past_local_inserts() {
        let manager = offline_manager(config("alice"));
        let ops = record(&manager, Topic::Event(CollabEventType::DocumentOperation));

        manager.apply_operation(OperationDraft::insert(5, "abc")).unwrap();
        manager.apply_operation(OperationDraft::insert(5, "def")).unwrap();
        manager.receive(&remote_op(
            "bob",
            OperationDraft::insert(5, "!"),
            VectorClock::new(),
            now_millis() + 10_000,
        ));

        let ops = ops.lock().unwrap();
        match &ops[0] {
            SessionEvent::Remote(CollaborationEvent {
                body: EventBody::DocumentOperation(op),
                ..
            }) => {
                assert_eq!(op.position, 11);
                assert_eq!(op.kind, OperationKind::Insert);
            }
            other => panic!("expected document operation, got {other:?}"),
        }
    }

    #[test]
    fn test_remote_position_at_range_end_does_not_overflow() {
        let manager = offline_manager(config("alice"));
        let ops = record(&manager, Topic::Event(CollabEventType::DocumentOperation));

        manager.apply_operation(OperationDraft::insert(0, "abc")).unwrap();
        manager.receive(&remote_op(
            "bob",
            OperationDraft::insert(usize::MAX, "!"),
            [("alice", u64::MAX)].into_iter().collect(),
            now_millis() + 10_000,
        ));

        assert!(matches!(
            &ops.lock().unwrap()[0],
            SessionEvent::Remote(CollaborationEvent { body: EventBody::DocumentOperation(op), .. })
                if op.position == usize::MAX
        ));
        // The merged clock is already at its ceiling
        manager.apply_operation(OperationDraft::insert(0, "x")).unwrap();
        assert_eq!(manager.vector_clock().get("alice"), u64::MAX);
    }

    #[test]
    fn test_latest_wins_forwards_untransformed() {
        let mut cfg = config("alice");
        cfg.conflict_resolution = ConflictResolution::LatestWins;
        let manager = offline_manager(cfg);
        let ops = record(&manager, Topic::AnyEvent);

        manager.apply_operation(OperationDraft::insert(0, "abc")).unwrap();
        manager.receive(&remote_op(
            "bob",
            OperationDraft::insert(0, "!"),
            [("bob", 1)].into_iter().collect(),
            now_millis() + 10_000,
        ));

        let ops = ops.lock().unwrap();
        assert!(matches!(
            &ops[0],
            SessionEvent::Remote(CollaborationEvent { body: EventBody::DocumentOperation(op), .. })
                if op.position == 0
        ));
        assert_eq!(manager.vector_clock().get("bob"), 1);
    }

    #[test]
    fn test_join_then_leave_retains_participant() {
        let manager = offline_manager(config("alice"));
        manager.receive(&joined("bob"));
        assert!(manager.get_user("bob").unwrap().is_online);

        manager.receive(&remote(
            "bob",
            EventBody::UserLeft(Departure {
                user_id: "bob".into(),
            }),
            2,
        ));
        let bob = manager.get_user("bob").unwrap();
        assert!(!bob.is_online);
        assert_eq!(manager.get_collaboration_users().len(), 1);
    }

    #[test]
    fn test_newcomer_gets_one_reannouncement() {
        let manager = offline_manager(config("alice"));
        lock(&manager.inner.state).lifecycle = Lifecycle::Started;

        manager.receive(&joined("bob"));
        manager.receive(&joined("bob"));
        assert_eq!(queued_types(&manager), vec![CollabEventType::UserJoined]);
        let greeting = &manager.transport().queued()[0];
        assert_eq!(greeting.payload["data"]["userId"], json!("alice"));

        // bob leaves and comes back with an empty roster
        manager.receive(&remote(
            "bob",
            EventBody::UserLeft(Departure {
                user_id: "bob".into(),
            }),
            2,
        ));
        manager.receive(&joined("bob"));
        assert_eq!(manager.transport().queued_len(), 2);

        // Losing the connection also counts as leaving
        manager.inner.on_transport_event(&TransportEvent::UserStatus {
            user_id: "bob".into(),
            online: false,
        });
        manager.receive(&joined("bob"));
        assert_eq!(manager.transport().queued_len(), 3);
    }

    #[test]
    fn test_no_reannouncement_before_start() {
        let manager = offline_manager(config("alice"));
        manager.receive(&joined("bob"));
        assert_eq!(manager.transport().queued_len(), 0);
        assert!(manager.get_user("bob").is_some());
    }

    #[test]
    fn test_presence_events_mutate_participant() {
        let manager = offline_manager(config("alice"));
        manager.receive(&joined("bob"));
        manager.receive(&remote(
            "bob",
            EventBody::CursorMoved(CursorPosition::new(10.0, 20.0)),
            3,
        ));
        manager.receive(&remote(
            "bob",
            EventBody::UserTyping(TypingState {
                is_typing: true,
                comment_id: Some("c1".into()),
            }),
            4,
        ));
        manager.receive(&remote(
            "bob",
            EventBody::SelectionChanged(SelectionRange::new(2.0, 5.0)),
            5,
        ));

        let bob = manager.get_user("bob").unwrap();
        assert_eq!(bob.cursor, Some(CursorPosition::new(10.0, 20.0)));
        assert!(bob.is_typing);
        assert_eq!(bob.selection, Some(SelectionRange::new(2.0, 5.0)));
        assert_eq!(bob.last_seen, 5);
    }

    #[test]
    fn test_self_echo_and_foreign_project_ignored() {
        let manager = offline_manager(config("alice"));
        let events = record(&manager, Topic::AnyEvent);

        manager.receive(&joined("alice"));
        let mut other_project = joined("bob");
        other_project.payload["projectId"] = json!("proj-2");
        manager.receive(&other_project);

        assert!(events.lock().unwrap().is_empty());
        assert!(manager.get_user("bob").is_none());
    }

    #[test]
    fn test_malformed_event_dropped() {
        let manager = offline_manager(config("alice"));
        let events = record(&manager, Topic::AnyEvent);

        let mut bad = joined("bob");
        bad.payload["data"] = json!({ "nonsense": true });
        manager.receive(&bad);
        manager.receive(&Envelope::new(MessageType::CollaborationEvent, json!("text")));

        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_listeners_fan_out_and_off() {
        let manager = offline_manager(config("alice"));
        let a = record(&manager, Topic::Event(CollabEventType::UserJoined));
        let b = record(&manager, Topic::AnyEvent);
        let c = record(&manager, Topic::Event(CollabEventType::CommentAdded));

        manager.receive(&joined("bob"));
        assert_eq!(a.lock().unwrap().len(), 1);
        assert_eq!(b.lock().unwrap().len(), 1);
        assert_eq!(c.lock().unwrap().len(), 0);

        let extra = manager.on(Topic::AnyEvent, |_| {});
        assert!(manager.off(extra));
        assert!(!manager.off(extra));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_typing_is_idempotent() {
        let manager = offline_manager(config("alice"));
        manager.set_typing(true, None).unwrap();
        manager.set_typing(true, None).unwrap();
        assert_eq!(queued_types(&manager), vec![CollabEventType::UserTyping]);
        assert_eq!(manager.pending_timers(), 1);

        manager.set_typing(false, None).unwrap();
        manager.set_typing(false, None).unwrap();
        assert_eq!(manager.transport().queued_len(), 2);
        assert_eq!(manager.pending_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_typing_reverts_after_timeout() {
        let manager = offline_manager(config("alice"));
        manager.set_typing(true, Some("c1")).unwrap();

        tokio::time::sleep(TYPING_TIMEOUT + Duration::from_millis(100)).await;

        let queued = manager.transport().queued();
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[1].payload["data"], json!({ "isTyping": false, "commentId": "c1" }));
        assert_eq!(manager.pending_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_typing_timers_scoped_per_comment() {
        let manager = offline_manager(config("alice"));
        manager.set_typing(true, Some("c1")).unwrap();
        manager.set_typing(true, Some("c2")).unwrap();
        manager.set_typing(true, None).unwrap();
        assert_eq!(manager.pending_timers(), 3);

        manager.set_typing(false, Some("c1")).unwrap();
        assert_eq!(manager.pending_timers(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_typing_disabled_is_noop() {
        let mut cfg = config("alice");
        cfg.enable_typing_indicators = false;
        let manager = offline_manager(cfg);
        manager.set_typing(true, None).unwrap();
        assert_eq!(manager.transport().queued_len(), 0);
        assert_eq!(manager.pending_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_typing_timers() {
        let manager = offline_manager(config("alice"));
        manager.set_typing(true, None).unwrap();
        manager.set_typing(true, Some("c1")).unwrap();
        assert_eq!(manager.pending_timers(), 2);

        manager.stop();
        assert_eq!(manager.pending_timers(), 0);
        assert_eq!(manager.transport().pending_timers(), 0);
        assert_eq!(manager.lifecycle(), Lifecycle::Stopped);

        tokio::time::sleep(TYPING_TIMEOUT * 2).await;
        assert_eq!(manager.transport().queued_len(), 0);
        assert_eq!(manager.start().await, Err(CollabError::SessionStopped));
    }

    #[test]
    fn test_transport_status_updates_roster() {
        let manager = offline_manager(config("alice"));
        let statuses = record(&manager, Topic::UserStatus);
        manager.receive(&joined("bob"));

        manager.inner.on_transport_event(&TransportEvent::UserStatus {
            user_id: "bob".into(),
            online: false,
        });
        assert!(!manager.get_user("bob").unwrap().is_online);
        assert_eq!(statuses.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_provider_routes_by_project() {
        let provider = CollaborationProvider::new(TransportConfig::new("ws://127.0.0.1:9"));
        let first = provider.session(CollabConfig::new("proj-1", "alice", "Alice"));
        let second = provider.session(CollabConfig::new("proj-2", "alice", "Alice"));
        let first_events = record(&first, Topic::AnyEvent);
        let second_events = record(&second, Topic::AnyEvent);

        provider.transport().handle_frame(&joined("bob").encode().unwrap());

        assert_eq!(first_events.lock().unwrap().len(), 1);
        assert_eq!(second_events.lock().unwrap().len(), 0);
        assert_eq!(provider.active_sessions(), 2);
    }

    #[tokio::test]
    async fn test_provider_keeps_transport_until_last_stop() {
        let provider = CollaborationProvider::new(TransportConfig::new("ws://127.0.0.1:9"));
        let first = provider.session(CollabConfig::new("proj-1", "alice", "Alice"));
        let second = provider.session(CollabConfig::new("proj-2", "alice", "Alice"));
        lock(&first.inner.state).lifecycle = Lifecycle::Started;
        lock(&second.inner.state).lifecycle = Lifecycle::Started;

        first.stop();
        assert!(!provider.transport().is_destroyed());
        assert_eq!(provider.active_sessions(), 1);

        second.stop();
        assert!(provider.transport().is_destroyed());
    }
}
