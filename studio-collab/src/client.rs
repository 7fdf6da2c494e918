//! WebSocket transport client.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, automatic reconnect)
//! - Exponential reconnect backoff, capped at 30s
//! - Heartbeat pings while connected
//! - Bounded offline queue (drop-oldest), flushed in order on connect
//! - Inbound validation, per-sender sequence dedup, typed dispatch
//!
//! Listener registration is single-slot: [`TransportClient::on`] replaces
//! whatever listener was registered for that event kind.
//!
//! ```text
//!            send()                                  reader task
//!              │                                          │
//!   connected? ├── yes ──► outgoing channel ──► writer ──► socket
//!              └── no ───► OfflineQueue ──(flush on connect)──┘
//! ```

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::TransportConfig;
use crate::lock;
use crate::protocol::{
    now_millis, Envelope, HeartbeatKind, MessageType, PresenceStatus, ProtocolError, SendOptions,
    StreamKey,
};
use crate::timers::TimerSet;

/// Upper bound on the reconnect delay.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

const RECONNECT_TIMER: &str = "reconnect";
const HEARTBEAT_TIMER: &str = "heartbeat";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    /// Reconnect attempts exhausted; only a manual `connect()` resumes
    Failed,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("transport client has been destroyed")]
    ClientDestroyed,
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("socket error: {0}")]
    Socket(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Events delivered to transport listeners.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    ConnectionChanged(ConnectionState),
    /// Any inbound envelope that is not heartbeat or connection bookkeeping
    Message(Envelope),
    UserStatus { user_id: String, online: bool },
    Error(TransportError),
    ReconnectAttempt { attempt: u32, delay: Duration },
}

impl TransportEvent {
    pub fn kind(&self) -> TransportEventKind {
        match self {
            TransportEvent::ConnectionChanged(_) => TransportEventKind::ConnectionChange,
            TransportEvent::Message(_) => TransportEventKind::Message,
            TransportEvent::UserStatus { .. } => TransportEventKind::UserStatus,
            TransportEvent::Error(_) => TransportEventKind::Error,
            TransportEvent::ReconnectAttempt { .. } => TransportEventKind::ReconnectAttempt,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportEventKind {
    ConnectionChange,
    Message,
    UserStatus,
    Error,
    ReconnectAttempt,
}

pub type TransportListener = Arc<dyn Fn(&TransportEvent) + Send + Sync>;

/// Delay before reconnect attempt `attempt` (1-based).
pub fn reconnect_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(MAX_RECONNECT_DELAY)
}

/// Envelopes waiting for a connection.
///
/// When full, the oldest entry is evicted so the newest messages survive
/// a long outage.
pub struct OfflineQueue {
    queue: VecDeque<Envelope>,
    max_size: usize,
}

impl OfflineQueue {
    /// Create a new offline queue with max capacity.
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size: max_size.max(1),
        }
    }

    /// Queue an envelope, returning the evicted one if the queue was full.
    pub fn enqueue(&mut self, envelope: Envelope) -> Option<Envelope> {
        let evicted = if self.queue.len() >= self.max_size {
            self.queue.pop_front()
        } else {
            None
        };
        self.queue.push_back(envelope);
        evicted
    }

    /// Drain all queued envelopes, oldest first.
    pub fn drain(&mut self) -> Vec<Envelope> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn snapshot(&self) -> Vec<Envelope> {
        self.queue.iter().cloned().collect()
    }
}

struct ClientState {
    connection: ConnectionState,
    destroyed: bool,
    next_sequence: u64,
    queue: OfflineQueue,
    outgoing: Option<mpsc::UnboundedSender<Message>>,
    /// Bumped per opened socket so stale reader tasks are ignored
    generation: u64,
    reconnect_attempts: u32,
    last_sequence: HashMap<StreamKey, u64>,
    online_users: HashSet<String>,
}

struct Inner {
    config: TransportConfig,
    /// Stamped as `senderId` so peers keep one sequence stream per client
    instance_id: String,
    state: Mutex<ClientState>,
    listeners: Mutex<HashMap<TransportEventKind, TransportListener>>,
    timers: TimerSet,
}

/// The transport client.
///
/// Cheap to clone; clones share one connection. Construct one per
/// process and pass it to every collaboration session.
#[derive(Clone)]
pub struct TransportClient {
    inner: Arc<Inner>,
}

impl TransportClient {
    pub fn new(config: TransportConfig) -> Self {
        let queue = OfflineQueue::new(config.message_queue_size);
        Self {
            inner: Arc::new(Inner {
                config,
                instance_id: uuid::Uuid::new_v4().to_string(),
                state: Mutex::new(ClientState {
                    connection: ConnectionState::Disconnected,
                    destroyed: false,
                    next_sequence: 0,
                    queue,
                    outgoing: None,
                    generation: 0,
                    reconnect_attempts: 0,
                    last_sequence: HashMap::new(),
                    online_users: HashSet::new(),
                }),
                listeners: Mutex::new(HashMap::new()),
                timers: TimerSet::new(),
            }),
        }
    }

    /// Open the connection.
    ///
    /// Returns immediately when already connected or connecting. A failed
    /// open is not retried automatically; automatic retries only follow
    /// the loss of an established connection.
    pub async fn connect(&self) -> Result<(), TransportError> {
        {
            let mut state = lock(&self.inner.state);
            if state.destroyed {
                return Err(TransportError::ClientDestroyed);
            }
            if matches!(
                state.connection,
                ConnectionState::Connected | ConnectionState::Connecting
            ) {
                return Ok(());
            }
            state.connection = ConnectionState::Connecting;
        }
        self.inner.timers.cancel(RECONNECT_TIMER);
        self.inner
            .emit(TransportEvent::ConnectionChanged(ConnectionState::Connecting));

        match self.inner.open().await {
            Ok(()) => Ok(()),
            Err(TransportError::ClientDestroyed) => Err(TransportError::ClientDestroyed),
            Err(e) => {
                {
                    let mut state = lock(&self.inner.state);
                    state.connection = ConnectionState::Disconnected;
                    state.reconnect_attempts = 0;
                }
                log::warn!("Connection to {} failed: {e}", self.inner.config.url);
                self.inner
                    .emit(TransportEvent::ConnectionChanged(ConnectionState::Disconnected));
                Err(e)
            }
        }
    }

    /// Tear the client down for good.
    ///
    /// Cancels every timer, closes the socket with a normal close code and
    /// discards queued envelopes. Later `connect()` calls fail with
    /// [`TransportError::ClientDestroyed`].
    pub fn disconnect(&self) {
        let (outgoing, previous) = {
            let mut state = lock(&self.inner.state);
            state.destroyed = true;
            let previous = state.connection;
            state.connection = ConnectionState::Disconnected;
            state.queue.clear();
            (state.outgoing.take(), previous)
        };
        let cancelled = self.inner.timers.clear();

        if let Some(tx) = outgoing {
            let _ = tx.send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: Utf8Bytes::from_static("client disconnect"),
            })));
        }

        log::info!("Transport destroyed ({cancelled} timers cancelled)");
        if previous != ConnectionState::Disconnected {
            self.inner
                .emit(TransportEvent::ConnectionChanged(ConnectionState::Disconnected));
        }
    }

    /// Send an envelope, or queue it while disconnected.
    ///
    /// Returns the envelope id immediately; delivery is not confirmed.
    pub fn send(
        &self,
        kind: MessageType,
        payload: serde_json::Value,
        options: SendOptions,
    ) -> String {
        let mut state = lock(&self.inner.state);
        state.next_sequence += 1;

        let mut envelope = Envelope::new(kind, payload);
        envelope.user_id = options.user_id;
        envelope.project_id = options.project_id;
        envelope.sequence_number = Some(state.next_sequence);
        envelope.sender_id = Some(self.inner.instance_id.clone());
        let id = envelope.id.clone();

        if state.destroyed {
            log::warn!("Dropping {kind} message {id}: transport destroyed");
            return id;
        }

        if state.connection == ConnectionState::Connected {
            if let Some(tx) = &state.outgoing {
                match envelope.encode() {
                    Ok(text) => {
                        if tx.send(Message::text(text)).is_ok() {
                            return id;
                        }
                    }
                    Err(e) => {
                        log::error!("Failed to encode {kind} message {id}: {e}");
                        return id;
                    }
                }
            }
        }

        log::debug!("Queueing {kind} message {id} while {:?}", state.connection);
        if let Some(evicted) = state.queue.enqueue(envelope) {
            log::debug!("Offline queue full, evicted message {}", evicted.id);
        }
        id
    }

    /// Register the listener for `kind`, replacing any previous one.
    ///
    /// Returns `true` if a listener was replaced.
    pub fn on<F>(&self, kind: TransportEventKind, listener: F) -> bool
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        lock(&self.inner.listeners)
            .insert(kind, Arc::new(listener))
            .is_some()
    }

    /// Remove the listener for `kind`.
    pub fn off(&self, kind: TransportEventKind) -> bool {
        lock(&self.inner.listeners).remove(&kind).is_some()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// The `senderId` this client stamps on outbound envelopes.
    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn connection_state(&self) -> ConnectionState {
        lock(&self.inner.state).connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    pub fn is_destroyed(&self) -> bool {
        lock(&self.inner.state).destroyed
    }

    pub fn queued_len(&self) -> usize {
        lock(&self.inner.state).queue.len()
    }

    /// Snapshot of queued envelopes, oldest first.
    pub fn queued(&self) -> Vec<Envelope> {
        lock(&self.inner.state).queue.snapshot()
    }

    /// Users reported online by `connection` notices.
    pub fn online_users(&self) -> Vec<String> {
        let mut users: Vec<_> = lock(&self.inner.state).online_users.iter().cloned().collect();
        users.sort();
        users
    }

    pub fn reconnect_attempts(&self) -> u32 {
        lock(&self.inner.state).reconnect_attempts
    }

    /// Reconnect and heartbeat timers still scheduled.
    pub fn pending_timers(&self) -> usize {
        self.inner.timers.pending()
    }

    /// Process one inbound text frame as if it arrived on the socket.
    pub fn handle_frame(&self, text: &str) {
        self.inner.handle_inbound(text);
    }
}

impl Inner {
    fn emit(&self, event: TransportEvent) {
        let listener = lock(&self.listeners).get(&event.kind()).cloned();
        if let Some(listener) = listener {
            listener(&event);
        }
    }

    /// Dial the socket and install reader/writer tasks.
    async fn open(self: &Arc<Self>) -> Result<(), TransportError> {
        let (socket, _) = tokio_tungstenite::connect_async(self.config.url.as_str())
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let (mut sink, reader) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        let (generation, flushed) = {
            let mut state = lock(&self.state);
            if state.destroyed {
                return Err(TransportError::ClientDestroyed);
            }
            if state.connection == ConnectionState::Connected {
                // A concurrent open won; drop this socket.
                return Ok(());
            }
            state.generation += 1;
            state.connection = ConnectionState::Connected;
            state.reconnect_attempts = 0;

            let queued = state.queue.drain();
            let flushed = queued.len();
            for envelope in queued {
                match envelope.encode() {
                    Ok(text) => {
                        let _ = tx.send(Message::text(text));
                    }
                    Err(e) => log::error!("Dropping queued message {}: {e}", envelope.id),
                }
            }
            state.outgoing = Some(tx);
            (state.generation, flushed)
        };
        self.timers.cancel(RECONNECT_TIMER);

        // Writer task: forward outgoing channel to the socket
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if sink.send(message).await.is_err() || closing {
                    break;
                }
            }
        });

        tokio::spawn(read_loop(Arc::downgrade(self), reader, generation));
        if !self.arm_heartbeat(generation) {
            let destroyed = lock(&self.state).destroyed;
            log::debug!("Connection to {} ended before it settled", self.config.url);
            return if destroyed {
                Err(TransportError::ClientDestroyed)
            } else {
                Ok(())
            };
        }

        log::info!(
            "Connected to {} (flushed {flushed} queued messages)",
            self.config.url
        );
        self.emit(TransportEvent::ConnectionChanged(ConnectionState::Connected));
        Ok(())
    }

    /// Start heartbeats for socket `generation` if it is still the live,
    /// connected one. The check and the registration share the state lock,
    /// so a concurrent `disconnect` either sees the timer or prevents it.
    fn arm_heartbeat(self: &Arc<Self>, generation: u64) -> bool {
        let state = lock(&self.state);
        if state.destroyed
            || state.generation != generation
            || state.connection != ConnectionState::Connected
        {
            return false;
        }
        self.start_heartbeat();
        true
    }

    fn start_heartbeat(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.timers
            .repeat(HEARTBEAT_TIMER, self.config.heartbeat_interval, move || {
                weak.upgrade()
                    .map_or(false, |inner| inner.send_heartbeat(HeartbeatKind::Ping))
            });
    }

    /// Send a heartbeat if connected. Heartbeats are never queued.
    fn send_heartbeat(&self, kind: HeartbeatKind) -> bool {
        let state = lock(&self.state);
        let Some(tx) = state.outgoing.as_ref() else {
            return false;
        };
        match Envelope::heartbeat(kind).encode() {
            Ok(text) => tx.send(Message::text(text)).is_ok(),
            Err(_) => false,
        }
    }

    fn handle_inbound(&self, text: &str) {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("Dropping malformed inbound frame: {e}");
                self.emit(TransportEvent::Error(e.into()));
                return;
            }
        };

        if let Some(sequence) = envelope.sequence_number {
            let mut state = lock(&self.state);
            let key = envelope.stream_key();
            match state.last_sequence.get(&key).copied() {
                Some(last) if sequence <= last => {
                    log::trace!(
                        "Dropping stale message {} from {key} (seq {sequence} <= {last})",
                        envelope.id
                    );
                    return;
                }
                _ => {
                    state.last_sequence.insert(key, sequence);
                }
            }
        }

        match envelope.kind {
            MessageType::Heartbeat => {
                if envelope.heartbeat_kind() == Some(HeartbeatKind::Ping) {
                    self.send_heartbeat(HeartbeatKind::Pong);
                }
            }
            MessageType::Connection => self.apply_presence(&envelope),
            _ => self.emit(TransportEvent::Message(envelope)),
        }
    }

    fn apply_presence(&self, envelope: &Envelope) {
        let notice = match envelope.presence_notice() {
            Ok(notice) => notice,
            Err(e) => {
                log::warn!("Dropping connection notice {}: {e}", envelope.id);
                self.emit(TransportEvent::Error(e.into()));
                return;
            }
        };
        let online = notice.status == PresenceStatus::Online;
        {
            let mut state = lock(&self.state);
            if online {
                state.online_users.insert(notice.user_id.clone());
                // A returning peer restarts its sequence numbering.
                state
                    .last_sequence
                    .retain(|key, _| key.user_id != notice.user_id);
            } else {
                state.online_users.remove(&notice.user_id);
            }
        }
        log::debug!("User {} is now {:?}", notice.user_id, notice.status);
        self.emit(TransportEvent::UserStatus {
            user_id: notice.user_id,
            online,
        });
    }

    fn handle_close(self: &Arc<Self>, generation: u64, normal: bool) {
        {
            let mut state = lock(&self.state);
            if state.generation != generation || state.destroyed {
                return;
            }
            state.outgoing = None;
            if normal {
                state.connection = ConnectionState::Disconnected;
            }
        }
        self.timers.cancel(HEARTBEAT_TIMER);

        if normal {
            log::info!("Connection to {} closed normally", self.config.url);
            self.emit(TransportEvent::ConnectionChanged(ConnectionState::Disconnected));
        } else {
            log::info!("Connection to {} lost", self.config.url);
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let next = {
            let mut state = lock(&self.state);
            if state.destroyed {
                return;
            }
            state.reconnect_attempts += 1;
            if state.reconnect_attempts > self.config.max_reconnect_attempts {
                state.connection = ConnectionState::Failed;
                None
            } else {
                state.connection = ConnectionState::Reconnecting;
                let attempt = state.reconnect_attempts;
                Some((attempt, reconnect_delay(self.config.reconnect_interval, attempt)))
            }
        };

        let Some((attempt, delay)) = next else {
            log::error!(
                "Giving up on {} after {} reconnect attempts",
                self.config.url,
                self.config.max_reconnect_attempts
            );
            self.emit(TransportEvent::ConnectionChanged(ConnectionState::Failed));
            return;
        };

        log::info!("Reconnect attempt {attempt} in {delay:?}");
        self.emit(TransportEvent::ConnectionChanged(ConnectionState::Reconnecting));
        self.emit(TransportEvent::ReconnectAttempt { attempt, delay });

        let weak = Arc::downgrade(self);
        self.timers.schedule(RECONNECT_TIMER, delay, async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match inner.open().await {
                Ok(()) | Err(TransportError::ClientDestroyed) => {}
                Err(e) => {
                    log::warn!("Reconnect attempt {attempt} failed: {e}");
                    inner.emit(TransportEvent::Error(e));
                    inner.schedule_reconnect();
                }
            }
        });
    }
}

/// Reader task: dispatch inbound frames until the socket closes.
async fn read_loop(weak: Weak<Inner>, mut reader: SplitStream<Socket>, generation: u64) {
    let mut normal = false;
    while let Some(frame) = reader.next().await {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        match frame {
            Ok(Message::Text(text)) => inner.handle_inbound(text.as_str()),
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => inner.handle_inbound(text),
                Err(_) => {
                    log::warn!("Dropping non UTF-8 binary frame");
                    inner.emit(TransportEvent::Error(ProtocolError::InvalidUtf8.into()));
                }
            },
            Ok(Message::Close(frame)) => {
                normal = frame.is_some_and(|f| f.code == CloseCode::Normal);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if !lock(&inner.state).destroyed {
                    inner.emit(TransportEvent::Error(TransportError::Socket(e.to_string())));
                }
                break;
            }
        }
    }
    if let Some(inner) = weak.upgrade() {
        inner.handle_close(generation, normal);
    }
}
