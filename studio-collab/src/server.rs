//! WebSocket relay with project-room routing.
//!
//! ```text
//! Client A ──┐                          ┌──► Client B
//!             ├── Room (projectId) ──────┤
//! Client C ──┘   BroadcastGroup         └──► Client C
//! ```
//!
//! The relay does not interpret collaboration events. It:
//! - joins a connection to every project room it sends an envelope for
//! - forwards text frames verbatim to the other connections in that room
//! - answers heartbeat pings with pongs
//! - emits `connection` notices when a user first appears in a room and
//!   when their last connection there closes
//! - tells a connection joining a room which users are already there

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, RelayFrame, RoomManager};
use crate::protocol::{Envelope, HeartbeatKind, PresenceStatus};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: String,
    /// Frames buffered per connection before a slow peer lags
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            broadcast_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

pub struct RelayServer {
    config: RelayConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(config.broadcast_capacity));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, rooms, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}

/// Per-connection relay state.
struct Connection {
    id: Uuid,
    addr: SocketAddr,
    user_id: Option<String>,
    rooms: HashMap<String, (Arc<BroadcastGroup>, JoinHandle<()>)>,
    outbound: mpsc::UnboundedSender<Arc<str>>,
}

impl Connection {
    async fn handle_text(
        &mut self,
        text: &str,
        ws_sender: &mut WsSink,
        room_manager: &RoomManager,
    ) -> Result<(), BoxError> {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("Skipping malformed frame from {}: {e}", self.addr);
                return Ok(());
            }
        };

        if let Some(kind) = envelope.heartbeat_kind() {
            if kind == HeartbeatKind::Ping {
                let pong = Envelope::heartbeat(HeartbeatKind::Pong).encode()?;
                ws_sender.send(Message::text(pong)).await?;
            }
            return Ok(());
        }

        if self.user_id.is_none() {
            if let Some(user) = &envelope.user_id {
                self.user_id = Some(user.clone());
                log::info!("Connection {} identified as {user}", self.id);
                let rooms: Vec<_> = self.rooms.values().map(|(room, _)| room.clone()).collect();
                for room in rooms {
                    self.announce(&room).await;
                }
            }
        }

        let Some(project_id) = envelope.project_id.as_deref() else {
            log::debug!("Not relaying {} without projectId", envelope.kind);
            return Ok(());
        };
        let room = self.join(project_id, room_manager).await;
        room.broadcast(RelayFrame::new(self.id, text));
        Ok(())
    }

    async fn join(&mut self, project_id: &str, room_manager: &RoomManager) -> Arc<BroadcastGroup> {
        if let Some((room, _)) = self.rooms.get(project_id) {
            return room.clone();
        }

        let room = room_manager.get_or_create(project_id).await;
        let receiver = room.add_peer(self.id).await;
        // Queued ahead of anything the forwarder delivers
        self.greet(&room).await;
        let forwarder = tokio::spawn(forward(
            receiver,
            self.id,
            self.outbound.clone(),
            room.clone(),
        ));
        self.rooms
            .insert(project_id.to_string(), (room.clone(), forwarder));
        log::info!("Connection {} joined project {project_id}", self.id);

        self.announce(&room).await;
        room
    }

    /// Send this connection an `online` notice for every other user
    /// already in the room.
    async fn greet(&self, room: &BroadcastGroup) {
        for user in room.online_users().await {
            if self.user_id.as_deref() == Some(user.as_str()) {
                continue;
            }
            match Envelope::presence(user.as_str(), PresenceStatus::Online).encode() {
                Ok(text) => {
                    let _ = self.outbound.send(text.into());
                }
                Err(e) => log::error!("Failed to encode presence notice for {user}: {e}"),
            }
        }
    }

    /// Tell the room this connection's user is online, if they are new there.
    async fn announce(&self, room: &BroadcastGroup) {
        let Some(user) = &self.user_id else {
            return;
        };
        if room.identify(self.id, user).await {
            broadcast_presence(room, user, PresenceStatus::Online);
        }
    }

    async fn close(self, room_manager: &RoomManager) {
        for (project_id, (room, forwarder)) in self.rooms {
            forwarder.abort();
            room.remove_peer(&self.id).await;
            if let Some(user) = &self.user_id {
                if !room.is_user_present(user).await {
                    broadcast_presence(&room, user, PresenceStatus::Offline);
                }
            }
            room_manager.remove_if_empty(&project_id).await;
        }
    }
}

fn broadcast_presence(room: &BroadcastGroup, user_id: &str, status: PresenceStatus) {
    match Envelope::presence(user_id, status).encode() {
        Ok(text) => {
            room.broadcast(RelayFrame::from_relay(text));
        }
        Err(e) => log::error!("Failed to encode presence notice for {user_id}: {e}"),
    }
}

/// Move room frames onto one connection's outbound queue, skipping its own.
async fn forward(
    mut receiver: broadcast::Receiver<RelayFrame>,
    connection_id: Uuid,
    outbound: mpsc::UnboundedSender<Arc<str>>,
    room: Arc<BroadcastGroup>,
) {
    loop {
        match receiver.recv().await {
            Ok(frame) => {
                if frame.origin == connection_id {
                    continue;
                }
                if outbound.send(frame.text).is_err() {
                    break;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                log::warn!("Connection {connection_id} lagged by {skipped} frames");
                room.record_lagged(skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    room_manager: Arc<RoomManager>,
    stats: Arc<RwLock<RelayStats>>,
) -> Result<(), BoxError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel();

    let mut connection = Connection {
        id: Uuid::new_v4(),
        addr,
        user_id: None,
        rooms: HashMap::new(),
        outbound,
    };
    log::info!("WebSocket connection {} established from {addr}", connection.id);

    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let result: Result<(), BoxError> = async {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                        Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                            Ok(text) => text.to_owned(),
                            Err(_) => {
                                log::warn!("Skipping non-UTF-8 binary frame from {addr}");
                                continue;
                            }
                        },
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        Some(Ok(_)) => continue,
                    };

                    {
                        let mut s = stats.write().await;
                        s.total_messages += 1;
                        s.total_bytes += text.len() as u64;
                    }
                    connection
                        .handle_text(&text, &mut ws_sender, &room_manager)
                        .await?;
                }

                Some(text) = outbound_rx.recv() => {
                    ws_sender.send(Message::text(text.to_string())).await?;
                }
            }
        }
        Ok(())
    }
    .await;

    connection.close(&room_manager).await;
    let active_rooms = room_manager.room_count().await;
    {
        let mut s = stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        s.active_rooms = active_rooms;
    }
    result
}
