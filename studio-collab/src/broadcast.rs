//! Project rooms for the relay: fan-out to every other connection.
//!
//! Each project gets one tokio broadcast channel; every connection in the
//! room holds its own receiver that buffers up to `capacity` frames.
//! Frames carry the originating connection id so forwarders can skip
//! echoes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// Statistics for monitoring room health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Atomic counters so `broadcast()` never takes a lock.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// One encoded envelope travelling through a room.
#[derive(Debug, Clone)]
pub struct RelayFrame {
    /// Connection that produced the frame; `Uuid::nil()` for the relay itself
    pub origin: Uuid,
    pub text: Arc<str>,
}

impl RelayFrame {
    pub fn new(origin: Uuid, text: impl Into<Arc<str>>) -> Self {
        Self {
            origin,
            text: text.into(),
        }
    }

    /// Frame produced by the relay rather than a peer.
    pub fn from_relay(text: impl Into<Arc<str>>) -> Self {
        Self::new(Uuid::nil(), text)
    }
}

/// A connection inside a room.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayPeer {
    pub connection_id: Uuid,
    /// Set once the connection sends an envelope carrying a userId
    pub user_id: Option<String>,
}

/// Broadcast group for one project room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<RelayFrame>,
    peers: Arc<RwLock<HashMap<Uuid, RelayPeer>>>,
    capacity: usize,
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` is how many frames a slow peer may fall behind before
    /// it starts losing them.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    /// Add an anonymous connection and return its receiver.
    pub async fn add_peer(&self, connection_id: Uuid) -> broadcast::Receiver<RelayFrame> {
        let mut peers = self.peers.write().await;
        peers.insert(
            connection_id,
            RelayPeer {
                connection_id,
                user_id: None,
            },
        );
        self.sender.subscribe()
    }

    /// Attach a user id to a connection.
    ///
    /// Returns `true` when the user was not present in the room through
    /// any connection before.
    pub async fn identify(&self, connection_id: Uuid, user_id: &str) -> bool {
        let mut peers = self.peers.write().await;
        let already_present = peers
            .values()
            .any(|p| p.user_id.as_deref() == Some(user_id));
        match peers.get_mut(&connection_id) {
            Some(peer) => {
                peer.user_id = Some(user_id.to_string());
                !already_present
            }
            None => false,
        }
    }

    pub async fn remove_peer(&self, connection_id: &Uuid) -> Option<RelayPeer> {
        self.peers.write().await.remove(connection_id)
    }

    /// Whether any connection in the room is identified as `user_id`.
    pub async fn is_user_present(&self, user_id: &str) -> bool {
        self.peers
            .read()
            .await
            .values()
            .any(|p| p.user_id.as_deref() == Some(user_id))
    }

    /// Fan a frame out to every receiver (the origin filters itself).
    ///
    /// Returns the number of receivers that got it.
    pub fn broadcast(&self, frame: RelayFrame) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_lagged(&self, skipped: u64) {
        self.stats
            .messages_dropped
            .fetch_add(skipped, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn has_peer(&self, connection_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(connection_id)
    }

    /// Distinct identified users, sorted.
    pub async fn online_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self
            .peers
            .read()
            .await
            .values()
            .filter_map(|p| p.user_id.clone())
            .collect();
        users.sort();
        users.dedup();
        users
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps project ids to broadcast groups.
pub struct RoomManager {
    rooms: Arc<RwLock<HashMap<String, Arc<BroadcastGroup>>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            default_capacity,
        }
    }

    pub async fn get_or_create(&self, project_id: &str) -> Arc<BroadcastGroup> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(project_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Another connection may have created it in between
        if let Some(room) = rooms.get(project_id) {
            return room.clone();
        }
        let room = Arc::new(BroadcastGroup::new(self.default_capacity));
        rooms.insert(project_id.to_string(), room.clone());
        log::debug!("Created room for project {project_id}");
        room
    }

    pub async fn get(&self, project_id: &str) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(project_id).cloned()
    }

    pub async fn remove_if_empty(&self, project_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(project_id) {
            if room.peer_count().await == 0 {
                rooms.remove(project_id);
                log::debug!("Removed empty room for project {project_id}");
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_projects(&self) -> Vec<String> {
        let mut projects: Vec<String> = self.rooms.read().await.keys().cloned().collect();
        projects.sort();
        projects
    }
}
