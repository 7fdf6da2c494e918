//! # studio-collab: Real-time review collaboration
//!
//! Live presence, threaded comments and concurrent edits for video
//! review projects, carried as JSON envelopes over a reconnecting
//! WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐                    ┌───────────────┐
//! │ CollaborationManager │  (one per project) │ RelayServer   │
//! └──────────┬───────────┘                    │ (fan-out)     │
//!            │ send / on                      └───────┬───────┘
//!            ▼                                        │
//! ┌──────────────────────┐     WebSocket      ┌───────┴───────┐
//! │ TransportClient      │ ◄────────────────► │ RoomManager   │
//! │ (queue, heartbeat,   │    JSON envelope   │ (per project) │
//! │  reconnect, dedup)   │                    └───────────────┘
//! └──────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Envelope wire format and payload types
//! - [`config`]: Transport and session configuration
//! - [`client`]: Reconnecting transport client with offline queue
//! - [`collab`]: Collaboration sessions and the shared-transport provider
//! - [`events`]: Collaboration event types and their data
//! - [`presence`]: Participant roster, cursors and selections
//! - [`ot`]: Vector clocks, edit operations and the position transform
//! - [`timers`]: Keyed, cancellable timers
//! - [`broadcast`]: Project rooms for the relay
//! - [`server`]: WebSocket relay server

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod broadcast;
pub mod client;
pub mod collab;
pub mod config;
pub mod events;
pub mod ot;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod timers;

// Re-exports for convenience
pub use client::{
    ConnectionState, OfflineQueue, TransportClient, TransportError, TransportEvent,
    TransportEventKind,
};
pub use collab::{
    CollabError, CollaborationManager, CollaborationProvider, Lifecycle, ListenerId,
    SessionEvent, Topic,
};
pub use config::{CollabConfig, ConfigError, ConflictResolution, TransportConfig};
pub use events::{CollabEventType, CollaborationEvent, Comment, CommentDraft, EventBody};
pub use ot::{EditOperation, OperationDraft, OperationKind, VectorClock};
pub use presence::{CursorPosition, Participant, ParticipantProfile, SelectionRange};
pub use protocol::{Envelope, MessageType, ProtocolError, SendOptions};
pub use server::{RelayConfig, RelayServer, RelayStats};

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
