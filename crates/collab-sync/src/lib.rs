//! # collab-sync
//!
//! Server-side synchronization core for collaborative document editing.
//!
//! Clients exchange opaque CRDT update blobs over WebSocket. The server keeps
//! an ordered per-document operation log with client-authored snapshots,
//! tracks which connection is in which document, fans updates out to the
//! other members of a room, and enforces access, rate limits, message size
//! and connection liveness. It never interprets document content.

pub mod access;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod gateway;
pub mod heartbeat;
pub mod protocol;
pub mod ratelimit;
pub mod registry;
pub mod session;
pub mod store;

#[cfg(feature = "persistence")]
pub mod persistence;

#[cfg(feature = "axum")]
pub mod axum;

// Re-exports for convenience
pub use access::{
    AccessResolver, Identity, IdentityVerifier, Role, StaticAccessResolver,
    StaticIdentityVerifier, StaticUserDirectory, UserDirectory, UserProfile,
};
pub use broadcast::{BroadcastReport, Broadcaster};
pub use config::{RateLimit, SyncConfig};
pub use error::{DeliveryError, SyncError, SyncResult, ValidationCode};
pub use gateway::{EndpointHandle, LocalPushGateway, PushGateway};
pub use heartbeat::{HeartbeatMonitor, SweepReport};
pub use protocol::{ActionType, ClientMessage, PresenceAction, ServerMessage};
pub use ratelimit::RateLimiter;
pub use registry::{Connection, ConnectionRegistry, MemoryConnectionRegistry};
pub use session::{Backends, Session, SessionState, SyncEngine};
pub use store::{MemoryOperationStore, Operation, OperationStore, Snapshot, SnapshotCadence};

#[cfg(feature = "axum")]
pub use crate::axum::{router_with_sync, SyncState, WebSocketHandler};

#[cfg(feature = "persistence")]
pub use persistence::PersistenceManager;
