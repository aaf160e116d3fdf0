//! # flowdraft-collab: real-time collaboration for workflow drafts
//!
//! One authoritative edit session per workflow orders every operation,
//! stamps it with a sequence number and fans it out to all editors.
//! Editors keep an optimistic replica that rebases pending edits on top
//! of what the server confirmed.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per tab)   │     JSON frames     │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐      ┌────────────┐
//! │ Replica     │                     │ EditSession │ ───► │ DraftStore │
//! │ (optimistic)│                     │ (per flow)  │      │ snapshot + │
//! └─────────────┘                     └──────┬──────┘      │ op log     │
//!                                            │             └────────────┘
//!                                    ┌───────┴───────┐
//!                                    │ BroadcastGroup│ ◄── PresenceTracker
//!                                    │ (per topic)   │ ◄── ExecutionPublisher
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire protocol (`ClientMessage` / `ServerMessage`)
//! - [`broadcast`]: Topic fan-out with backpressure
//! - [`session`]: Single-writer edit session per workflow
//! - [`presence`]: Per-connection presence and the refetching client view
//! - [`projector`]: Execution event projection for the live board
//! - [`replica`]: Client-side optimistic draft
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket sync client with offline queue
//! - [`storage`]: Snapshot and operation log persistence

pub mod broadcast;
pub mod client;
pub mod presence;
pub mod projector;
pub mod protocol;
pub mod replica;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomManager, Topic};
pub use client::{ClientError, ClientState, ConnectionState, OfflineQueue, SyncClient, SyncEvent};
pub use presence::{
    ConnRef, Cursor, PresenceDiff, PresenceEntry, PresenceList, PresenceMeta, PresenceTracker,
    PresenceView, UserColor, UserInfo,
};
pub use projector::{
    ExecutionEvent, ExecutionProjector, ExecutionPublisher, ExecutionSnapshot, ExecutionStatus, StepExecutionState,
    StepStatus,
};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
pub use replica::{Replica, ReplicaAction};
pub use server::{ConfigError, ServerConfig, ServerError, ServerStats, SyncServer};
pub use session::{
    PersistOutcome, SessionConfig, SessionError, SessionHandle, SessionRegistry, SessionStats, SyncState,
};
pub use storage::{
    DraftMetadata, DraftSnapshot, DraftStore, MemoryDraftStore, RocksDraftStore, StoreConfig, StoreError,
};
