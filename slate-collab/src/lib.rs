//! # slate-collab: Real-time collaboration engine for Slate whiteboards
//!
//! Members join a whiteboard room over WebSocket, see each other's cursors,
//! and create, update and delete canvas objects. Every mutation is applied
//! to the stored document before it is fanned out to the rest of the room.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐    WebSocket     ┌──────────────────┐
//! │ WhiteboardClient │ ◄──────────────► │ SyncServer       │
//! │ (per user)       │    JSON frames   │ (per connection) │
//! └──────────────────┘                  └────────┬─────────┘
//!                                                │
//!                                                ▼
//!                     ┌──────────┐      ┌──────────────────┐     ┌───────────────┐
//!                     │ AuthGate │ ◄─── │ ObjectSyncEngine │ ──► │ DocumentStore │
//!                     └──────────┘      └────────┬─────────┘     └───────────────┘
//!                                                │
//!                                       ┌────────┴─────────┐
//!                                       │ RoomRegistry     │
//!                                       │ PresenceTracker  │
//!                                       │ Broadcast (fan)  │
//!                                       └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire protocol (client envelopes, server messages)
//! - [`document`]: Canvas objects, patches and the versioned document
//! - [`presence`]: Cursor positions and color assignment
//! - [`broadcast`]: Per-connection outbound queues and room fan-out
//! - [`room`]: Active rooms, memberships and per-room write locks
//! - [`sync`]: Per-connection state machine and mutation pipeline
//! - [`auth`]: Credential verification (HS256 tokens)
//! - [`storage`]: Document store trait with in-memory and RocksDB backends
//! - [`server`]: WebSocket server
//! - [`client`]: WebSocket client

pub mod auth;
pub mod broadcast;
pub mod client;
pub mod document;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod room;
pub mod server;
pub mod storage;
pub mod sync;

// Re-exports for convenience
pub use auth::{AuthError, AuthGate, TokenAuth};
pub use broadcast::{BroadcastDispatcher, BroadcastStats, ConnectionHandle, ConnectionId};
pub use client::{ConnectionState, SyncEvent, WhiteboardClient};
pub use document::{CanvasObject, Document, ObjectKind, ObjectPatch, ObjectStyle, Whiteboard};
pub use error::CollabError;
pub use presence::{Presence, PresenceTracker, Vec2, PALETTE};
pub use protocol::{ClientMessage, Envelope, MessageType, ProtocolError, ServerMessage};
pub use room::{Membership, RoomRegistry};
pub use server::{ServerConfig, ServerError, ServerStats, SyncServer};
pub use storage::{
    DocumentStore, Member, MemoryStore, PermissionLevel, RocksStore, StoreConfig, StoreError,
    WhiteboardMetadata,
};
pub use sync::{EngineOptions, EngineStats, ObjectSyncEngine, Session, SessionState};
