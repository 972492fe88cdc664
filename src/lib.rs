//! # cowrite — real-time collaborative plain-text editing
//!
//! Multiple participants connect to a named room and edit one shared text
//! document. Edits converge through a character-level operation CRDT
//! (a Replicated Growable Array); the server is an event-log relay that
//! appends, fans out, persists, compacts, and expires.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   JSON over WS     ┌─────────────┐
//! │ RoomClient  │ ◄─────────────────► │ Session task│
//! │ (per user)  │                     └──────┬──────┘
//! └──────┬──────┘                            │
//!        │                            ┌──────┴──────┐
//! ┌──────┴──────┐                     │ Mutex<Room> │  per-room total order
//! │ Replica     │                     │  RoomLog    │
//! │ (local RGA) │                     │  Replica    │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ RoomRegistry  │── sweeper task
//!                                    │ SnapshotStore │── {roomId}.gz
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`crdt`] — the replica: positional edits in, ordered events out
//! - [`protocol`] — JSON envelope and bootstrap payloads
//! - [`room`] — event log, sessions, presence, fan-out, compaction
//! - [`registry`] — room directory, creation, sweeper
//! - [`storage`] — gzip snapshots, one file per room
//! - [`server`] — axum HTTP surface and WebSocket sessions
//! - [`client`] — client-side session loop
//! - [`config`] — settings and environment overrides

pub mod client;
pub mod config;
pub mod crdt;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod server;
pub mod storage;

pub use client::{ClientError, ClientEvent, RoomClient};
pub use config::Settings;
pub use crdt::{CrdtError, CrdtEvent, GlobalId, Replica, TextUpdate};
pub use protocol::{
    ClientMessage, ProtocolError, RoomCreated, RoomSettings, RoomSnapshot, ServerMessage,
    SitePresence,
};
pub use registry::{RegistryError, RegistryStats, RoomRegistry, SharedRoom};
pub use room::{Room, RoomError, RoomLimits, RoomLog};
pub use server::AppState;
pub use storage::{PersistedRoom, SnapshotStore, StorageError};
