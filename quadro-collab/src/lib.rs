//! # quadro-collab — Real-time sync engine for the quadro task board
//!
//! Many clients edit the same Kanban board at once — creating, moving,
//! reordering, and deleting lists and cards — and every participant
//! observes the same canonical event stream, live.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ BoardClient │ ◄─────────────────► │ CollabServer│
//! │ (per user)  │    Binary Proto     │ (authority) │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                        ┌───────────────────┼────────────────────┐
//!                        ▼                   ▼                    ▼
//!                ┌───────────────┐   ┌──────────────┐    ┌───────────────┐
//!                │SessionRegistry│   │  Reconciler  │───►│  RecordStore  │
//!                │ (presence)    │   │ (per-board   │    │ (CRUD + order)│
//!                └───────┬───────┘   │  serialized) │    └───────────────┘
//!                        │           └──────┬───────┘
//!                        └────────┬─────────┘
//!                                 ▼
//!                          ┌──────────────┐
//!                          │ BoardChannel │  publish order = delivery
//!                          │ (fan-out)    │  order, for every client
//!                          └──────────────┘
//! ```
//!
//! Ordering comes from two mechanisms working together: a per-board mutex
//! serializes mutations (arrival order, no read-modify-write races), and
//! position keys let any item land between two siblings without touching a
//! third record. Conflicting concurrent moves resolve last-intent-wins;
//! stale field edits are rejected back to their originator with the
//! canonical snapshot attached.
//!
//! ## Modules
//!
//! - [`protocol`] — binary wire protocol (bincode-encoded frames)
//! - [`registry`] — per-board participants, editing locks, typing flags
//! - [`broadcast`] — per-board fan-out with backpressure
//! - [`reconciler`] — validation, conflict resolution, canonical events
//! - [`server`] — WebSocket server and connection lifecycle
//! - [`client`] — WebSocket client with typed intents
//!
//! The registry and channels are process-local: one authoritative process
//! per board. Fanning a board out across multiple instances needs an
//! external broadcast layer in front of this engine.

pub mod broadcast;
pub mod client;
pub mod protocol;
pub mod reconciler;
pub mod registry;
pub mod server;

// Re-exports for convenience
pub use broadcast::{BoardChannel, ChannelMap, ChannelStats, EventFrame};
pub use client::{BoardClient, ClientEvent, ClientState};
pub use protocol::{
    ClientFrame, ConnectionId, EntitySnapshot, MutationIntent, Participant, Presence,
    PresenceDelta, ProtocolError, ServerEvent, ServerFrame, WireError,
};
pub use reconciler::{Reconciler, SyncError};
pub use registry::SessionRegistry;
pub use server::{Authenticator, CollabServer, OpenAccess, ServerConfig, ServerStats};
