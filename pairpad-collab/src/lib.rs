//! # pairpad-collab: collaborative session engine for Pairpad rooms
//!
//! Every room holds one shared code buffer plus a chat log, edited
//! concurrently by everyone connected to it, with live presence.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │ ───► │ HubRegistry │
//! │ (replica)   │     Binary Proto    │ (transport) │      │ room → hub  │
//! └─────────────┘                     └─────────────┘      └──────┬──────┘
//!                                                                 │
//!                           ┌─────────────────────────────────────┤
//!                           ▼                                     ▼
//!                    ┌─────────────┐  snapshot on idle     ┌─────────────┐
//!                    │ RoomHub     │ ────────────────────► │ Store       │
//!                    │ doc+presence│                       │ (RocksDB)   │
//!                    └─────────────┘                       └──────▲──────┘
//!                                                                 │
//! ┌─────────────┐       HTTP/JSON       ┌─────────────────────┐   │
//! │ Frontend    │ ◄───────────────────► │ api → Authority     │ ──┘
//! └─────────────┘                       │ rooms/members/invite│
//!                                       └─────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`document`]: CRDT document (code text + chat sequence) on yrs
//! - [`awareness`]: ephemeral presence with heartbeat eviction
//! - [`protocol`]: binary wire protocol (bincode-encoded SyncMessage)
//! - [`broadcast`]: per-room fan-out with bounded per-connection queues
//! - [`hub`]: room hubs and the registry owning their lifecycle
//! - [`server`]: WebSocket transport
//! - [`client`]: WebSocket client holding a local replica
//! - [`storage`]: RocksDB persistence for snapshots and records
//! - [`authority`]: room membership, admin rule and invites
//! - [`api`]: REST surface over the authority
//! - [`mail`]: invite email delivery seam

pub mod api;
pub mod authority;
pub mod awareness;
pub mod broadcast;
pub mod client;
pub mod document;
pub mod error;
pub mod hub;
pub mod mail;
pub mod model;
pub mod protocol;
pub mod server;
pub mod storage;
mod update_shape;

// Re-exports for convenience
pub use api::{ApiConfig, AppState};
pub use authority::{is_admin_of, AuthorityConfig, InviteOutcome, MembershipAuthority};
pub use awareness::{color_for, AwarenessEntry, AwarenessState, AwarenessTable, CursorRange};
pub use broadcast::{BroadcastGroup, BroadcastStats, RecvError, Subscriber};
pub use client::{ConnectionState, SyncClient, SyncEvent};
pub use document::{ChatMessage, DocumentError, Operation, ReplicatedDocument};
pub use error::{CollabError, Result};
pub use hub::{Attachment, HubConfig, HubMetrics, HubPhase, HubRegistry, RoomHub};
pub use mail::{InviteEmail, InviteMailer, MailError, UnconfiguredMailer};
pub use model::{Identity, Invite, Language, Role, Room, RoomMember};
pub use protocol::{MessageType, ProtocolError, SyncMessage};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use storage::{Store, StoreConfig, StoreError};
