//! Durable storage for rooms.
//!
//! ```text
//! ┌─────────────┐  snapshot on idle  ┌──────────────────────────────────┐
//! │ RoomHub     │ ─────────────────► │ CF "documents": LZ4 snapshots    │
//! └─────────────┘                    │ CF "rooms"    : room records     │
//! ┌─────────────┐  records           │ CF "members"  : membership rows  │
//! │ Authority   │ ─────────────────► │ CF "invites"  : invite tokens    │
//! └─────────────┘                    └──────────────────────────────────┘
//! ```
//!
//! No operation log is kept: a snapshot written when a room goes idle is
//! enough to rebuild its document.

pub mod rocks;

pub use rocks::{Store, StoreConfig, StoreError};
