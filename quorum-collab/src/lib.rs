//! # quorum-collab: Sync and presence channels for quorum documents
//!
//! Wraps a [`quorum_core::DocumentEngine`] and an [`AwarenessRegistry`]
//! into one [`CollabSession`] per replica and moves their traffic over a
//! byte-oriented pub/sub channel.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐   SyncMessage frames   ┌───────────────┐
//! │ CollabSession │ ◄────────────────────► │ CollabSession │
//! │ (replica A)   │                        │ (replica B)   │
//! └──────┬────────┘                        └──────┬────────┘
//!        │            ┌────────────────┐          │
//!        └──────────► │ BroadcastGroup │ ◄────────┘
//!                     │ (fan-out)      │
//!                     └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: bincode envelope (`SyncMessage`)
//! - [`presence`]: awareness registry, presence messages, colors
//! - [`broadcast`]: in-process fan-out hub
//! - [`session`]: Mutation API, sync handshake, offline queue

pub mod broadcast;
pub mod presence;
pub mod protocol;
pub mod session;

pub use broadcast::{BroadcastGroup, BroadcastStats, Frame};
pub use presence::{
    AwarenessMessage, AwarenessRegistry, ClientId, Presence, PresenceColor, PresenceUpdate,
    PresenceUser,
};
pub use protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};
pub use session::{CollabError, CollabSession, ConnectionState, OfflineQueue, SessionConfig};
