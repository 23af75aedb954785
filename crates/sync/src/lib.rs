//! Realtime collaborative-editing synchronization layer
//!
//! Keeps a shared, conflict-free replicated document (and ephemeral
//! per-user presence state) consistent across any number of concurrently
//! connected peers, using only a best-effort publish/subscribe broadcast
//! channel as transport.
//!
//! The merge itself is delegated to y-crdt: updates commute and are
//! idempotent, so no ordering or deduplication logic lives here. This
//! crate owns the wiring: forwarding local changes outward, applying
//! inbound changes, the bootstrap handshake for late joiners, debounced
//! presence broadcasting, and teardown discipline.

// Transport abstraction (in-memory broadcast hub)
pub mod channel;

// Tunables
pub mod config;

// Protocol wiring per document/presence pair
pub mod coordinator;

// Replicated document wrapper
pub mod document;

// Ephemeral per-client presence
pub mod presence;

// Composition & lifecycle
pub mod session;

pub use channel::{BroadcastChannel, ChannelHub, ChannelStatus, ChannelSubscription, Envelope};
pub use collab_protocol::{ClientId, PresenceFields, SyncMessage};
pub use config::SyncConfig;
pub use coordinator::{BootstrapState, ErrorCallback, SyncCoordinator};
pub use document::SharedDoc;
pub use presence::{
    PresenceEvent, PresenceState, PresenceSubscription, RemovalReason, UpdateOrigin,
};
pub use session::{CollaborationSession, SessionOptions, SyncCallback, UserInfo};
