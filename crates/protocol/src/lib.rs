//! Shared wire types for collab-sync
//!
//! Defines the tagged message union exchanged over the broadcast channel
//! and the presence wire payload.

pub mod messages;
pub mod presence;

pub use messages::*;
pub use presence::*;
