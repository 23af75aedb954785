//! Presence wire payload
//!
//! Presence is a last-write-per-field map keyed by client id. Each entry
//! carries the sender's clock at encode time; receivers keep whichever
//! entry has the higher clock. An entry with `fields: None` marks a
//! client that has left.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::messages::{ClientId, ProtocolError};

/// Presence fields for one client (display name, color, cursor, ...).
pub type PresenceFields = BTreeMap<String, serde_json::Value>;

/// State of a single client inside a presence payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    /// The client this entry describes.
    pub client_id: ClientId,
    /// Sender-side clock; higher clock wins on merge.
    pub clock: u32,
    /// Current fields, or `None` when the client has departed.
    pub fields: Option<PresenceFields>,
}

/// A batch of presence entries broadcast as one message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresencePayload {
    pub entries: Vec<PresenceEntry>,
}

impl PresencePayload {
    /// Encode for the broadcast channel.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a payload received from the broadcast channel.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
