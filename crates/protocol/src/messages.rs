//! Broadcast message types for document and presence synchronization
//!
//! Every payload on the channel is one of these variants. Dispatch is by
//! pattern match; there are no stringly-typed event names on the wire
//! beyond the serde tag.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of one document instance for the lifetime of one connection.
///
/// This is the yrs client id of the local document. It is not stable
/// across reconnects and is only used for addressing a [`SyncMessage::StateResponse`]
/// and for bulk-removing presence entries on teardown.
pub type ClientId = u64;

/// Errors produced while encoding or decoding wire payloads.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The payload was not a valid message of the expected shape.
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Sync message types for collaborative editing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SyncMessage {
    /// Incremental document update from a peer
    #[serde(rename = "doc_update")]
    DocUpdate { update: Vec<u8> },

    /// Presence (awareness) update from a peer
    #[serde(rename = "presence_update")]
    PresenceUpdate { data: Vec<u8> },

    /// A late joiner asking any initialized peer for the full state
    #[serde(rename = "state_request")]
    StateRequest { requester_id: ClientId },

    /// Full state snapshot; `target_id` absent means "answer to whoever
    /// is listening"
    #[serde(rename = "state_response")]
    StateResponse {
        state: Vec<u8>,
        target_id: Option<ClientId>,
    },
}

impl SyncMessage {
    /// Encode this message for the broadcast channel.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a message received from the broadcast channel.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
