//! In-memory broadcast channel hub
//!
//! Stands in for the hosted realtime service: named channels with
//! fan-out to every subscriber. Ordering is preserved per sender only;
//! there is no ordering guarantee across distinct senders and no
//! exactly-once delivery. A production transport adapter would expose
//! the same handle surface over its own wire.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use tokio::sync::broadcast;
use tracing::trace;

use collab_protocol::{ClientId, SyncMessage};

const DEFAULT_CAPACITY: usize = 64;

/// A message as carried on the wire: opaque payload plus the sender id
/// used by receivers to filter their own broadcasts.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub sender: ClientId,
    pub payload: Vec<u8>,
}

/// Outcome of a subscribe call, reported asynchronously by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// The channel is live; messages will be delivered.
    Subscribed,
    /// The transport refused or dropped the subscription.
    Closed,
}

/// A live subscription: the acknowledged status plus the message stream.
pub struct ChannelSubscription {
    pub status: ChannelStatus,
    pub receiver: broadcast::Receiver<Envelope>,
}

/// Registry of named channels.
pub struct ChannelHub {
    channels: Mutex<HashMap<String, broadcast::Sender<Envelope>>>,
    capacity: usize,
}

impl ChannelHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Get a handle to the named channel, creating it on first use.
    pub fn channel(&self, name: &str) -> BroadcastChannel {
        let mut channels = self.channels.lock().unwrap();
        let tx = channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone();
        BroadcastChannel {
            name: name.to_string(),
            tx,
        }
    }
}

impl Default for ChannelHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Cheap-to-clone handle to one named channel.
#[derive(Debug, Clone)]
pub struct BroadcastChannel {
    name: String,
    tx: broadcast::Sender<Envelope>,
}

impl BroadcastChannel {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscribe to the channel.
    ///
    /// The in-memory hub acknowledges immediately; the async signature
    /// matches real transports where the acknowledgment arrives later.
    /// Only messages published after this call are delivered.
    pub async fn subscribe(&self) -> ChannelSubscription {
        let receiver = self.tx.subscribe();
        trace!(channel = %self.name, "subscribed");
        ChannelSubscription {
            status: ChannelStatus::Subscribed,
            receiver,
        }
    }

    /// Encode and publish a message on behalf of `sender`.
    ///
    /// Publishing on a channel nobody listens to is not an error. The
    /// sender's own receiver also observes the envelope; consumers drop
    /// envelopes carrying their own id.
    pub fn publish(&self, sender: ClientId, message: &SyncMessage) -> Result<()> {
        let payload = message.encode()?;
        let _ = self.tx.send(Envelope { sender, payload });
        Ok(())
    }

    /// Number of live subscriptions on this channel.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
