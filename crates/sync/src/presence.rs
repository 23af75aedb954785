//! Ephemeral per-client presence (awareness)
//!
//! A last-write-per-field map keyed by client id: display name, color,
//! cursor position. Nothing here is persisted; entries exist only while
//! their client is connected and are bulk-removed on teardown. Merge is
//! clock-gated last-write-wins per client, convergent under arbitrary
//! interleaving.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use anyhow::Result;
use tracing::debug;

use collab_protocol::{ClientId, PresenceEntry, PresenceFields, PresencePayload};

/// Origin tag of a state change, used to suppress re-broadcast of
/// changes this client did not originate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    Local,
    Remote,
}

/// Why presence entries were removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// Orderly teardown of the owning session.
    Cleanup,
    /// The peer vanished without saying goodbye.
    Disconnect,
}

/// Change notification passed to presence listeners.
#[derive(Debug, Clone)]
pub struct PresenceEvent {
    pub origin: UpdateOrigin,
    /// Clients whose entries changed (added, updated, or removed).
    pub clients: Vec<ClientId>,
}

type Listener = Arc<dyn Fn(&PresenceEvent) + Send + Sync>;
type ListenerSlot = (u64, Listener);

/// RAII handle for a registered presence listener.
///
/// Dropping the handle detaches the listener; there is no manual
/// bookkeeping of handler references.
pub struct PresenceSubscription {
    listeners: Weak<Mutex<Vec<ListenerSlot>>>,
    id: u64,
}

impl Drop for PresenceSubscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            if let Ok(mut listeners) = listeners.lock() {
                listeners.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

#[derive(Debug, Clone)]
struct ClientState {
    clock: u32,
    fields: PresenceFields,
}

#[derive(Default)]
struct PresenceMap {
    states: HashMap<ClientId, ClientState>,
    /// Highest clock seen per client, departed clients included, so a
    /// stale update cannot resurrect a removed entry.
    clocks: HashMap<ClientId, u32>,
}

/// Presence store for one document instance.
pub struct PresenceState {
    client_id: ClientId,
    map: Mutex<PresenceMap>,
    listeners: Arc<Mutex<Vec<ListenerSlot>>>,
    next_listener_id: AtomicU64,
}

impl PresenceState {
    pub fn new(client_id: ClientId) -> Self {
        let mut map = PresenceMap::default();
        map.states.insert(
            client_id,
            ClientState {
                clock: 0,
                fields: PresenceFields::new(),
            },
        );
        map.clocks.insert(client_id, 0);
        Self {
            client_id,
            map: Mutex::new(map),
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_listener_id: AtomicU64::new(0),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Set one local presence field (cursor position, name, color, ...).
    ///
    /// Bumps the local clock and fires listeners with
    /// [`UpdateOrigin::Local`].
    pub fn set_local_field(&self, key: &str, value: serde_json::Value) {
        {
            let mut map = self.map.lock().unwrap();
            let clock = map.clocks.get(&self.client_id).copied().unwrap_or(0) + 1;
            let state = map.states.entry(self.client_id).or_insert_with(|| ClientState {
                clock: 0,
                fields: PresenceFields::new(),
            });
            state.clock = clock;
            state.fields.insert(key.to_string(), value);
            map.clocks.insert(self.client_id, clock);
        }
        self.notify(&PresenceEvent {
            origin: UpdateOrigin::Local,
            clients: vec![self.client_id],
        });
    }

    /// Whether this client has any local fields set.
    pub fn has_local_fields(&self) -> bool {
        let map = self.map.lock().unwrap();
        map.states
            .get(&self.client_id)
            .is_some_and(|state| !state.fields.is_empty())
    }

    /// Encode the current entries of the given clients.
    pub fn encode_update(&self, clients: &[ClientId]) -> Result<Vec<u8>> {
        let map = self.map.lock().unwrap();
        let entries = clients
            .iter()
            .filter_map(|id| {
                map.states.get(id).map(|state| PresenceEntry {
                    client_id: *id,
                    clock: state.clock,
                    fields: Some(state.fields.clone()),
                })
            })
            .collect();
        Ok(PresencePayload { entries }.encode()?)
    }

    /// Encode only this client's current fields.
    pub fn encode_local_update(&self) -> Result<Vec<u8>> {
        self.encode_update(&[self.client_id])
    }

    /// Merge a payload from a peer.
    ///
    /// Entries win per client when their clock is newer; `fields: None`
    /// removes the client. Entries describing this client are ignored.
    pub fn apply_update(&self, data: &[u8], origin: UpdateOrigin) -> Result<()> {
        let payload = PresencePayload::decode(data)?;
        let mut changed = Vec::new();
        {
            let mut map = self.map.lock().unwrap();
            for entry in payload.entries {
                if entry.client_id == self.client_id {
                    continue;
                }
                let known = map.clocks.get(&entry.client_id).copied();
                if known.is_some_and(|clock| entry.clock <= clock) {
                    continue;
                }
                map.clocks.insert(entry.client_id, entry.clock);
                match entry.fields {
                    Some(fields) => {
                        map.states.insert(
                            entry.client_id,
                            ClientState {
                                clock: entry.clock,
                                fields,
                            },
                        );
                    }
                    None => {
                        map.states.remove(&entry.client_id);
                    }
                }
                changed.push(entry.client_id);
            }
        }
        if !changed.is_empty() {
            self.notify(&PresenceEvent {
                origin,
                clients: changed,
            });
        }
        Ok(())
    }

    /// Remove entries and return the encoded departure payload, so the
    /// caller can announce the removal to peers before releasing the
    /// channel.
    pub fn remove_states(&self, clients: &[ClientId], reason: RemovalReason) -> Result<Vec<u8>> {
        let mut entries = Vec::new();
        let mut removed = Vec::new();
        {
            let mut map = self.map.lock().unwrap();
            for id in clients {
                if map.states.remove(id).is_some() {
                    let clock = map.clocks.get(id).copied().unwrap_or(0) + 1;
                    map.clocks.insert(*id, clock);
                    entries.push(PresenceEntry {
                        client_id: *id,
                        clock,
                        fields: None,
                    });
                    removed.push(*id);
                }
            }
        }
        if !removed.is_empty() {
            debug!(?reason, clients = ?removed, "removed presence states");
            self.notify(&PresenceEvent {
                origin: UpdateOrigin::Local,
                clients: removed,
            });
        }
        Ok(PresencePayload { entries }.encode()?)
    }

    /// Clients currently present, this one included until removed.
    pub fn clients(&self) -> Vec<ClientId> {
        let map = self.map.lock().unwrap();
        let mut clients: Vec<ClientId> = map.states.keys().copied().collect();
        clients.sort_unstable();
        clients
    }

    pub fn contains(&self, client_id: ClientId) -> bool {
        self.map.lock().unwrap().states.contains_key(&client_id)
    }

    /// Current fields of one client, if present.
    pub fn get(&self, client_id: ClientId) -> Option<PresenceFields> {
        self.map
            .lock()
            .unwrap()
            .states
            .get(&client_id)
            .map(|state| state.fields.clone())
    }

    /// Register a change listener; the returned guard detaches it on
    /// drop.
    pub fn subscribe<F>(&self, listener: F) -> PresenceSubscription
    where
        F: Fn(&PresenceEvent) + Send + Sync + 'static,
    {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().unwrap().push((id, Arc::new(listener)));
        PresenceSubscription {
            listeners: Arc::downgrade(&self.listeners),
            id,
        }
    }

    fn notify(&self, event: &PresenceEvent) {
        // Snapshot listeners so callbacks may re-enter the store.
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(event);
        }
    }
}
