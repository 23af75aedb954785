//! Replicated document wrapper
//!
//! Wraps a y-crdt document with a single text root. Concurrent updates
//! merge commutatively and idempotently, so callers never order or
//! deduplicate them. The wrapper's one job beyond delegation is origin
//! tracking: updates applied via [`SharedDoc::apply_remote_update`] do
//! not fire the local-update observer, which is what prevents re-broadcast
//! loops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, Text, Transact, Update};

use collab_protocol::ClientId;

/// Conflict-free replicated document holding a single text root.
pub struct SharedDoc {
    doc: Doc,
    /// Set while a remote update is being applied; the update observer
    /// skips events raised under this flag.
    applying_remote: Arc<AtomicBool>,
}

impl SharedDoc {
    pub fn new() -> Self {
        Self::from_doc(Doc::new())
    }

    /// Create a document with an explicit client id.
    ///
    /// Ids are normally random per instance; injecting one keeps tests
    /// deterministic and free of cross-test contamination.
    pub fn with_client_id(client_id: ClientId) -> Self {
        Self::from_doc(Doc::with_client_id(client_id))
    }

    fn from_doc(doc: Doc) -> Self {
        // Pre-create the text type
        let _ = doc.get_or_insert_text("content");
        Self {
            doc,
            applying_remote: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Id unique to this instance for the lifetime of one connection.
    pub fn client_id(&self) -> ClientId {
        self.doc.client_id()
    }

    fn text(&self) -> yrs::TextRef {
        self.doc.get_or_insert_text("content")
    }

    /// Replace the whole content. Used for seeding a fresh document;
    /// counts as a local edit and fires the update observer.
    pub fn set_content(&self, content: &str) {
        let text = self.text();
        let mut txn = self.doc.transact_mut();
        let len = text.get_string(&txn).len() as u32;
        if len > 0 {
            text.remove_range(&mut txn, 0, len);
        }
        text.insert(&mut txn, 0, content);
    }

    /// Current content as a string.
    pub fn get_content(&self) -> String {
        let text = self.text();
        let txn = self.doc.transact();
        text.get_string(&txn)
    }

    /// Insert text at a character offset (local edit).
    pub fn insert(&self, index: u32, chunk: &str) {
        let text = self.text();
        let mut txn = self.doc.transact_mut();
        text.insert(&mut txn, index, chunk);
    }

    /// Remove a character range (local edit).
    pub fn remove_range(&self, index: u32, len: u32) {
        let text = self.text();
        let mut txn = self.doc.transact_mut();
        text.remove_range(&mut txn, index, len);
    }

    /// Apply an update received from a peer.
    ///
    /// The local-update observer is suppressed for the duration, so a
    /// remote-origin change is never re-broadcast.
    pub fn apply_remote_update(&self, update: &[u8]) -> Result<()> {
        let update = Update::decode_v1(update)?;
        self.applying_remote.store(true, Ordering::SeqCst);
        let applied = {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update)
        };
        self.applying_remote.store(false, Ordering::SeqCst);
        applied?;
        Ok(())
    }

    /// Full state snapshot, encoded as one update. Applying it to an
    /// empty document reproduces this document's content.
    pub fn encode_full_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&yrs::StateVector::default())
    }

    /// Observe locally originated updates.
    ///
    /// The callback receives the encoded incremental update for every
    /// local transaction; remote applications do not fire. Dropping the
    /// returned subscription detaches the observer.
    pub fn observe_local_updates<F>(&self, callback: F) -> Result<yrs::Subscription>
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        let applying_remote = Arc::clone(&self.applying_remote);
        self.doc
            .observe_update_v1(move |_txn, event| {
                if applying_remote.load(Ordering::SeqCst) {
                    return;
                }
                callback(&event.update);
            })
            .map_err(|err| anyhow!("failed to observe document updates: {err}"))
    }
}

impl Default for SharedDoc {
    fn default() -> Self {
        Self::new()
    }
}
