//! Protocol wiring between one document/presence pair and one channel
//!
//! The coordinator forwards local changes outward, applies inbound
//! changes, runs the bootstrap handshake for late joiners, and debounces
//! presence broadcasts. Construction only registers listeners; teardown
//! detaches them, cancels pending timers, and announces the departure so
//! no ghost presence survives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use collab_protocol::{ClientId, SyncMessage};

use crate::channel::{BroadcastChannel, Envelope};
use crate::config::SyncConfig;
use crate::document::SharedDoc;
use crate::presence::{PresenceState, PresenceSubscription, RemovalReason, UpdateOrigin};

/// Callback invoked when an inbound message fails to decode or apply.
///
/// One corrupt message never stops subsequent messages from being
/// processed; it is logged, reported here, and dropped.
pub type ErrorCallback = Arc<dyn Fn(&anyhow::Error) + Send + Sync>;

/// Bootstrap progress of one coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    /// Neither seeded nor requested yet.
    AwaitingBootstrap,
    /// A state request is in flight.
    Requesting,
    /// Full state applied or seeded; later responses are no-ops.
    Initialized,
}

/// Owns the wiring between one [`SharedDoc`]/[`PresenceState`] pair and
/// one already-subscribed [`BroadcastChannel`].
pub struct SyncCoordinator {
    channel: BroadcastChannel,
    doc: Arc<SharedDoc>,
    presence: Arc<PresenceState>,
    client_id: ClientId,
    config: SyncConfig,
    content_initialized: Arc<AtomicBool>,
    requesting: Arc<AtomicBool>,
    /// Single-slot bootstrap timer; always cleared on teardown so the
    /// callback cannot fire against a destroyed session.
    bootstrap_timeout: Arc<Mutex<Option<JoinHandle<()>>>>,
    inbound_task: JoinHandle<()>,
    debounce_task: JoinHandle<()>,
    _doc_subscription: yrs::Subscription,
    _presence_subscription: PresenceSubscription,
}

impl SyncCoordinator {
    /// Wire the four listeners onto an already-subscribed channel.
    ///
    /// Beyond registration this has no synchronous side effects: nothing
    /// is sent until a local change or inbound message arrives. If local
    /// presence fields are already set they are announced through the
    /// regular debounce path.
    pub fn new(
        channel: BroadcastChannel,
        receiver: broadcast::Receiver<Envelope>,
        doc: Arc<SharedDoc>,
        presence: Arc<PresenceState>,
        config: SyncConfig,
        on_error: Option<ErrorCallback>,
    ) -> Result<Self> {
        let client_id = doc.client_id();
        let content_initialized = Arc::new(AtomicBool::new(false));
        let requesting = Arc::new(AtomicBool::new(false));
        let bootstrap_timeout: Arc<Mutex<Option<JoinHandle<()>>>> = Arc::new(Mutex::new(None));

        // Listener 1: local document changes -> DocUpdate broadcast.
        // Remote-origin applications never fire this observer.
        let doc_subscription = {
            let channel = channel.clone();
            doc.observe_local_updates(move |update| {
                let message = SyncMessage::DocUpdate {
                    update: update.to_vec(),
                };
                if let Err(err) = channel.publish(client_id, &message) {
                    warn!(client_id, "failed to broadcast document update: {err:#}");
                }
            })?
        };

        // Listener 2: local presence mutations -> dirty signal for the
        // debounce task. Remote applications are filtered by origin.
        let (dirty_tx, dirty_rx) = mpsc::unbounded_channel();
        let presence_subscription = {
            let dirty_tx = dirty_tx.clone();
            presence.subscribe(move |event| {
                if event.origin == UpdateOrigin::Local {
                    let _ = dirty_tx.send(());
                }
            })
        };

        let debounce_task = tokio::spawn(debounce_loop(
            dirty_rx,
            channel.clone(),
            Arc::clone(&presence),
            config.presence_debounce,
        ));

        // Announce presence set before this coordinator existed.
        if presence.has_local_fields() {
            let _ = dirty_tx.send(());
        }

        // Listeners 3 & 4 (inbound doc/presence messages) plus the
        // handshake responder live in the receive loop.
        let inbound = Inbound {
            channel: channel.clone(),
            doc: Arc::clone(&doc),
            presence: Arc::clone(&presence),
            client_id,
            content_initialized: Arc::clone(&content_initialized),
            requesting: Arc::clone(&requesting),
            bootstrap_timeout: Arc::clone(&bootstrap_timeout),
            on_error,
        };
        let inbound_task = tokio::spawn(inbound.run(receiver));

        debug!(client_id, channel = channel.name(), "sync coordinator wired");

        Ok(Self {
            channel,
            doc,
            presence,
            client_id,
            config,
            content_initialized,
            requesting,
            bootstrap_timeout,
            inbound_task,
            debounce_task,
            _doc_subscription: doc_subscription,
            _presence_subscription: presence_subscription,
        })
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Whether the full state has been applied or seeded.
    pub fn content_initialized(&self) -> bool {
        self.content_initialized.load(Ordering::SeqCst)
    }

    pub fn bootstrap_state(&self) -> BootstrapState {
        if self.content_initialized.load(Ordering::SeqCst) {
            BootstrapState::Initialized
        } else if self.requesting.load(Ordering::SeqCst) {
            BootstrapState::Requesting
        } else {
            BootstrapState::AwaitingBootstrap
        }
    }

    /// Seed path: the caller believes it is first on the channel.
    ///
    /// Idempotent; a second call is a no-op. Seed content is written
    /// with local origin and therefore broadcast like any other edit.
    /// The initialized flag is set whether or not seed content is given.
    pub fn initialize_content(&self, seed: Option<&str>) {
        if self.content_initialized.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(content) = seed {
            self.doc.set_content(content);
        }
        debug!(client_id = self.client_id, "content initialized (seed path)");
    }

    /// Join path: ask any initialized peer for the full state.
    ///
    /// Arms the bootstrap timer. If nobody answers within the window
    /// this only logs a warning; the coordinator never self-promotes to
    /// the seed path. Seeding or retrying is the caller's decision.
    pub fn request_state(&self) -> Result<()> {
        self.requesting.store(true, Ordering::SeqCst);
        self.channel.publish(
            self.client_id,
            &SyncMessage::StateRequest {
                requester_id: self.client_id,
            },
        )?;

        let content_initialized = Arc::clone(&self.content_initialized);
        let requesting = Arc::clone(&self.requesting);
        let timeout = self.config.bootstrap_timeout;
        let client_id = self.client_id;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if !content_initialized.load(Ordering::SeqCst) {
                requesting.store(false, Ordering::SeqCst);
                warn!(
                    client_id,
                    "no state response within {timeout:?}; channel may have no initialized peer"
                );
            }
        });
        if let Some(previous) = self.bootstrap_timeout.lock().unwrap().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// Tear down: detach all four listeners, cancel pending timers, and
    /// broadcast this client's departure. No sends occur after this
    /// returns.
    pub fn destroy(self) {
        self.inbound_task.abort();
        self.debounce_task.abort();
        if let Some(handle) = self.bootstrap_timeout.lock().unwrap().take() {
            handle.abort();
        }

        // Announce the departure while the channel handle is still
        // alive; peers drop our presence entry on receipt.
        match self
            .presence
            .remove_states(&[self.client_id], RemovalReason::Cleanup)
        {
            Ok(data) => {
                let message = SyncMessage::PresenceUpdate { data };
                if let Err(err) = self.channel.publish(self.client_id, &message) {
                    warn!(client_id = self.client_id, "failed to broadcast departure: {err:#}");
                }
            }
            Err(err) => {
                warn!(client_id = self.client_id, "failed to encode departure: {err:#}");
            }
        }

        debug!(client_id = self.client_id, "sync coordinator destroyed");
        // Document and presence subscriptions detach on drop.
    }
}

/// Trailing-edge debounce: a burst of local presence mutations inside
/// one window produces a single broadcast carrying the final state.
async fn debounce_loop(
    mut dirty_rx: mpsc::UnboundedReceiver<()>,
    channel: BroadcastChannel,
    presence: Arc<PresenceState>,
    window: Duration,
) {
    while dirty_rx.recv().await.is_some() {
        // Restart the window on every further mutation; fire only after
        // a quiet period.
        loop {
            match tokio::time::timeout(window, dirty_rx.recv()).await {
                Ok(Some(())) => {}
                Ok(None) => return,
                Err(_elapsed) => break,
            }
        }
        match presence.encode_local_update() {
            Ok(data) => {
                let message = SyncMessage::PresenceUpdate { data };
                if let Err(err) = channel.publish(presence.client_id(), &message) {
                    warn!("failed to broadcast presence update: {err:#}");
                }
            }
            Err(err) => warn!("failed to encode presence update: {err:#}"),
        }
    }
}

/// State shared by the inbound receive loop.
struct Inbound {
    channel: BroadcastChannel,
    doc: Arc<SharedDoc>,
    presence: Arc<PresenceState>,
    client_id: ClientId,
    content_initialized: Arc<AtomicBool>,
    requesting: Arc<AtomicBool>,
    bootstrap_timeout: Arc<Mutex<Option<JoinHandle<()>>>>,
    on_error: Option<ErrorCallback>,
}

impl Inbound {
    async fn run(self, mut receiver: broadcast::Receiver<Envelope>) {
        loop {
            match receiver.recv().await {
                Ok(envelope) => {
                    // Our own broadcasts come back too; drop them here.
                    if envelope.sender == self.client_id {
                        continue;
                    }
                    if let Err(err) = self.handle(&envelope) {
                        warn!(
                            sender = envelope.sender,
                            "dropping malformed sync message: {err:#}"
                        );
                        if let Some(on_error) = &self.on_error {
                            on_error(&err);
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "broadcast receiver lagging");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    fn handle(&self, envelope: &Envelope) -> Result<()> {
        let message =
            SyncMessage::decode(&envelope.payload).context("decode broadcast payload")?;
        match message {
            SyncMessage::DocUpdate { update } => {
                // Merge is commutative and idempotent; no ordering or
                // deduplication needed here.
                self.doc
                    .apply_remote_update(&update)
                    .context("apply remote document update")?;
            }
            SyncMessage::PresenceUpdate { data } => {
                // Applied immediately, not debounced: remote freshness
                // matters more than send-side bandwidth.
                self.presence
                    .apply_update(&data, UpdateOrigin::Remote)
                    .context("apply remote presence update")?;
            }
            SyncMessage::StateRequest { requester_id } => {
                // Only an initialized peer has anything authoritative to
                // offer a late joiner.
                if self.content_initialized.load(Ordering::SeqCst) {
                    debug!(requester_id, "answering state request");
                    let response = SyncMessage::StateResponse {
                        state: self.doc.encode_full_state(),
                        target_id: Some(requester_id),
                    };
                    self.channel
                        .publish(self.client_id, &response)
                        .context("send state response")?;
                }
            }
            SyncMessage::StateResponse { state, target_id } => {
                if target_id.is_some_and(|target| target != self.client_id) {
                    return Ok(());
                }
                // Idempotency guard: only the first snapshot is applied;
                // a late response after initialization is benign.
                if self.content_initialized.load(Ordering::SeqCst) {
                    debug!("ignoring state response after initialization");
                    return Ok(());
                }
                self.doc
                    .apply_remote_update(&state)
                    .context("apply state snapshot")?;
                self.content_initialized.store(true, Ordering::SeqCst);
                self.requesting.store(false, Ordering::SeqCst);
                if let Some(handle) = self.bootstrap_timeout.lock().unwrap().take() {
                    handle.abort();
                }
                debug!(
                    client_id = self.client_id,
                    "document bootstrapped from peer snapshot"
                );
            }
        }
        Ok(())
    }
}
