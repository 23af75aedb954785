//! Collaboration session: composition & lifecycle
//!
//! A session owns the document/presence pair for one channel, subscribes
//! the channel, and instantiates exactly one coordinator once the channel
//! reports live. Sessions are never reused: disable/unmount or a change
//! of channel or user tears everything down, and the next enable builds
//! a fresh one.

use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::debug;

use collab_protocol::ClientId;

use crate::channel::{BroadcastChannel, ChannelHub, ChannelStatus};
use crate::config::SyncConfig;
use crate::coordinator::{ErrorCallback, SyncCoordinator};
use crate::document::SharedDoc;
use crate::presence::PresenceState;

/// Callback observing the `synced` flag, for "connecting..."/"offline"
/// indicators.
pub type SyncCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Participant identity, written into local presence on enable.
#[derive(Debug, Clone)]
pub struct UserInfo {
    pub id: String,
    pub name: String,
    pub color: String,
}

/// Options for [`CollaborationSession::connect`].
#[derive(Clone)]
pub struct SessionOptions {
    pub channel_name: String,
    /// The participating user; `None` keeps the session disabled.
    pub user: Option<UserInfo>,
    pub enabled: bool,
    pub on_sync: Option<SyncCallback>,
    pub on_error: Option<ErrorCallback>,
    pub config: SyncConfig,
}

impl SessionOptions {
    pub fn new(channel_name: impl Into<String>, user: Option<UserInfo>) -> Self {
        Self {
            channel_name: channel_name.into(),
            user,
            enabled: true,
            on_sync: None,
            on_error: None,
            config: SyncConfig::default(),
        }
    }
}

struct ActiveSession {
    document: Arc<SharedDoc>,
    presence: Arc<PresenceState>,
    coordinator: Option<SyncCoordinator>,
    channel: BroadcastChannel,
}

/// One logical collaboration session, keyed by channel name and user.
pub struct CollaborationSession {
    active: Option<ActiveSession>,
    synced: bool,
    on_sync: Option<SyncCallback>,
}

impl CollaborationSession {
    /// Create a session.
    ///
    /// While `enabled` is false or `user` is `None` this is a no-op
    /// shell: every part absent, `synced` false. Otherwise a fresh
    /// document and presence store are created, the user's identity is
    /// written into local presence, and once the channel acknowledges
    /// the subscription a single coordinator is wired and `synced`
    /// flips true.
    pub async fn connect(hub: &ChannelHub, options: SessionOptions) -> Result<Self> {
        let (Some(user), true) = (options.user, options.enabled) else {
            return Ok(Self::disabled(options.on_sync));
        };

        let document = Arc::new(SharedDoc::new());
        let presence = Arc::new(PresenceState::new(document.client_id()));
        presence.set_local_field("id", user.id.clone().into());
        presence.set_local_field("name", user.name.into());
        presence.set_local_field("color", user.color.into());

        let channel = hub.channel(&options.channel_name);
        let subscription = channel.subscribe().await;
        if subscription.status != ChannelStatus::Subscribed {
            // Transport-level failure; retry/backoff policy belongs to
            // the caller.
            bail!(
                "channel '{}' refused subscription: {:?}",
                options.channel_name,
                subscription.status
            );
        }

        let coordinator = SyncCoordinator::new(
            channel.clone(),
            subscription.receiver,
            Arc::clone(&document),
            Arc::clone(&presence),
            options.config,
            options.on_error,
        )?;

        debug!(
            channel = %options.channel_name,
            client_id = document.client_id(),
            user = %user.id,
            "collaboration session connected"
        );

        if let Some(on_sync) = &options.on_sync {
            on_sync(true);
        }

        Ok(Self {
            active: Some(ActiveSession {
                document,
                presence,
                coordinator: Some(coordinator),
                channel,
            }),
            synced: true,
            on_sync: options.on_sync,
        })
    }

    fn disabled(on_sync: Option<SyncCallback>) -> Self {
        Self {
            active: None,
            synced: false,
            on_sync,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.active.is_some()
    }

    /// Whether the sync protocol is up for this session.
    pub fn synced(&self) -> bool {
        self.synced
    }

    pub fn document(&self) -> Option<&Arc<SharedDoc>> {
        self.active.as_ref().map(|active| &active.document)
    }

    pub fn presence(&self) -> Option<&Arc<PresenceState>> {
        self.active.as_ref().map(|active| &active.presence)
    }

    pub fn channel(&self) -> Option<&BroadcastChannel> {
        self.active.as_ref().map(|active| &active.channel)
    }

    pub fn coordinator(&self) -> Option<&SyncCoordinator> {
        self.active
            .as_ref()
            .and_then(|active| active.coordinator.as_ref())
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.document().map(|document| document.client_id())
    }

    /// Seed path pass-through (idempotent); no-op while disabled.
    pub fn initialize_content(&self, seed: Option<&str>) {
        if let Some(coordinator) = self.coordinator() {
            coordinator.initialize_content(seed);
        }
    }

    /// Join path pass-through; no-op while disabled.
    pub fn request_state(&self) -> Result<()> {
        match self.coordinator() {
            Some(coordinator) => coordinator.request_state(),
            None => Ok(()),
        }
    }

    /// Tear down: coordinator first (timers cancelled, listeners
    /// detached, presence removed with reason `Cleanup`), then the
    /// channel handle is released. Safe to call more than once.
    pub fn destroy(&mut self) {
        if let Some(mut active) = self.active.take() {
            if let Some(coordinator) = active.coordinator.take() {
                coordinator.destroy();
            }
            self.synced = false;
            if let Some(on_sync) = &self.on_sync {
                on_sync(false);
            }
            debug!(channel = active.channel.name(), "collaboration session destroyed");
        }
    }
}

impl Drop for CollaborationSession {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn user(id: &str) -> UserInfo {
        UserInfo {
            id: id.to_string(),
            name: format!("User {id}"),
            color: "#ff6b6b".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_session_is_a_no_op_shell() {
        let hub = ChannelHub::new();
        let mut options = SessionOptions::new("room:1", Some(user("u1")));
        options.enabled = false;

        let session = CollaborationSession::connect(&hub, options).await.unwrap();
        assert!(!session.is_enabled());
        assert!(!session.synced());
        assert!(session.document().is_none());
        assert!(session.presence().is_none());
        assert!(session.channel().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_user_keeps_session_disabled() {
        let hub = ChannelHub::new();
        let session =
            CollaborationSession::connect(&hub, SessionOptions::new("room:1", None))
                .await
                .unwrap();
        assert!(!session.is_enabled());
        assert!(!session.synced());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_sets_identity_and_synced() {
        let hub = ChannelHub::new();
        let synced_seen = Arc::new(AtomicBool::new(false));
        let observed = Arc::clone(&synced_seen);

        let mut options = SessionOptions::new("room:1", Some(user("u1")));
        options.on_sync = Some(Arc::new(move |synced| {
            observed.store(synced, Ordering::SeqCst);
        }));

        let session = CollaborationSession::connect(&hub, options).await.unwrap();
        assert!(session.synced());
        assert!(synced_seen.load(Ordering::SeqCst));

        let presence = session.presence().unwrap();
        let fields = presence.get(presence.client_id()).unwrap();
        assert_eq!(fields["id"], "u1");
        assert_eq!(fields["name"], "User u1");
        assert_eq!(fields["color"], "#ff6b6b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_flips_synced_and_notifies() {
        let hub = ChannelHub::new();
        let last_sync = Arc::new(AtomicBool::new(false));
        let observed = Arc::clone(&last_sync);

        let mut options = SessionOptions::new("room:1", Some(user("u1")));
        options.on_sync = Some(Arc::new(move |synced| {
            observed.store(synced, Ordering::SeqCst);
        }));

        let mut session = CollaborationSession::connect(&hub, options).await.unwrap();
        assert!(last_sync.load(Ordering::SeqCst));

        session.destroy();
        assert!(!session.synced());
        assert!(!session.is_enabled());
        assert!(!last_sync.load(Ordering::SeqCst));

        // Destroying twice is fine.
        session.destroy();
    }
}
