//! Tunables for the synchronization layer

use std::time::Duration;

/// Tunables for one [`crate::coordinator::SyncCoordinator`].
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Trailing-edge window for coalescing presence broadcasts.
    ///
    /// Cursor moves fire at high frequency; one broadcast per quiet
    /// window caps the rate without losing the final state.
    pub presence_debounce: Duration,
    /// How long a state request waits before logging that nobody
    /// answered. Expiry only logs; seeding or retrying is the caller's
    /// decision.
    pub bootstrap_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            presence_debounce: Duration::from_millis(100),
            bootstrap_timeout: Duration::from_secs(2),
        }
    }
}
