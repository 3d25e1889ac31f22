//! Session configuration.

use std::path::PathBuf;
use std::time::Duration;

use ripple_shared::constants::{
    HEARTBEAT_INTERVAL_SECS, MAX_SEND_ATTEMPTS, OUTBOX_BACKOFF_INITIAL_MS, OUTBOX_BACKOFF_MAX_MS,
    RECONCILE_WINDOW_SECS,
};

/// Knobs for one signed-in session.  Defaults match production behavior;
/// tests mostly override `store_path` (or disable persistence entirely).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Where the outbox database lives.  `None` with `persist_outbox` set
    /// resolves to the platform data directory.
    pub store_path: Option<PathBuf>,
    /// Disabling persistence keeps pending sends in memory only; they do
    /// not survive a restart.
    pub persist_outbox: bool,
    pub reconcile_window_secs: i64,
    pub broadcast_read_receipts: bool,
    pub heartbeat_interval: Duration,
    pub max_send_attempts: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            store_path: None,
            persist_outbox: true,
            reconcile_window_secs: RECONCILE_WINDOW_SECS,
            broadcast_read_receipts: true,
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            max_send_attempts: MAX_SEND_ATTEMPTS,
            backoff_initial_ms: OUTBOX_BACKOFF_INITIAL_MS,
            backoff_max_ms: OUTBOX_BACKOFF_MAX_MS,
        }
    }
}

impl ClientConfig {
    /// In-memory everything; what the integration tests run on.
    pub fn ephemeral() -> Self {
        Self {
            persist_outbox: false,
            ..Self::default()
        }
    }
}
