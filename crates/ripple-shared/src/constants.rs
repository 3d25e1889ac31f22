/// Application name
pub const APP_NAME: &str = "Ripple";

/// Global presence topic (not scoped per chat).
pub const PRESENCE_TOPIC: &str = "presence";

/// Window within which an authoritative echo may reconcile against a pending
/// optimistic entry (same sender, equal body/media).
pub const RECONCILE_WINDOW_SECS: i64 = 30;

/// Presence heartbeat period in seconds.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Delay after the last keystroke before a typing-stop broadcast.
pub const TYPING_STOP_DELAY_MS: u64 = 3_000;

/// How long an unanswered call rings before it is recorded as missed.
pub const RING_TIMEOUT_SECS: u64 = 30;

/// Sends that fail this many times are moved to the dead state and surfaced
/// as permanently failed.
pub const MAX_SEND_ATTEMPTS: u32 = 5;

/// Initial outbox retry backoff in milliseconds (doubles per attempt).
pub const OUTBOX_BACKOFF_INITIAL_MS: u64 = 500;

/// Ceiling for outbox retry backoff in milliseconds.
pub const OUTBOX_BACKOFF_MAX_MS: u64 = 30_000;

/// Entries in the provisional-status map older than this are purged.
pub const STATUS_MAP_TTL_SECS: i64 = 300;

/// Bounded capacity for event/notification channels.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;
