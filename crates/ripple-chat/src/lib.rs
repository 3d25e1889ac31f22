//! # ripple-chat
//!
//! The chat half of the real-time layer: the message delivery engine
//! (optimistic timeline + reconciliation against authoritative events), the
//! offline outbox with reconnect replay, and the presence / typing / read
//! receipt tracker.

pub mod engine;
pub mod outbox;
pub mod presence;
pub mod replay;
pub mod timeline;
pub mod typing;

mod error;

pub use engine::{ChatConfig, ChatEngine, ChatUpdate};
pub use error::ChatError;
pub use outbox::Outbox;
pub use presence::PresenceTracker;
pub use replay::{Replayer, ReplayEvent};
pub use timeline::{InsertOutcome, Message, Timeline};
pub use typing::TypingNotifier;
