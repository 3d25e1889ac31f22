//! # ripple-call
//!
//! Peer call plumbing over the shared signaling topics: the per-chat call
//! state machine ([`CallManager`]), the session-wide inbound offer watcher
//! ([`CallNotificationListener`]) and the trait seams to the platform media
//! stack.

pub mod listener;
pub mod media;
pub mod session;

mod error;

pub use error::{CallError, MediaError};
pub use listener::{CallNotificationListener, IncomingCall};
pub use media::{MediaProvider, MediaStream, NullMediaProvider, PeerConnection};
pub use session::{CallManager, CallState};
