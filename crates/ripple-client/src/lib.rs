//! # ripple-client
//!
//! The application-facing surface of the real-time layer: session
//! configuration and the signed-in [`RtcSession`] that wires the chat
//! engines, outbox replay, presence, and call plumbing together.

pub mod config;
pub mod session;

use tracing_subscriber::{fmt, EnvFilter};

pub use config::ClientConfig;
pub use session::RtcSession;

/// Install the global tracing subscriber.  `RUST_LOG` overrides the
/// defaults; call once at process start.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("ripple_client=debug,ripple_chat=debug,ripple_call=debug,ripple_store=info,warn")
    });

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
