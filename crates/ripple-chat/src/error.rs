use thiserror::Error;

use ripple_transport::{BackendError, TransportError};

/// Errors surfaced by the chat engine.
///
/// Transient connectivity failures never appear here; they are recovered
/// locally through the outbox.  What does surface is immediately actionable:
/// an empty draft, a denied edit, a permanently failed send.
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Message has no content")]
    EmptyMessage,

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("No message with that provisional id")]
    UnknownProvisional,

    #[error("Only failed messages can be resent")]
    NotResendable,
}
