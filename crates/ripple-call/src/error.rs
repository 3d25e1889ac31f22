use thiserror::Error;

use ripple_transport::{BackendError, TransportError};

/// Device and negotiation failures from the media layer.
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Media acquisition failed: {0}")]
    Acquisition(String),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),
}

/// Errors surfaced by call signaling.
#[derive(Error, Debug)]
pub enum CallError {
    /// A session is already active; the new attempt had no side effects.
    #[error("A call is already in progress")]
    Busy,

    #[error("No active call")]
    NotInCall,

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}
