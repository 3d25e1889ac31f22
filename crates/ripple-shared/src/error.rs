use thiserror::Error;

/// Failures decoding payloads received from the pub/sub bus.
///
/// Topic payloads are duck-typed JSON on the wire; every consumer parses
/// into one of the closed enums in [`crate::protocol`] at the boundary and
/// rejects anything that does not fit.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
}
