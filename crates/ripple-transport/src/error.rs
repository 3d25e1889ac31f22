use thiserror::Error;

/// Failures publishing to or subscribing on the pub/sub bus.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Transport is disconnected")]
    Disconnected,

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),
}

/// Failures from the request/response data API.
///
/// The split between transient and terminal variants drives the outbox: a
/// transient failure diverts the send into the persisted queue, a terminal
/// one surfaces immediately and is never retried.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Backend unreachable: {0}")]
    Unavailable(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("Not found")]
    NotFound,
}

impl BackendError {
    /// Whether the failure is attributable to connectivity rather than to
    /// the request itself.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transience_split() {
        assert!(BackendError::Unavailable("down".into()).is_transient());
        assert!(BackendError::Timeout.is_transient());
        assert!(!BackendError::Rejected("not the sender".into()).is_transient());
        assert!(!BackendError::NotFound.is_transient());
    }
}
