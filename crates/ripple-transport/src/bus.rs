use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::error::TransportError;

/// One delivered broadcast or change event.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub topic: String,
    pub payload: serde_json::Value,
}

/// A generic bidirectional pub/sub channel, scoped by topic name.
///
/// Delivery semantics the rest of the system relies on:
/// - at-least-once: the same payload may arrive more than once;
/// - no ordering across distinct publishers on the same topic;
/// - a subscription ends when its receiver is dropped.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish a JSON payload on a topic.  Fails fast while disconnected;
    /// callers that need durability go through the outbox instead.
    async fn publish(&self, topic: &str, payload: serde_json::Value)
        -> Result<(), TransportError>;

    /// Subscribe to every event on a topic.  Dropping the receiver
    /// unsubscribes.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Envelope>, TransportError>;

    /// Watchable connectivity flag.  A `false -> true` transition is the
    /// reconnect signal the outbox replayer drains on.
    fn connectivity(&self) -> watch::Receiver<bool>;
}
