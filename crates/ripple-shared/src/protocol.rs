//! Tagged event types carried on the pub/sub topics.
//!
//! One closed enum per topic family; payloads are JSON on the wire and are
//! parsed (never trusted) at the subscription boundary.  Delivery is
//! at-least-once with no ordering guarantee across publishers, so every
//! consumer must tolerate duplicates and reordering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::{
    CallKind, ChatId, MessageId, MessageRecord, PresenceStatus, UserId,
};

/// Events on `chat:{id}`: authoritative row changes plus read receipts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// A new authoritative row.  May be a duplicate of an earlier delivery.
    MessageInserted { message: MessageRecord },
    /// An edit or a delivery-status transition.
    MessageUpdated { message: MessageRecord },
    MessageDeleted { id: MessageId },
    /// A participant has read up to the listed messages.
    ReadReceipt {
        user_id: UserId,
        message_ids: Vec<MessageId>,
    },
}

impl ChatEvent {
    pub fn from_json(payload: &serde_json::Value) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_value(payload.clone())?)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("chat event serializes")
    }
}

/// Ephemeral broadcast on `typing:{id}`.  Pure fire-and-forget: a missed
/// event only means an indicator lingers or never appears.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypingEvent {
    pub user_id: UserId,
    pub active: bool,
}

impl TypingEvent {
    pub fn from_json(payload: &serde_json::Value) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_value(payload.clone())?)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("typing event serializes")
    }
}

/// Signaling payloads on `call:{id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallSignal {
    /// SDP offer, tagged with kind and caller so listeners can prompt.
    Offer {
        caller_id: UserId,
        kind: CallKind,
        sdp: String,
    },
    /// SDP answer from the callee.
    Answer { sender_id: UserId, sdp: String },
    /// One ICE candidate, published individually as it is gathered.
    /// Application order between candidates is not guaranteed.
    IceCandidate { sender_id: UserId, candidate: String },
    /// Callee refused the call; the caller never reaches connected.
    Decline { sender_id: UserId },
}

impl CallSignal {
    pub fn from_json(payload: &serde_json::Value) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_value(payload.clone())?)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("call signal serializes")
    }

    pub fn sender(&self) -> UserId {
        match self {
            Self::Offer { caller_id, .. } => *caller_id,
            Self::Answer { sender_id, .. }
            | Self::IceCandidate { sender_id, .. }
            | Self::Decline { sender_id } => *sender_id,
        }
    }
}

/// Heartbeat / liveness broadcast on the global `presence` topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceUpdate {
    pub user_id: UserId,
    pub status: PresenceStatus,
    pub viewing_chat: Option<ChatId>,
    pub sent_at: DateTime<Utc>,
}

impl PresenceUpdate {
    pub fn from_json(payload: &serde_json::Value) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_value(payload.clone())?)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("presence update serializes")
    }
}
