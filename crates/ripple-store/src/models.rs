//! Rows persisted in the local database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ripple_shared::types::{
    ChatId, DeliveryStatus, MediaKind, MessageDraft, ProvisionalId, UserId,
};

/// One pending send in the offline outbox.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutboxRecord {
    /// Provisional id of the optimistic timeline entry this send backs.
    /// Replay reuses it so UI reconciliation still applies.
    pub provisional_id: ProvisionalId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub draft: MessageDraft,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
}

impl OutboxRecord {
    pub fn new(
        provisional_id: ProvisionalId,
        chat_id: ChatId,
        sender_id: UserId,
        draft: MessageDraft,
        enqueued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            provisional_id,
            chat_id,
            sender_id,
            draft,
            enqueued_at,
            attempts: 0,
        }
    }
}

/// Last known delivery status for a provisional id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusRecord {
    pub provisional_id: ProvisionalId,
    pub status: DeliveryStatus,
    pub updated_at: DateTime<Utc>,
}

pub(crate) fn media_kind_to_str(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Image => "image",
        MediaKind::Video => "video",
        MediaKind::Audio => "audio",
        MediaKind::File => "file",
    }
}

pub(crate) fn media_kind_from_str(s: &str) -> Option<MediaKind> {
    match s {
        "image" => Some(MediaKind::Image),
        "video" => Some(MediaKind::Video),
        "audio" => Some(MediaKind::Audio),
        "file" => Some(MediaKind::File),
        _ => None,
    }
}
