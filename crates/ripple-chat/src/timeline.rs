//! The visible message sequence of one chat.
//!
//! A [`Timeline`] combines local intent (optimistic entries with provisional
//! ids) with backend truth (authoritative records carrying durable ids) and
//! upholds the core guarantee: the sequence never shows the same logical
//! message twice, no matter how events are duplicated or reordered by the
//! transport.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use ripple_shared::types::{
    ChatId, DeliveryStatus, MediaKind, MessageDraft, MessageId, MessageRecord, ProvisionalId,
    UserId,
};

/// One visible message bubble.
///
/// Exactly one of `id` / `provisional_id` is guaranteed present at creation;
/// after reconciliation an entry keeps both, so callers that tracked the
/// provisional id still find the row.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Message {
    pub id: Option<MessageId>,
    pub provisional_id: Option<ProvisionalId>,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub body: Option<String>,
    pub media_url: Option<String>,
    pub media_kind: Option<MediaKind>,
    pub reply_to: Option<MessageId>,
    pub edited: bool,
    pub forwarded: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: DeliveryStatus,
    pub is_optimistic: bool,
}

impl Message {
    /// A provisional entry for a send that has not reached the backend yet.
    pub fn optimistic(
        provisional_id: ProvisionalId,
        chat_id: ChatId,
        sender_id: UserId,
        draft: &MessageDraft,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            provisional_id: Some(provisional_id),
            chat_id,
            sender_id,
            body: draft.body.clone(),
            media_url: draft.media_url.clone(),
            media_kind: draft.media_kind,
            reply_to: draft.reply_to,
            edited: false,
            forwarded: draft.forwarded,
            created_at,
            updated_at: created_at,
            status: DeliveryStatus::Sending,
            is_optimistic: true,
        }
    }

    pub fn from_record(record: MessageRecord) -> Self {
        Self {
            id: Some(record.id),
            provisional_id: None,
            chat_id: record.chat_id,
            sender_id: record.sender_id,
            body: record.body,
            media_url: record.media_url,
            media_kind: record.media_kind,
            reply_to: record.reply_to,
            edited: record.edited,
            forwarded: record.forwarded,
            created_at: record.created_at,
            updated_at: record.updated_at,
            status: record.status,
            is_optimistic: false,
        }
    }

    pub fn draft(&self) -> MessageDraft {
        MessageDraft {
            body: self.body.clone(),
            media_url: self.media_url.clone(),
            media_kind: self.media_kind,
            reply_to: self.reply_to,
            forwarded: self.forwarded,
        }
    }
}

/// What [`Timeline::apply_insert`] did with an authoritative record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Replaced a matching optimistic entry in place.
    Reconciled(ProvisionalId),
    /// No match within the window; appended as a new message.
    Appended,
    /// The durable id is already visible; duplicate delivery, no-op.
    Duplicate,
}

/// Ordered, duplicate-free message sequence for a single chat.
pub struct Timeline {
    entries: Vec<Message>,
    window: Duration,
}

impl Timeline {
    pub fn new(reconcile_window_secs: i64) -> Self {
        Self {
            entries: Vec::new(),
            window: Duration::seconds(reconcile_window_secs),
        }
    }

    pub fn entries(&self) -> &[Message] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_durable(&self, id: MessageId) -> bool {
        self.entries.iter().any(|e| e.id == Some(id))
    }

    pub fn by_provisional(&self, id: ProvisionalId) -> Option<&Message> {
        self.entries.iter().find(|e| e.provisional_id == Some(id))
    }

    /// Insert a locally created entry at the tail.  The caller sees the
    /// bubble immediately; the network write happens after.
    pub fn push_optimistic(&mut self, message: Message) {
        debug_assert!(message.is_optimistic && message.id.is_none());
        self.entries.push(message);
    }

    /// Fold one authoritative insert into the sequence.
    ///
    /// Duplicate durable ids are rejected.  An optimistic entry from the
    /// same sender with equal body and media whose timestamp lies within the
    /// reconciliation window is replaced in place, preserving its visual
    /// position; anything else appends.  An echo that matches nothing is
    /// treated as a new message, never as an update — the accepted trade-off
    /// is an occasional duplicate when a user sends identical content twice
    /// inside the window.
    pub fn apply_insert(&mut self, record: MessageRecord) -> InsertOutcome {
        if self.contains_durable(record.id) {
            return InsertOutcome::Duplicate;
        }

        let matched = self.entries.iter().position(|e| {
            e.id.is_none()
                && e.sender_id == record.sender_id
                && e.body == record.body
                && e.media_url == record.media_url
                && (record.created_at - e.created_at).abs() <= self.window
        });

        match matched {
            Some(idx) => {
                let provisional_id = self.entries[idx]
                    .provisional_id
                    .expect("optimistic entries carry a provisional id");
                let mut merged = Message::from_record(record);
                merged.provisional_id = Some(provisional_id);
                self.entries[idx] = merged;
                InsertOutcome::Reconciled(provisional_id)
            }
            None => {
                self.entries.push(Message::from_record(record));
                InsertOutcome::Appended
            }
        }
    }

    /// Direct-response path: the caller knows which provisional entry this
    /// record acknowledges, so no content heuristic is needed.  Handles the
    /// echo having arrived first in either shape.
    pub fn resolve_provisional(&mut self, provisional_id: ProvisionalId, record: MessageRecord) {
        // Echo already reconciled or appended this durable id?
        if let Some(idx) = self.entries.iter().position(|e| e.id == Some(record.id)) {
            let mut merged = Message::from_record(record);
            merged.provisional_id = self.entries[idx].provisional_id.or(Some(provisional_id));
            self.entries[idx] = merged;
            // Drop a leftover optimistic twin so the message never shows twice.
            self.entries
                .retain(|e| !(e.id.is_none() && e.provisional_id == Some(provisional_id)));
            return;
        }

        if let Some(idx) = self
            .entries
            .iter()
            .position(|e| e.id.is_none() && e.provisional_id == Some(provisional_id))
        {
            let mut merged = Message::from_record(record);
            merged.provisional_id = Some(provisional_id);
            self.entries[idx] = merged;
        } else {
            self.entries.push(Message::from_record(record));
        }
    }

    /// Replace an entry by durable id (edits, status transitions).
    pub fn apply_update(&mut self, record: MessageRecord) -> bool {
        if let Some(idx) = self.entries.iter().position(|e| e.id == Some(record.id)) {
            let provisional_id = self.entries[idx].provisional_id;
            let mut merged = Message::from_record(record);
            merged.provisional_id = provisional_id;
            self.entries[idx] = merged;
            true
        } else {
            false
        }
    }

    pub fn apply_delete(&mut self, id: MessageId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != Some(id));
        self.entries.len() < before
    }

    pub fn mark_failed(&mut self, provisional_id: ProvisionalId) -> bool {
        match self
            .entries
            .iter_mut()
            .find(|e| e.id.is_none() && e.provisional_id == Some(provisional_id))
        {
            Some(entry) => {
                entry.status = DeliveryStatus::Failed;
                entry.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn remove_provisional(&mut self, provisional_id: ProvisionalId) -> Option<Message> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.id.is_none() && e.provisional_id == Some(provisional_id))?;
        Some(self.entries.remove(idx))
    }

    /// Mark the listed durable ids as read (receipt from another participant).
    pub fn mark_read_ids(&mut self, ids: &[MessageId]) -> bool {
        let mut changed = false;
        for entry in &mut self.entries {
            if let Some(id) = entry.id {
                if ids.contains(&id) && entry.status != DeliveryStatus::Read {
                    entry.status = DeliveryStatus::Read;
                    changed = true;
                }
            }
        }
        changed
    }

    pub fn set_status(&mut self, provisional_id: ProvisionalId, status: DeliveryStatus) -> bool {
        match self
            .entries
            .iter_mut()
            .find(|e| e.provisional_id == Some(provisional_id))
        {
            Some(entry) => {
                entry.status = status;
                true
            }
            None => false,
        }
    }

    /// Fold a bulk fetch, then re-sort: authoritative events are not
    /// guaranteed to arrive in creation order across reconnect gaps.
    pub fn load(&mut self, records: Vec<MessageRecord>) {
        for record in records {
            self.apply_insert(record);
        }
        self.sort_by_timestamp();
    }

    /// Stable sort by creation time; reconciled entries keep their position
    /// relative to same-timestamp neighbours.
    pub fn sort_by_timestamp(&mut self) {
        self.entries.sort_by_key(|e| e.created_at);
    }
}
