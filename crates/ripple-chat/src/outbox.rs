//! Offline outbox: durable queue of sends that could not reach the backend.
//!
//! Normally persisted through [`ripple_store::Database`] so pending sends
//! survive a process restart.  Persistence failures are non-fatal: the queue
//! degrades to in-memory-only with a logged warning, accepting message loss
//! on process kill in that mode.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::warn;

use ripple_shared::types::{ChatId, ProvisionalId};
use ripple_store::{Database, OutboxRecord};

pub struct Outbox {
    db: Option<Arc<Mutex<Database>>>,
    fallback: Mutex<Vec<OutboxRecord>>,
    degraded: AtomicBool,
}

impl Outbox {
    pub fn new(db: Option<Arc<Mutex<Database>>>) -> Arc<Self> {
        let degraded = db.is_none();
        if degraded {
            warn!("no local store available; outbox is in-memory only");
        }
        Arc::new(Self {
            db,
            fallback: Mutex::new(Vec::new()),
            degraded: AtomicBool::new(degraded),
        })
    }

    /// Whether the queue lost its persistence and is memory-only.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn enqueue(&self, record: OutboxRecord) {
        if let Some(db) = &self.db {
            match db.lock().expect("store lock").enqueue_outbox(&record) {
                Ok(()) => return,
                Err(e) => {
                    warn!(error = %e, "outbox persistence failed; degrading to in-memory queue");
                    self.degraded.store(true, Ordering::SeqCst);
                }
            }
        }
        self.fallback.lock().expect("outbox lock").push(record);
    }

    pub fn remove(&self, id: ProvisionalId) {
        if let Some(db) = &self.db {
            if let Err(e) = db.lock().expect("store lock").remove_outbox(id) {
                warn!(error = %e, provisional_id = %id, "failed to remove outbox entry");
            }
        }
        self.fallback
            .lock()
            .expect("outbox lock")
            .retain(|r| r.provisional_id != id);
    }

    /// Bump the attempt counter for an entry and return the new count.
    pub fn bump_attempts(&self, id: ProvisionalId) -> u32 {
        {
            let mut fallback = self.fallback.lock().expect("outbox lock");
            if let Some(record) = fallback.iter_mut().find(|r| r.provisional_id == id) {
                record.attempts += 1;
                return record.attempts;
            }
        }
        if let Some(db) = &self.db {
            match db.lock().expect("store lock").bump_outbox_attempts(id) {
                Ok(attempts) => return attempts,
                Err(e) => {
                    warn!(error = %e, provisional_id = %id, "failed to bump outbox attempts");
                }
            }
        }
        1
    }

    /// All pending entries, enqueue-ordered.  Within a chat this order is a
    /// hard guarantee; across chats it carries no meaning.
    pub fn pending(&self) -> Vec<OutboxRecord> {
        let mut records = match &self.db {
            Some(db) => db
                .lock()
                .expect("store lock")
                .pending_outbox()
                .unwrap_or_else(|e| {
                    warn!(error = %e, "failed to read persisted outbox");
                    Vec::new()
                }),
            None => Vec::new(),
        };
        records.extend(self.fallback.lock().expect("outbox lock").iter().cloned());
        records.sort_by_key(|r| r.enqueued_at);
        records
    }

    pub fn pending_for_chat(&self, chat_id: ChatId) -> Vec<OutboxRecord> {
        self.pending()
            .into_iter()
            .filter(|r| r.chat_id == chat_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ripple_shared::types::{MessageDraft, UserId};

    fn record(chat: ChatId, body: &str) -> OutboxRecord {
        OutboxRecord::new(
            ProvisionalId::new(),
            chat,
            UserId::new(),
            MessageDraft::text(body),
            Utc::now(),
        )
    }

    #[test]
    fn memory_only_queue_works_without_a_store() {
        let outbox = Outbox::new(None);
        assert!(outbox.is_degraded());

        let chat = ChatId::new();
        let rec = record(chat, "hi");
        let pid = rec.provisional_id;

        outbox.enqueue(rec);
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox.bump_attempts(pid), 1);
        assert_eq!(outbox.bump_attempts(pid), 2);

        outbox.remove(pid);
        assert!(outbox.is_empty());
    }

    #[test]
    fn persisted_queue_round_trips() {
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let outbox = Outbox::new(Some(db));
        assert!(!outbox.is_degraded());

        let chat = ChatId::new();
        outbox.enqueue(record(chat, "a"));
        outbox.enqueue(record(chat, "b"));

        let pending = outbox.pending_for_chat(chat);
        let bodies: Vec<_> = pending
            .iter()
            .map(|r| r.draft.body.clone().unwrap())
            .collect();
        assert_eq!(bodies, vec!["a", "b"]);
    }
}
