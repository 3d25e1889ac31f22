//! In-memory implementations of the transport traits.
//!
//! `MemoryBus` is a per-topic fan-out over tokio channels with a switchable
//! `online` flag, so connectivity loss and reconnects can be driven
//! deterministically.  `MemoryBackend` keeps rows in maps and publishes the
//! same authoritative echo events a managed backend would, which is what
//! lets the delivery engine's two reconciliation paths (direct response and
//! subscribed echo) both exist locally.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::debug;
use uuid::Uuid;

use ripple_shared::constants::EVENT_CHANNEL_CAPACITY;
use ripple_shared::protocol::{ChatEvent, PresenceUpdate};
use ripple_shared::types::{
    CallLogEntry, CallLogId, CallOutcome, Chat, ChatId, ChatRole, DeliveryStatus, MessageDraft,
    MessageId, MessageRecord, Participant, UserId,
};

use crate::backend::{Backend, BlobStorage, DeleteScope};
use crate::bus::{Envelope, EventBus};
use crate::error::{BackendError, TransportError};

// ---------------------------------------------------------------------------
// MemoryBus
// ---------------------------------------------------------------------------

/// Topic-scoped fan-out bus.  Every subscriber of a topic receives every
/// publish, including the publisher's own subscriptions.
pub struct MemoryBus {
    topics: Mutex<HashMap<String, Vec<mpsc::Sender<Envelope>>>>,
    online_tx: watch::Sender<bool>,
}

impl MemoryBus {
    pub fn new() -> Arc<Self> {
        let (online_tx, _) = watch::channel(true);
        Arc::new(Self {
            topics: Mutex::new(HashMap::new()),
            online_tx,
        })
    }

    /// Flip connectivity.  While offline every publish fails with
    /// [`TransportError::Disconnected`]; flipping back on signals the
    /// connectivity watch.
    pub fn set_online(&self, online: bool) {
        debug!(online, "memory bus connectivity changed");
        // The flag must update even when nobody holds a connectivity
        // receiver at this moment.
        self.online_tx.send_replace(online);
    }

    pub fn is_online(&self) -> bool {
        *self.online_tx.borrow()
    }

    fn senders_for(&self, topic: &str) -> Vec<mpsc::Sender<Envelope>> {
        let mut topics = self.topics.lock().expect("bus lock");
        if let Some(senders) = topics.get_mut(topic) {
            senders.retain(|s| !s.is_closed());
            senders.clone()
        } else {
            Vec::new()
        }
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(
        &self,
        topic: &str,
        payload: serde_json::Value,
    ) -> Result<(), TransportError> {
        if !self.is_online() {
            return Err(TransportError::Disconnected);
        }

        for sender in self.senders_for(topic) {
            let envelope = Envelope {
                topic: topic.to_string(),
                payload: payload.clone(),
            };
            // A slow or dropped subscriber never fails the publish.
            let _ = sender.send(envelope).await;
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Envelope>, TransportError> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.topics
            .lock()
            .expect("bus lock")
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    fn connectivity(&self) -> watch::Receiver<bool> {
        self.online_tx.subscribe()
    }
}

// ---------------------------------------------------------------------------
// MemoryBackend
// ---------------------------------------------------------------------------

#[derive(Default)]
struct BackendState {
    chats: HashMap<ChatId, Chat>,
    messages: HashMap<MessageId, MessageRecord>,
    call_logs: HashMap<CallLogId, CallLogEntry>,
    presence: HashMap<UserId, PresenceUpdate>,
    starred: HashSet<(UserId, MessageId)>,
    pinned: HashSet<(ChatId, MessageId)>,
    hidden_for: HashMap<MessageId, HashSet<UserId>>,
}

/// In-memory data API.  When built over a [`MemoryBus`] it shares the bus's
/// connectivity flag and publishes row-change echoes on `chat:{id}`.
pub struct MemoryBackend {
    state: Mutex<BackendState>,
    bus: Option<Arc<MemoryBus>>,
    online: AtomicBool,
}

impl MemoryBackend {
    pub fn new(bus: Option<Arc<MemoryBus>>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BackendState::default()),
            bus,
            online: AtomicBool::new(true),
        })
    }

    /// Detached connectivity override for tests without a bus.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    fn is_online(&self) -> bool {
        let bus_online = self.bus.as_ref().map(|b| b.is_online()).unwrap_or(true);
        bus_online && self.online.load(Ordering::SeqCst)
    }

    fn ensure_online(&self) -> Result<(), BackendError> {
        if self.is_online() {
            Ok(())
        } else {
            Err(BackendError::Unavailable("offline".into()))
        }
    }

    /// Seed a chat row (test/bootstrap helper).
    pub fn insert_chat(&self, chat: Chat) {
        self.state
            .lock()
            .expect("backend lock")
            .chats
            .insert(chat.id, chat);
    }

    pub fn call_log(&self, id: CallLogId) -> Option<CallLogEntry> {
        self.state
            .lock()
            .expect("backend lock")
            .call_logs
            .get(&id)
            .cloned()
    }

    pub fn call_logs_for_chat(&self, chat_id: ChatId) -> Vec<CallLogEntry> {
        self.state
            .lock()
            .expect("backend lock")
            .call_logs
            .values()
            .filter(|e| e.chat_id == chat_id)
            .cloned()
            .collect()
    }

    async fn echo(&self, chat_id: ChatId, event: ChatEvent) {
        if let Some(bus) = &self.bus {
            // Echo failure mimics a dropped realtime event; at-least-once
            // only holds while connected.
            let _ = bus.publish(&chat_id.chat_topic(), event.to_json()).await;
        }
    }

    fn private_chat(a: UserId, b: UserId) -> Chat {
        let now = Utc::now();
        Chat {
            id: ChatId::new(),
            name: None,
            avatar_url: None,
            is_group: false,
            created_at: now,
            last_activity_at: now,
            participants: vec![
                Participant {
                    user_id: a,
                    role: ChatRole::Member,
                    joined_at: now,
                },
                Participant {
                    user_id: b,
                    role: ChatRole::Member,
                    joined_at: now,
                },
            ],
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn create_message(
        &self,
        chat_id: ChatId,
        sender_id: UserId,
        draft: &MessageDraft,
    ) -> Result<MessageRecord, BackendError> {
        self.ensure_online()?;
        if draft.is_empty() {
            return Err(BackendError::Rejected("empty message".into()));
        }

        let now = Utc::now();
        let record = MessageRecord {
            id: MessageId::new(),
            chat_id,
            sender_id,
            body: draft.body.clone(),
            media_url: draft.media_url.clone(),
            media_kind: draft.media_kind,
            reply_to: draft.reply_to,
            edited: false,
            forwarded: draft.forwarded,
            status: DeliveryStatus::Sent,
            created_at: now,
            updated_at: now,
        };

        {
            let mut state = self.state.lock().expect("backend lock");
            state.messages.insert(record.id, record.clone());
            if let Some(chat) = state.chats.get_mut(&chat_id) {
                chat.last_activity_at = now;
            }
        }

        self.echo(
            chat_id,
            ChatEvent::MessageInserted {
                message: record.clone(),
            },
        )
        .await;

        Ok(record)
    }

    async fn edit_message(
        &self,
        id: MessageId,
        editor: UserId,
        body: String,
    ) -> Result<MessageRecord, BackendError> {
        self.ensure_online()?;

        let record = {
            let mut state = self.state.lock().expect("backend lock");
            let record = state.messages.get_mut(&id).ok_or(BackendError::NotFound)?;
            if record.sender_id != editor {
                return Err(BackendError::Rejected("not the sender".into()));
            }
            record.body = Some(body);
            record.edited = true;
            record.updated_at = Utc::now();
            record.clone()
        };

        self.echo(
            record.chat_id,
            ChatEvent::MessageUpdated {
                message: record.clone(),
            },
        )
        .await;

        Ok(record)
    }

    async fn delete_message(
        &self,
        id: MessageId,
        requester: UserId,
        scope: DeleteScope,
    ) -> Result<(), BackendError> {
        self.ensure_online()?;

        let chat_id = {
            let mut state = self.state.lock().expect("backend lock");
            let record = state.messages.get(&id).ok_or(BackendError::NotFound)?;
            let chat_id = record.chat_id;
            match scope {
                DeleteScope::Me => {
                    state.hidden_for.entry(id).or_default().insert(requester);
                    return Ok(());
                }
                DeleteScope::Everyone => {
                    if record.sender_id != requester {
                        return Err(BackendError::Rejected("not the sender".into()));
                    }
                    state.messages.remove(&id);
                }
            }
            chat_id
        };

        self.echo(chat_id, ChatEvent::MessageDeleted { id }).await;
        Ok(())
    }

    async fn fetch_messages(&self, chat_id: ChatId) -> Result<Vec<MessageRecord>, BackendError> {
        self.ensure_online()?;
        let state = self.state.lock().expect("backend lock");
        let mut rows: Vec<MessageRecord> = state
            .messages
            .values()
            .filter(|m| m.chat_id == chat_id)
            .cloned()
            .collect();
        rows.sort_by_key(|m| m.created_at);
        Ok(rows)
    }

    async fn mark_read(
        &self,
        chat_id: ChatId,
        reader: UserId,
        message_ids: &[MessageId],
    ) -> Result<(), BackendError> {
        self.ensure_online()?;

        let updated: Vec<MessageRecord> = {
            let mut state = self.state.lock().expect("backend lock");
            message_ids
                .iter()
                .filter_map(|id| {
                    let record = state.messages.get_mut(id)?;
                    if record.sender_id == reader {
                        return None;
                    }
                    record.status = DeliveryStatus::Read;
                    record.updated_at = Utc::now();
                    Some(record.clone())
                })
                .collect()
        };

        for record in updated {
            self.echo(chat_id, ChatEvent::MessageUpdated { message: record })
                .await;
        }
        Ok(())
    }

    async fn find_or_create_private_chat(
        &self,
        a: UserId,
        b: UserId,
    ) -> Result<Chat, BackendError> {
        self.ensure_online()?;
        let mut state = self.state.lock().expect("backend lock");

        let existing = state.chats.values().find(|c| {
            !c.is_group
                && c.participants.len() == 2
                && c.has_participant(a)
                && c.has_participant(b)
        });
        if let Some(chat) = existing {
            return Ok(chat.clone());
        }

        let chat = Self::private_chat(a, b);
        state.chats.insert(chat.id, chat.clone());
        Ok(chat)
    }

    async fn get_chat(&self, id: ChatId) -> Result<Chat, BackendError> {
        self.ensure_online()?;
        self.state
            .lock()
            .expect("backend lock")
            .chats
            .get(&id)
            .cloned()
            .ok_or(BackendError::NotFound)
    }

    async fn chats_for_user(&self, user: UserId) -> Result<Vec<Chat>, BackendError> {
        self.ensure_online()?;
        let state = self.state.lock().expect("backend lock");
        Ok(state
            .chats
            .values()
            .filter(|c| c.has_participant(user))
            .cloned()
            .collect())
    }

    async fn upsert_presence(&self, update: &PresenceUpdate) -> Result<(), BackendError> {
        self.ensure_online()?;
        self.state
            .lock()
            .expect("backend lock")
            .presence
            .insert(update.user_id, update.clone());
        Ok(())
    }

    async fn create_call_log(&self, entry: &CallLogEntry) -> Result<CallLogId, BackendError> {
        self.ensure_online()?;
        let id = CallLogId::new();
        self.state
            .lock()
            .expect("backend lock")
            .call_logs
            .insert(id, entry.clone());
        Ok(id)
    }

    async fn update_call_log(
        &self,
        id: CallLogId,
        outcome: CallOutcome,
        duration_secs: Option<i64>,
    ) -> Result<(), BackendError> {
        self.ensure_online()?;
        let mut state = self.state.lock().expect("backend lock");
        let entry = state.call_logs.get_mut(&id).ok_or(BackendError::NotFound)?;
        entry.outcome = outcome;
        entry.duration_secs = duration_secs;
        Ok(())
    }

    async fn set_starred(
        &self,
        user: UserId,
        message_id: MessageId,
        starred: bool,
    ) -> Result<(), BackendError> {
        self.ensure_online()?;
        let mut state = self.state.lock().expect("backend lock");
        if starred {
            state.starred.insert((user, message_id));
        } else {
            state.starred.remove(&(user, message_id));
        }
        Ok(())
    }

    async fn set_pinned(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        pinned: bool,
    ) -> Result<(), BackendError> {
        self.ensure_online()?;
        let mut state = self.state.lock().expect("backend lock");
        if pinned {
            state.pinned.insert((chat_id, message_id));
        } else {
            state.pinned.remove(&(chat_id, message_id));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryBlobs
// ---------------------------------------------------------------------------

/// Blob store returning synthetic URLs; content is kept for assertions.
#[derive(Default)]
pub struct MemoryBlobs {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, url: &str) -> Option<Vec<u8>> {
        self.blobs.lock().expect("blob lock").get(url).cloned()
    }
}

#[async_trait]
impl BlobStorage for MemoryBlobs {
    async fn upload(&self, file_name: &str, bytes: Vec<u8>) -> Result<String, BackendError> {
        let url = format!("memory://blobs/{}/{}", Uuid::new_v4(), file_name);
        self.blobs
            .lock()
            .expect("blob lock")
            .insert(url.clone(), bytes);
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let bus = MemoryBus::new();
        let mut rx1 = bus.subscribe("chat:x").await.unwrap();
        let mut rx2 = bus.subscribe("chat:x").await.unwrap();
        let mut other = bus.subscribe("chat:y").await.unwrap();

        bus.publish("chat:x", serde_json::json!({"n": 1}))
            .await
            .unwrap();

        assert_eq!(rx1.recv().await.unwrap().payload["n"], 1);
        assert_eq!(rx2.recv().await.unwrap().payload["n"], 1);
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_fails_while_offline() {
        let bus = MemoryBus::new();
        bus.set_online(false);
        let err = bus
            .publish("chat:x", serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Disconnected));
    }

    #[tokio::test]
    async fn connectivity_flip_lands_without_subscribers() {
        let bus = MemoryBus::new();
        // No receiver exists while the flag flips.
        bus.set_online(false);
        assert!(!bus.is_online());
        assert!(!*bus.connectivity().borrow());
        assert!(bus.publish("chat:x", serde_json::Value::Null).await.is_err());
    }

    #[tokio::test]
    async fn connectivity_watch_signals_reconnect() {
        let bus = MemoryBus::new();
        let mut watch = bus.connectivity();
        bus.set_online(false);
        watch.changed().await.unwrap();
        assert!(!*watch.borrow());
        bus.set_online(true);
        watch.changed().await.unwrap();
        assert!(*watch.borrow());
    }

    #[tokio::test]
    async fn private_chat_create_is_idempotent() {
        let backend = MemoryBackend::new(None);
        let (a, b) = (UserId::new(), UserId::new());

        let first = backend.find_or_create_private_chat(a, b).await.unwrap();
        let second = backend.find_or_create_private_chat(b, a).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.participants.len(), 2);
    }

    #[tokio::test]
    async fn only_the_sender_may_edit() {
        let backend = MemoryBackend::new(None);
        let sender = UserId::new();
        let chat = ChatId::new();

        let record = backend
            .create_message(chat, sender, &MessageDraft::text("hi"))
            .await
            .unwrap();

        let err = backend
            .edit_message(record.id, UserId::new(), "hacked".into())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Rejected(_)));

        let edited = backend
            .edit_message(record.id, sender, "hi there".into())
            .await
            .unwrap();
        assert!(edited.edited);
        assert_eq!(edited.body.as_deref(), Some("hi there"));
    }

    #[tokio::test]
    async fn create_message_echoes_on_chat_topic() {
        let bus = MemoryBus::new();
        let backend = MemoryBackend::new(Some(bus.clone()));
        let chat = ChatId::new();
        let mut rx = bus.subscribe(&chat.chat_topic()).await.unwrap();

        let record = backend
            .create_message(chat, UserId::new(), &MessageDraft::text("echo me"))
            .await
            .unwrap();

        let envelope = rx.recv().await.unwrap();
        match ChatEvent::from_json(&envelope.payload).unwrap() {
            ChatEvent::MessageInserted { message } => assert_eq!(message.id, record.id),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn blob_upload_returns_opaque_url() {
        let blobs = MemoryBlobs::new();
        let url = blobs.upload("pic.png", vec![1, 2, 3]).await.unwrap();
        assert_eq!(blobs.get(&url).unwrap(), vec![1, 2, 3]);
    }
}
