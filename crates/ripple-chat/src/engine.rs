//! Per-chat message delivery engine.
//!
//! Owns the lifecycle of one chat's message list: optimistic insertion,
//! reconciliation against authoritative events from the subscribed topic,
//! retry/failure marking, and the UI-facing operations (send, edit, delete,
//! resend, read receipts).  External code talks to the engine and receives
//! [`ChatUpdate`] notifications over a channel, mirroring the
//! command/notification split used across the workspace.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use ripple_shared::constants::{
    EVENT_CHANNEL_CAPACITY, RECONCILE_WINDOW_SECS, STATUS_MAP_TTL_SECS, TYPING_STOP_DELAY_MS,
};
use ripple_shared::protocol::{ChatEvent, TypingEvent};
use ripple_shared::types::{
    ChatId, DeliveryStatus, MessageDraft, MessageId, MessageRecord, ProvisionalId, UserId,
};
use ripple_store::{Database, OutboxRecord};
use ripple_transport::{Backend, DeleteScope, EventBus};

use crate::error::ChatError;
use crate::outbox::Outbox;
use crate::timeline::{InsertOutcome, Message, Timeline};
use crate::typing::TypingNotifier;

/// Tunables; defaults come from the shared constants.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub reconcile_window_secs: i64,
    pub typing_stop_delay: Duration,
    /// Disables outbound read-receipt broadcasts only; persistence of read
    /// state is unaffected.
    pub broadcast_read_receipts: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            reconcile_window_secs: RECONCILE_WINDOW_SECS,
            typing_stop_delay: Duration::from_millis(TYPING_STOP_DELAY_MS),
            broadcast_read_receipts: true,
        }
    }
}

/// Notifications pushed to the view layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatUpdate {
    /// The visible sequence changed; pull a fresh snapshot.
    MessagesChanged,
    /// A participant's typing indicator flipped.
    Typing { user_id: UserId, active: bool },
    /// A send is permanently failed (attempts exhausted or rejected on
    /// replay); the bubble stays visible and resendable.
    SendFailed { provisional_id: ProvisionalId },
}

pub struct ChatEngine {
    chat_id: ChatId,
    local_user: UserId,
    backend: Arc<dyn Backend>,
    bus: Arc<dyn EventBus>,
    outbox: Arc<Outbox>,
    db: Option<Arc<Mutex<Database>>>,
    timeline: Mutex<Timeline>,
    updates_tx: mpsc::Sender<ChatUpdate>,
    typing: TypingNotifier,
    broadcast_read_receipts: bool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChatEngine {
    /// Open a chat: subscribe its topics, fetch history, restore pending
    /// outbox entries, and start folding inbound events.
    ///
    /// Opening while offline is fine; the history fetch is skipped with a
    /// warning and the timeline starts from the persisted outbox alone.
    pub async fn open(
        chat_id: ChatId,
        local_user: UserId,
        backend: Arc<dyn Backend>,
        bus: Arc<dyn EventBus>,
        outbox: Arc<Outbox>,
        db: Option<Arc<Mutex<Database>>>,
        config: ChatConfig,
    ) -> Result<(Arc<Self>, mpsc::Receiver<ChatUpdate>), ChatError> {
        // Subscribe before fetching so no event falls into the gap.
        let mut chat_rx = bus.subscribe(&chat_id.chat_topic()).await?;
        let mut typing_rx = bus.subscribe(&chat_id.typing_topic()).await?;

        let (updates_tx, updates_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let mut timeline = Timeline::new(config.reconcile_window_secs);
        match backend.fetch_messages(chat_id).await {
            Ok(records) => timeline.load(records),
            Err(e) if e.is_transient() => {
                warn!(chat_id = %chat_id, error = %e, "history fetch skipped while offline")
            }
            Err(e) => return Err(e.into()),
        }

        if let Some(db) = &db {
            let guard = db.lock().expect("store lock");
            if let Err(e) = guard.purge_stale_statuses(STATUS_MAP_TTL_SECS) {
                warn!(error = %e, "failed to purge stale status entries");
            }
        }

        // Pending sends from a previous run reappear as optimistic bubbles;
        // the status map bridges entries whose fate was recorded but whose
        // timeline update was lost to a restart.
        for pending in outbox.pending_for_chat(chat_id) {
            if timeline.by_provisional(pending.provisional_id).is_some() {
                continue;
            }
            let mut entry = Message::optimistic(
                pending.provisional_id,
                chat_id,
                pending.sender_id,
                &pending.draft,
                pending.enqueued_at,
            );
            if let Some(db) = &db {
                let status = db
                    .lock()
                    .expect("store lock")
                    .get_status(pending.provisional_id)
                    .ok()
                    .flatten();
                if let Some(rec) = status {
                    entry.status = rec.status;
                }
            }
            timeline.push_optimistic(entry);
        }
        timeline.sort_by_timestamp();

        let typing = TypingNotifier::new(bus.clone(), chat_id, local_user, config.typing_stop_delay);

        let engine = Arc::new(Self {
            chat_id,
            local_user,
            backend,
            bus,
            outbox,
            db,
            timeline: Mutex::new(timeline),
            updates_tx,
            typing,
            broadcast_read_receipts: config.broadcast_read_receipts,
            tasks: Mutex::new(Vec::new()),
        });

        let listener = {
            let engine = engine.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        envelope = chat_rx.recv() => {
                            let Some(envelope) = envelope else { break };
                            match ChatEvent::from_json(&envelope.payload) {
                                Ok(event) => engine.handle_chat_event(event),
                                Err(e) => {
                                    debug!(chat_id = %engine.chat_id, error = %e, "ignoring malformed chat payload")
                                }
                            }
                        }
                        envelope = typing_rx.recv() => {
                            let Some(envelope) = envelope else { break };
                            match TypingEvent::from_json(&envelope.payload) {
                                Ok(event) => engine.handle_typing_event(event),
                                Err(e) => {
                                    debug!(chat_id = %engine.chat_id, error = %e, "ignoring malformed typing payload")
                                }
                            }
                        }
                    }
                }
            })
        };
        engine.tasks.lock().expect("task lock").push(listener);

        Ok((engine, updates_rx))
    }

    pub fn chat_id(&self) -> ChatId {
        self.chat_id
    }

    /// Snapshot of the visible sequence.
    pub fn messages(&self) -> Vec<Message> {
        self.timeline.lock().expect("timeline lock").entries().to_vec()
    }

    /// Send a message.
    ///
    /// The optimistic bubble appears before any network I/O; the only
    /// suspension point is the backend write.  A transient failure diverts
    /// into the outbox (status stays `sending`), a terminal one marks the
    /// bubble `failed` and returns the error.
    pub async fn send(&self, draft: MessageDraft) -> Result<ProvisionalId, ChatError> {
        if draft.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let provisional_id = ProvisionalId::new();
        let created_at = Utc::now();
        let entry = Message::optimistic(
            provisional_id,
            self.chat_id,
            self.local_user,
            &draft,
            created_at,
        );

        self.timeline
            .lock()
            .expect("timeline lock")
            .push_optimistic(entry);
        self.record_status(provisional_id, DeliveryStatus::Sending);
        self.notify(ChatUpdate::MessagesChanged);

        // A send also ends the local typing burst.
        self.typing.stop().await;

        match self
            .backend
            .create_message(self.chat_id, self.local_user, &draft)
            .await
        {
            Ok(record) => {
                debug!(chat_id = %self.chat_id, durable_id = %record.id, "send acknowledged");
                self.resolve_delivery(provisional_id, record);
                Ok(provisional_id)
            }
            Err(e) if e.is_transient() => {
                info!(chat_id = %self.chat_id, provisional_id = %provisional_id, "send queued for replay");
                self.outbox.enqueue(OutboxRecord::new(
                    provisional_id,
                    self.chat_id,
                    self.local_user,
                    draft,
                    created_at,
                ));
                Ok(provisional_id)
            }
            Err(e) => {
                warn!(chat_id = %self.chat_id, error = %e, "send rejected");
                self.mark_send_failed(provisional_id);
                Err(e.into())
            }
        }
    }

    /// Resubmit a permanently failed message under a fresh provisional id.
    pub async fn resend(&self, provisional_id: ProvisionalId) -> Result<ProvisionalId, ChatError> {
        let draft = {
            let mut timeline = self.timeline.lock().expect("timeline lock");
            let entry = timeline
                .by_provisional(provisional_id)
                .ok_or(ChatError::UnknownProvisional)?;
            if entry.status != DeliveryStatus::Failed {
                return Err(ChatError::NotResendable);
            }
            let draft = entry.draft();
            timeline.remove_provisional(provisional_id);
            draft
        };
        self.notify(ChatUpdate::MessagesChanged);
        self.send(draft).await
    }

    /// Edit by durable id.  The backend enforces sender authorization; a
    /// denial surfaces here as a rejected error.
    pub async fn edit(&self, id: MessageId, body: String) -> Result<(), ChatError> {
        let record = self.backend.edit_message(id, self.local_user, body).await?;
        let changed = self
            .timeline
            .lock()
            .expect("timeline lock")
            .apply_update(record);
        if changed {
            self.notify(ChatUpdate::MessagesChanged);
        }
        Ok(())
    }

    pub async fn delete(&self, id: MessageId, scope: DeleteScope) -> Result<(), ChatError> {
        self.backend
            .delete_message(id, self.local_user, scope)
            .await?;
        // Delete-for-me produces no echo; apply locally either way (the
        // echoed delete is a no-op on an already-removed id).
        let changed = self
            .timeline
            .lock()
            .expect("timeline lock")
            .apply_delete(id);
        if changed {
            self.notify(ChatUpdate::MessagesChanged);
        }
        Ok(())
    }

    /// Persist read state and (policy permitting) broadcast the receipt so
    /// peers see the tick without a refetch.
    pub async fn mark_read(&self, message_ids: Vec<MessageId>) -> Result<(), ChatError> {
        if message_ids.is_empty() {
            return Ok(());
        }

        self.backend
            .mark_read(self.chat_id, self.local_user, &message_ids)
            .await?;

        if self.broadcast_read_receipts {
            let event = ChatEvent::ReadReceipt {
                user_id: self.local_user,
                message_ids,
            };
            if let Err(e) = self
                .bus
                .publish(&self.chat_id.chat_topic(), event.to_json())
                .await
            {
                debug!(chat_id = %self.chat_id, error = %e, "read receipt broadcast dropped");
            }
        }
        Ok(())
    }

    pub async fn star(&self, id: MessageId, starred: bool) -> Result<(), ChatError> {
        self.backend.set_starred(self.local_user, id, starred).await?;
        Ok(())
    }

    pub async fn pin(&self, id: MessageId, pinned: bool) -> Result<(), ChatError> {
        self.backend.set_pinned(self.chat_id, id, pinned).await?;
        Ok(())
    }

    /// Local keystroke; debounced typing broadcast.
    pub async fn input_activity(&self) {
        self.typing.input_activity().await;
    }

    /// Fold an acknowledged replay (or direct response) into the timeline.
    pub fn resolve_delivery(&self, provisional_id: ProvisionalId, record: MessageRecord) {
        self.timeline
            .lock()
            .expect("timeline lock")
            .resolve_provisional(provisional_id, record);
        self.outbox.remove(provisional_id);
        self.record_status(provisional_id, DeliveryStatus::Sent);
        self.notify(ChatUpdate::MessagesChanged);
    }

    /// Mark a send permanently failed (terminal rejection or dead outbox
    /// entry).  The bubble remains visible and resendable.
    pub fn mark_send_failed(&self, provisional_id: ProvisionalId) {
        self.timeline
            .lock()
            .expect("timeline lock")
            .mark_failed(provisional_id);
        self.record_status(provisional_id, DeliveryStatus::Failed);
        self.notify(ChatUpdate::SendFailed { provisional_id });
        self.notify(ChatUpdate::MessagesChanged);
    }

    /// Unmount: stop listening immediately.  In-flight sends are not
    /// cancelled; their completions still reconcile this chat's state.
    pub async fn close(&self) {
        self.typing.stop().await;
        for task in self.tasks.lock().expect("task lock").drain(..) {
            task.abort();
        }
    }

    fn handle_chat_event(&self, event: ChatEvent) {
        match event {
            ChatEvent::MessageInserted { message } => {
                if message.chat_id != self.chat_id {
                    return;
                }
                let outcome = self
                    .timeline
                    .lock()
                    .expect("timeline lock")
                    .apply_insert(message);
                match outcome {
                    InsertOutcome::Duplicate => {}
                    InsertOutcome::Reconciled(provisional_id) => {
                        // The echo won the race against the direct response.
                        self.outbox.remove(provisional_id);
                        self.record_status(provisional_id, DeliveryStatus::Sent);
                        self.notify(ChatUpdate::MessagesChanged);
                    }
                    InsertOutcome::Appended => self.notify(ChatUpdate::MessagesChanged),
                }
            }
            ChatEvent::MessageUpdated { message } => {
                if message.chat_id != self.chat_id {
                    return;
                }
                let changed = self
                    .timeline
                    .lock()
                    .expect("timeline lock")
                    .apply_update(message);
                if changed {
                    self.notify(ChatUpdate::MessagesChanged);
                }
            }
            ChatEvent::MessageDeleted { id } => {
                let changed = self
                    .timeline
                    .lock()
                    .expect("timeline lock")
                    .apply_delete(id);
                if changed {
                    self.notify(ChatUpdate::MessagesChanged);
                }
            }
            ChatEvent::ReadReceipt {
                user_id,
                message_ids,
            } => {
                if user_id == self.local_user {
                    return;
                }
                let changed = self
                    .timeline
                    .lock()
                    .expect("timeline lock")
                    .mark_read_ids(&message_ids);
                if changed {
                    self.notify(ChatUpdate::MessagesChanged);
                }
            }
        }
    }

    fn handle_typing_event(&self, event: TypingEvent) {
        if event.user_id == self.local_user {
            return;
        }
        self.notify(ChatUpdate::Typing {
            user_id: event.user_id,
            active: event.active,
        });
    }

    fn record_status(&self, provisional_id: ProvisionalId, status: DeliveryStatus) {
        if let Some(db) = &self.db {
            let guard = db.lock().expect("store lock");
            if let Err(e) = guard.upsert_status(provisional_id, status) {
                warn!(error = %e, "failed to record delivery status");
            }
        }
    }

    fn notify(&self, update: ChatUpdate) {
        // The UI pulls snapshots; dropping a notification under backpressure
        // is harmless.
        let _ = self.updates_tx.try_send(update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripple_shared::types::{Chat, ChatRole, Participant};
    use ripple_transport::memory::{MemoryBackend, MemoryBus};

    async fn setup() -> (
        Arc<MemoryBus>,
        Arc<MemoryBackend>,
        ChatId,
        UserId,
        UserId,
    ) {
        let bus = MemoryBus::new();
        let backend = MemoryBackend::new(Some(bus.clone()));
        let me = UserId::new();
        let peer = UserId::new();
        let chat_id = ChatId::new();
        backend.insert_chat(Chat {
            id: chat_id,
            name: None,
            avatar_url: None,
            is_group: false,
            created_at: Utc::now(),
            last_activity_at: Utc::now(),
            participants: vec![
                Participant {
                    user_id: me,
                    role: ChatRole::Member,
                    joined_at: Utc::now(),
                },
                Participant {
                    user_id: peer,
                    role: ChatRole::Member,
                    joined_at: Utc::now(),
                },
            ],
        });
        (bus, backend, chat_id, me, peer)
    }

    async fn open_engine(
        bus: Arc<MemoryBus>,
        backend: Arc<MemoryBackend>,
        chat_id: ChatId,
        me: UserId,
    ) -> (Arc<ChatEngine>, mpsc::Receiver<ChatUpdate>, Arc<Outbox>) {
        let outbox = Outbox::new(None);
        let (engine, updates) = ChatEngine::open(
            chat_id,
            me,
            backend,
            bus,
            outbox.clone(),
            None,
            ChatConfig::default(),
        )
        .await
        .unwrap();
        (engine, updates, outbox)
    }

    async fn settle() {
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
    }

    #[tokio::test]
    async fn send_online_reconciles_without_duplicates() {
        let (bus, backend, chat_id, me, _) = setup().await;
        let (engine, _updates, outbox) = open_engine(bus, backend, chat_id, me).await;

        let pid = engine.send(MessageDraft::text("hello")).await.unwrap();
        // Let the echoed insert land too; it must fold into the same entry.
        settle().await;

        let messages = engine.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].provisional_id, Some(pid));
        assert!(messages[0].id.is_some());
        assert_eq!(messages[0].status, DeliveryStatus::Sent);
        assert!(outbox.is_empty());
    }

    #[tokio::test]
    async fn send_offline_stays_sending_and_enqueues() {
        let (bus, backend, chat_id, me, _) = setup().await;
        let (engine, _updates, outbox) =
            open_engine(bus, backend.clone(), chat_id, me).await;

        backend.set_online(false);
        let pid = engine.send(MessageDraft::text("hi")).await.unwrap();

        let messages = engine.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].status, DeliveryStatus::Sending);
        assert!(messages[0].id.is_none());
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox.pending()[0].provisional_id, pid);
    }

    #[tokio::test]
    async fn empty_drafts_are_rejected_before_any_io() {
        let (bus, backend, chat_id, me, _) = setup().await;
        let (engine, _updates, _outbox) = open_engine(bus, backend, chat_id, me).await;

        let err = engine.send(MessageDraft::text("   ")).await.unwrap_err();
        assert!(matches!(err, ChatError::EmptyMessage));
        assert!(engine.messages().is_empty());
    }

    #[tokio::test]
    async fn peer_messages_append_and_notify() {
        let (bus, backend, chat_id, me, peer) = setup().await;
        let (engine, mut updates, _outbox) =
            open_engine(bus, backend.clone(), chat_id, me).await;

        backend
            .create_message(chat_id, peer, &MessageDraft::text("hey there"))
            .await
            .unwrap();
        settle().await;

        assert_eq!(engine.messages().len(), 1);
        assert_eq!(engine.messages()[0].sender_id, peer);
        assert_eq!(updates.recv().await, Some(ChatUpdate::MessagesChanged));
    }

    #[tokio::test]
    async fn peer_typing_events_surface_local_ones_do_not() {
        let (bus, backend, chat_id, me, peer) = setup().await;
        let (_engine, mut updates, _outbox) =
            open_engine(bus.clone(), backend, chat_id, me).await;

        let own = TypingEvent {
            user_id: me,
            active: true,
        };
        bus.publish(&chat_id.typing_topic(), own.to_json())
            .await
            .unwrap();
        let theirs = TypingEvent {
            user_id: peer,
            active: true,
        };
        bus.publish(&chat_id.typing_topic(), theirs.to_json())
            .await
            .unwrap();
        settle().await;

        assert_eq!(
            updates.recv().await,
            Some(ChatUpdate::Typing {
                user_id: peer,
                active: true
            })
        );
    }

    #[tokio::test]
    async fn read_receipts_from_peers_mark_messages_read() {
        let (bus, backend, chat_id, me, peer) = setup().await;
        let (engine, _updates, _outbox) =
            open_engine(bus.clone(), backend, chat_id, me).await;

        engine.send(MessageDraft::text("seen yet?")).await.unwrap();
        settle().await;
        let durable_id = engine.messages()[0].id.unwrap();

        let receipt = ChatEvent::ReadReceipt {
            user_id: peer,
            message_ids: vec![durable_id],
        };
        bus.publish(&chat_id.chat_topic(), receipt.to_json())
            .await
            .unwrap();
        settle().await;

        assert_eq!(engine.messages()[0].status, DeliveryStatus::Read);
    }

    #[tokio::test]
    async fn failed_sends_can_be_resent_under_a_new_id() {
        let (bus, backend, chat_id, me, _) = setup().await;
        let (engine, _updates, outbox) =
            open_engine(bus, backend.clone(), chat_id, me).await;

        backend.set_online(false);
        let pid = engine.send(MessageDraft::text("retry me")).await.unwrap();
        // Replay gave up on this entry.
        outbox.remove(pid);
        engine.mark_send_failed(pid);
        assert_eq!(engine.messages()[0].status, DeliveryStatus::Failed);

        backend.set_online(true);
        let new_pid = engine.resend(pid).await.unwrap();
        settle().await;

        assert_ne!(new_pid, pid);
        let messages = engine.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].status, DeliveryStatus::Sent);
        assert_eq!(messages[0].body.as_deref(), Some("retry me"));
    }

    #[tokio::test]
    async fn resend_requires_a_failed_entry() {
        let (bus, backend, chat_id, me, _) = setup().await;
        let (engine, _updates, _outbox) =
            open_engine(bus, backend.clone(), chat_id, me).await;

        backend.set_online(false);
        let pid = engine.send(MessageDraft::text("still pending")).await.unwrap();

        assert!(matches!(
            engine.resend(pid).await,
            Err(ChatError::NotResendable)
        ));
        assert!(matches!(
            engine.resend(ProvisionalId::new()).await,
            Err(ChatError::UnknownProvisional)
        ));
    }

    #[tokio::test]
    async fn open_restores_pending_sends_from_the_outbox() {
        let (bus, backend, chat_id, me, _) = setup().await;

        let outbox = Outbox::new(None);
        let pid = ProvisionalId::new();
        outbox.enqueue(OutboxRecord::new(
            pid,
            chat_id,
            me,
            MessageDraft::text("written before the restart"),
            Utc::now(),
        ));

        let (engine, _updates) = ChatEngine::open(
            chat_id,
            me,
            backend,
            bus,
            outbox,
            None,
            ChatConfig::default(),
        )
        .await
        .unwrap();

        let messages = engine.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].provisional_id, Some(pid));
        assert_eq!(messages[0].status, DeliveryStatus::Sending);
    }

    #[tokio::test]
    async fn edit_denied_for_non_sender_surfaces_rejection() {
        let (bus, backend, chat_id, me, peer) = setup().await;
        let (engine, _updates, _outbox) =
            open_engine(bus, backend.clone(), chat_id, me).await;

        let record = backend
            .create_message(chat_id, peer, &MessageDraft::text("theirs"))
            .await
            .unwrap();
        settle().await;

        let err = engine
            .edit(record.id, "mine now".into())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ChatError::Backend(ripple_transport::BackendError::Rejected(_))
        ));
        assert_eq!(engine.messages()[0].body.as_deref(), Some("theirs"));
    }
}
