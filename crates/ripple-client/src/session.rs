//! The signed-in session.
//!
//! [`RtcSession`] owns every long-lived piece of the real-time layer: the
//! persisted outbox and its replayer, the presence tracker, the call
//! notification listener, plus the currently open chat engines and call
//! managers.  It is created on sign-in and torn down on sign-out; nothing
//! here outlives it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{bail, Context, Result};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use ripple_call::{CallManager, CallNotificationListener, CallState, IncomingCall, MediaProvider};
use ripple_chat::{
    ChatConfig, ChatEngine, ChatUpdate, Outbox, PresenceTracker, ReplayEvent, Replayer,
};
use ripple_shared::types::{CallKind, Chat, ChatId, DeliveryStatus, PresenceRecord, UserId};
use ripple_store::Database;
use ripple_transport::{Backend, EventBus};

use crate::config::ClientConfig;

pub struct RtcSession {
    local_user: UserId,
    backend: Arc<dyn Backend>,
    bus: Arc<dyn EventBus>,
    media: Arc<dyn MediaProvider>,
    config: ClientConfig,
    db: Option<Arc<StdMutex<Database>>>,
    outbox: Arc<Outbox>,
    presence: Arc<PresenceTracker>,
    call_listener: Arc<CallNotificationListener>,
    chats: Mutex<HashMap<ChatId, Arc<ChatEngine>>>,
    calls: Mutex<HashMap<ChatId, Arc<CallManager>>>,
    call_states: StdMutex<HashMap<ChatId, watch::Receiver<CallState>>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl RtcSession {
    /// Sign in: open the store, start the replayer, presence heartbeats and
    /// the incoming-call watcher.
    pub async fn sign_in(
        local_user: UserId,
        backend: Arc<dyn Backend>,
        bus: Arc<dyn EventBus>,
        media: Arc<dyn MediaProvider>,
        config: ClientConfig,
    ) -> Result<Arc<Self>> {
        let db = if config.persist_outbox {
            let database = match &config.store_path {
                Some(path) => Database::open_at(path).context("opening outbox store")?,
                None => Database::new().context("opening outbox store")?,
            };
            Some(Arc::new(StdMutex::new(database)))
        } else {
            None
        };

        let outbox = Outbox::new(db.clone());
        let (replayer, replay_rx) = Replayer::new(
            outbox.clone(),
            backend.clone(),
            config.max_send_attempts,
            config.backoff_initial_ms,
            config.backoff_max_ms,
        );

        let presence = PresenceTracker::spawn(
            local_user,
            backend.clone(),
            bus.clone(),
            config.heartbeat_interval,
        )
        .await
        .context("starting presence tracker")?;

        let call_listener = CallNotificationListener::spawn(local_user, backend.clone(), bus.clone())
            .await
            .context("starting call listener")?;

        let session = Arc::new(Self {
            local_user,
            backend,
            bus: bus.clone(),
            media,
            config,
            db,
            outbox,
            presence,
            call_listener,
            chats: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            call_states: StdMutex::new(HashMap::new()),
            tasks: StdMutex::new(Vec::new()),
        });

        let replay_task = replayer.spawn(bus.connectivity());
        let router_task = session.clone().spawn_replay_router(replay_rx);
        session
            .tasks
            .lock()
            .expect("task lock")
            .extend([replay_task, router_task]);

        info!(user = %local_user, "session started");
        Ok(session)
    }

    pub fn user_id(&self) -> UserId {
        self.local_user
    }

    pub fn is_online(&self) -> bool {
        *self.bus.connectivity().borrow()
    }

    pub fn outbox_len(&self) -> usize {
        self.outbox.len()
    }

    // ---- chats ----------------------------------------------------------

    /// Open a chat view; returns the engine plus its update stream.
    /// Reopening an already open chat is rejected so two views never race
    /// one update channel.
    pub async fn open_chat(
        &self,
        chat_id: ChatId,
    ) -> Result<(Arc<ChatEngine>, mpsc::Receiver<ChatUpdate>)> {
        let mut chats = self.chats.lock().await;
        if chats.contains_key(&chat_id) {
            bail!("chat {chat_id} is already open");
        }

        let chat_config = ChatConfig {
            reconcile_window_secs: self.config.reconcile_window_secs,
            broadcast_read_receipts: self.config.broadcast_read_receipts,
            ..ChatConfig::default()
        };
        let (engine, updates) = ChatEngine::open(
            chat_id,
            self.local_user,
            self.backend.clone(),
            self.bus.clone(),
            self.outbox.clone(),
            self.db.clone(),
            chat_config,
        )
        .await
        .with_context(|| format!("opening chat {chat_id}"))?;

        chats.insert(chat_id, engine.clone());
        self.presence.set_viewing(Some(chat_id));

        // The chat may postdate sign-in; make sure its call topic is
        // watched.  Best effort, the chat itself works without it.
        match self.backend.get_chat(chat_id).await {
            Ok(chat) => self.watch_chat_for_calls(chat).await,
            Err(e) => debug!(chat_id = %chat_id, error = %e, "chat row unavailable, call watch deferred"),
        }
        Ok((engine, updates))
    }

    /// Unmount a chat view.  Pending sends for it stay in the outbox and
    /// keep replaying; only the listener tasks stop.
    pub async fn close_chat(&self, chat_id: ChatId) {
        if let Some(engine) = self.chats.lock().await.remove(&chat_id) {
            engine.close().await;
        }
        self.presence.set_viewing(None);
    }

    /// Idempotent: a second private chat with the same peer resolves to the
    /// existing one.
    pub async fn start_private_chat(&self, peer: UserId) -> Result<Chat> {
        let chat = self
            .backend
            .find_or_create_private_chat(self.local_user, peer)
            .await
            .context("creating private chat")?;
        // A chat created mid-session must ring like any other.
        self.watch_chat_for_calls(chat.clone()).await;
        Ok(chat)
    }

    pub async fn chats(&self) -> Result<Vec<Chat>> {
        Ok(self.backend.chats_for_user(self.local_user).await?)
    }

    // ---- presence -------------------------------------------------------

    pub fn is_user_online(&self, user: UserId) -> bool {
        self.presence.is_online(user)
    }

    pub fn is_viewing_chat(&self, user: UserId, chat: ChatId) -> bool {
        self.presence.is_viewing_chat(user, chat)
    }

    pub fn presence_snapshot(&self) -> HashMap<UserId, PresenceRecord> {
        self.presence.snapshot()
    }

    // ---- calls ----------------------------------------------------------

    /// Place a call in a private chat.  Rejected while any call in that
    /// chat is active.
    pub async fn call(&self, chat_id: ChatId, kind: CallKind) -> Result<()> {
        let manager = self.call_manager(chat_id).await?;
        manager.start_call(kind).await?;
        Ok(())
    }

    /// Observable state of the chat's call session, if one was ever set up.
    pub fn call_state(&self, chat_id: ChatId) -> Option<watch::Receiver<CallState>> {
        self.call_states
            .lock()
            .expect("state lock")
            .get(&chat_id)
            .cloned()
    }

    /// The currently ringing inbound offer, if any.
    pub fn incoming_call(&self) -> watch::Receiver<Option<IncomingCall>> {
        self.call_listener.incoming()
    }

    /// Accept the ringing offer: hands its SDP to the chat's call session
    /// and clears the prompt.
    pub async fn accept_call(&self) -> Result<ChatId> {
        let Some(call) = self.call_listener.incoming().borrow().clone() else {
            bail!("no incoming call");
        };
        let manager = self.call_manager(call.chat_id).await?;
        manager.answer_call(&call.sdp, call.kind).await?;
        self.call_listener.clear(call.chat_id);
        Ok(call.chat_id)
    }

    /// Refuse the ringing offer; the caller observes the decline.
    pub async fn decline_call(&self) -> Result<()> {
        let Some(call) = self.call_listener.incoming().borrow().clone() else {
            bail!("no incoming call");
        };
        self.call_listener.decline(&call).await?;
        Ok(())
    }

    pub async fn end_call(&self, chat_id: ChatId) -> Result<()> {
        if let Some(manager) = self.calls.lock().await.get(&chat_id) {
            manager.end_call().await?;
        }
        Ok(())
    }

    pub async fn toggle_mute(&self, chat_id: ChatId) -> Result<bool> {
        let manager = self.existing_call_manager(chat_id).await?;
        Ok(manager.toggle_mute().await?)
    }

    pub async fn toggle_video(&self, chat_id: ChatId) -> Result<bool> {
        let manager = self.existing_call_manager(chat_id).await?;
        Ok(manager.toggle_video().await?)
    }

    // ---- lifecycle ------------------------------------------------------

    /// Sign out: hang up, close every chat, broadcast offline, stop every
    /// task.  Pending outbox entries stay persisted for the next session.
    pub async fn sign_out(&self) {
        for (_, manager) in self.calls.lock().await.drain() {
            manager.shutdown().await;
        }
        self.call_states.lock().expect("state lock").clear();
        self.call_listener.shutdown();

        for (_, engine) in self.chats.lock().await.drain() {
            engine.close().await;
        }

        self.presence.shutdown().await;
        for task in self.tasks.lock().expect("task lock").drain(..) {
            task.abort();
        }
        info!(user = %self.local_user, "session ended");
    }

    // ---- internals ------------------------------------------------------

    /// One call session per chat, created lazily.
    async fn call_manager(&self, chat_id: ChatId) -> Result<Arc<CallManager>> {
        let mut calls = self.calls.lock().await;
        if let Some(manager) = calls.get(&chat_id) {
            return Ok(manager.clone());
        }

        let chat = self.backend.get_chat(chat_id).await?;
        let remote = chat
            .participants
            .iter()
            .map(|p| p.user_id)
            .find(|id| *id != self.local_user)
            .context("chat has no remote participant")?;

        let (manager, state) = CallManager::new(
            chat_id,
            self.local_user,
            remote,
            self.backend.clone(),
            self.bus.clone(),
            self.media.clone(),
        )
        .await?;
        calls.insert(chat_id, manager.clone());
        self.call_states
            .lock()
            .expect("state lock")
            .insert(chat_id, state);
        Ok(manager)
    }

    /// Hand a chat to the notification listener; it deduplicates, so over-
    /// calling is harmless.  A subscribe failure only degrades inbound
    /// ringing, never the operation that discovered the chat.
    async fn watch_chat_for_calls(&self, chat: Chat) {
        let chat_id = chat.id;
        if let Err(e) = self.call_listener.clone().watch_chat(chat).await {
            warn!(chat_id = %chat_id, error = %e, "failed to watch chat for calls");
        }
    }

    async fn existing_call_manager(&self, chat_id: ChatId) -> Result<Arc<CallManager>> {
        self.calls
            .lock()
            .await
            .get(&chat_id)
            .cloned()
            .context("no call session for that chat")
    }

    /// Route replay outcomes to the owning chat engine, or straight to the
    /// status map when the chat is not open.
    fn spawn_replay_router(
        self: Arc<Self>,
        mut replay_rx: mpsc::Receiver<ReplayEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = replay_rx.recv().await {
                match event {
                    ReplayEvent::Delivered {
                        provisional_id,
                        chat_id,
                        record,
                    } => {
                        if let Some(engine) = self.chats.lock().await.get(&chat_id) {
                            engine.resolve_delivery(provisional_id, record);
                        } else if let Some(db) = &self.db {
                            let guard = db.lock().expect("store lock");
                            if let Err(e) = guard.upsert_status(provisional_id, DeliveryStatus::Sent)
                            {
                                warn!(error = %e, "failed to record replayed delivery");
                            }
                        } else {
                            debug!(chat_id = %chat_id, "replayed send delivered to closed chat");
                        }
                    }
                    ReplayEvent::Dead {
                        provisional_id,
                        chat_id,
                    } => {
                        if let Some(engine) = self.chats.lock().await.get(&chat_id) {
                            engine.mark_send_failed(provisional_id);
                        } else if let Some(db) = &self.db {
                            let guard = db.lock().expect("store lock");
                            if let Err(e) =
                                guard.upsert_status(provisional_id, DeliveryStatus::Failed)
                            {
                                warn!(error = %e, "failed to record dead send");
                            }
                        }
                    }
                }
            }
        })
    }
}
