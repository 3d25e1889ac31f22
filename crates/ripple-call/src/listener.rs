//! Inbound call notification.
//!
//! Runs for the whole session, independent of any open call UI: it watches
//! the signaling topics of every chat the user belongs to and raises a
//! prompt when a valid offer arrives.  Validity is checked against the
//! chat's participant list, never against topic membership, and the prompt
//! clears itself when the ring window passes unanswered.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use ripple_shared::constants::RING_TIMEOUT_SECS;
use ripple_shared::protocol::CallSignal;
use ripple_shared::types::{CallKind, Chat, ChatId, UserId};
use ripple_transport::{Backend, EventBus};

use crate::error::CallError;

/// A ringing offer awaiting a user decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCall {
    pub chat_id: ChatId,
    pub caller_id: UserId,
    pub kind: CallKind,
    pub sdp: String,
    pub received_at: DateTime<Utc>,
}

pub struct CallNotificationListener {
    local_user: UserId,
    bus: Arc<dyn EventBus>,
    incoming_tx: watch::Sender<Option<IncomingCall>>,
    watched: std::sync::Mutex<HashSet<ChatId>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    /// Only one prompt rings at a time, so one expiry task suffices; a
    /// newer offer replaces (and aborts) the previous window.
    ring_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl CallNotificationListener {
    /// Subscribe the signaling topics of the user's chats and start
    /// watching for offers.
    pub async fn spawn(
        local_user: UserId,
        backend: Arc<dyn Backend>,
        bus: Arc<dyn EventBus>,
    ) -> Result<Arc<Self>, CallError> {
        let chats = backend.chats_for_user(local_user).await?;
        let (incoming_tx, _) = watch::channel(None);

        let listener = Arc::new(Self {
            local_user,
            bus,
            incoming_tx,
            watched: std::sync::Mutex::new(HashSet::new()),
            tasks: std::sync::Mutex::new(Vec::new()),
            ring_task: std::sync::Mutex::new(None),
        });

        for chat in chats {
            listener.clone().watch_chat(chat).await?;
        }
        Ok(listener)
    }

    /// Start watching one more chat (created or joined after sign-in).
    /// Idempotent per chat, so callers need not track what is watched.
    pub async fn watch_chat(self: Arc<Self>, chat: Chat) -> Result<(), CallError> {
        if !self.watched.lock().expect("watched lock").insert(chat.id) {
            return Ok(());
        }
        let mut signals = match self.bus.subscribe(&chat.id.call_topic()).await {
            Ok(signals) => signals,
            Err(e) => {
                // Leave the chat unwatched so a later attempt can retry.
                self.watched.lock().expect("watched lock").remove(&chat.id);
                return Err(e.into());
            }
        };
        let task = tokio::spawn({
            let listener = self.clone();
            async move {
                while let Some(envelope) = signals.recv().await {
                    match CallSignal::from_json(&envelope.payload) {
                        Ok(signal) => listener.handle_signal(&chat, signal),
                        Err(e) => {
                            debug!(chat_id = %chat.id, error = %e, "ignoring malformed call payload")
                        }
                    }
                }
            }
        });
        self.tasks.lock().expect("task lock").push(task);
        Ok(())
    }

    /// The current prompt, if any.  `None` means no call is ringing.
    pub fn incoming(&self) -> watch::Receiver<Option<IncomingCall>> {
        self.incoming_tx.subscribe()
    }

    /// Refuse the ringing call; the caller's session observes the decline
    /// and tears down without ever connecting.
    pub async fn decline(&self, call: &IncomingCall) -> Result<(), CallError> {
        let signal = CallSignal::Decline {
            sender_id: self.local_user,
        };
        self.bus
            .publish(&call.chat_id.call_topic(), signal.to_json())
            .await?;
        self.clear(call.chat_id);
        Ok(())
    }

    /// Drop the prompt without signaling anyone (the user accepted, or the
    /// call UI took over).
    pub fn clear(&self, chat_id: ChatId) {
        self.incoming_tx.send_if_modified(|current| {
            if current.as_ref().map(|c| c.chat_id) == Some(chat_id) {
                *current = None;
                true
            } else {
                false
            }
        });
    }

    pub fn shutdown(&self) {
        for task in self.tasks.lock().expect("task lock").drain(..) {
            task.abort();
        }
        if let Some(task) = self.ring_task.lock().expect("task lock").take() {
            task.abort();
        }
        self.incoming_tx.send_replace(None);
    }

    fn handle_signal(self: &Arc<Self>, chat: &Chat, signal: CallSignal) {
        match signal {
            CallSignal::Offer {
                caller_id,
                kind,
                sdp,
            } => {
                if caller_id == self.local_user {
                    return;
                }
                // Membership comes from the chat row, not from whoever can
                // reach the topic.
                if !chat.has_participant(caller_id) {
                    warn!(chat_id = %chat.id, caller = %caller_id, "offer from non-participant ignored");
                    return;
                }
                info!(chat_id = %chat.id, caller = %caller_id, ?kind, "incoming call");
                let call = IncomingCall {
                    chat_id: chat.id,
                    caller_id,
                    kind,
                    sdp,
                    received_at: Utc::now(),
                };
                self.incoming_tx.send_replace(Some(call.clone()));
                self.spawn_ring_window(call);
            }
            // A decline from another of the user's own devices also clears
            // the prompt.
            CallSignal::Decline { sender_id } if sender_id == self.local_user => {
                self.clear(chat.id);
            }
            _ => {}
        }
    }

    /// The prompt expires with the caller's ring timeout.
    fn spawn_ring_window(self: &Arc<Self>, call: IncomingCall) {
        let listener = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(RING_TIMEOUT_SECS)).await;
            listener.incoming_tx.send_if_modified(|current| {
                if current.as_ref() == Some(&call) {
                    debug!(chat_id = %call.chat_id, "incoming call expired unanswered");
                    *current = None;
                    true
                } else {
                    false
                }
            });
        });
        if let Some(old) = self.ring_task.lock().expect("task lock").replace(task) {
            old.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripple_shared::types::{ChatRole, Participant};
    use ripple_transport::{MemoryBackend, MemoryBus};

    fn chat_between(id: ChatId, a: UserId, b: UserId) -> Chat {
        Chat {
            id,
            name: None,
            avatar_url: None,
            is_group: false,
            created_at: Utc::now(),
            last_activity_at: Utc::now(),
            participants: vec![
                Participant {
                    user_id: a,
                    role: ChatRole::Member,
                    joined_at: Utc::now(),
                },
                Participant {
                    user_id: b,
                    role: ChatRole::Member,
                    joined_at: Utc::now(),
                },
            ],
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn valid_offer_raises_the_prompt() {
        let bus = MemoryBus::new();
        let backend = MemoryBackend::new(None);
        let me = UserId::new();
        let caller = UserId::new();
        let chat_id = ChatId::new();
        backend.insert_chat(chat_between(chat_id, me, caller));

        let listener = CallNotificationListener::spawn(me, backend, bus.clone())
            .await
            .unwrap();
        let incoming = listener.incoming();

        let offer = CallSignal::Offer {
            caller_id: caller,
            kind: CallKind::Voice,
            sdp: "v=0".into(),
        };
        bus.publish(&chat_id.call_topic(), offer.to_json())
            .await
            .unwrap();
        settle().await;

        let prompt = incoming.borrow().clone().unwrap();
        assert_eq!(prompt.chat_id, chat_id);
        assert_eq!(prompt.caller_id, caller);
        assert_eq!(prompt.kind, CallKind::Voice);

        listener.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn offers_from_non_participants_are_ignored() {
        let bus = MemoryBus::new();
        let backend = MemoryBackend::new(None);
        let me = UserId::new();
        let friend = UserId::new();
        let chat_id = ChatId::new();
        backend.insert_chat(chat_between(chat_id, me, friend));

        let listener = CallNotificationListener::spawn(me, backend, bus.clone())
            .await
            .unwrap();
        let incoming = listener.incoming();

        let offer = CallSignal::Offer {
            caller_id: UserId::new(),
            kind: CallKind::Voice,
            sdp: "v=0".into(),
        };
        bus.publish(&chat_id.call_topic(), offer.to_json())
            .await
            .unwrap();
        settle().await;

        assert!(incoming.borrow().is_none());
        listener.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn decline_publishes_and_clears() {
        let bus = MemoryBus::new();
        let backend = MemoryBackend::new(None);
        let me = UserId::new();
        let caller = UserId::new();
        let chat_id = ChatId::new();
        backend.insert_chat(chat_between(chat_id, me, caller));

        let listener = CallNotificationListener::spawn(me, backend, bus.clone())
            .await
            .unwrap();
        let incoming = listener.incoming();
        let mut wire = bus.subscribe(&chat_id.call_topic()).await.unwrap();

        let offer = CallSignal::Offer {
            caller_id: caller,
            kind: CallKind::Video,
            sdp: "v=0".into(),
        };
        bus.publish(&chat_id.call_topic(), offer.to_json())
            .await
            .unwrap();
        settle().await;
        // Drain the offer off the observer subscription.
        wire.recv().await.unwrap();

        let prompt = incoming.borrow().clone().unwrap();
        listener.decline(&prompt).await.unwrap();

        assert!(incoming.borrow().is_none());
        let envelope = wire.recv().await.unwrap();
        assert!(matches!(
            CallSignal::from_json(&envelope.payload).unwrap(),
            CallSignal::Decline { sender_id } if sender_id == me
        ));

        listener.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_prompt_expires_with_the_ring_window() {
        let bus = MemoryBus::new();
        let backend = MemoryBackend::new(None);
        let me = UserId::new();
        let caller = UserId::new();
        let chat_id = ChatId::new();
        backend.insert_chat(chat_between(chat_id, me, caller));

        let listener = CallNotificationListener::spawn(me, backend, bus.clone())
            .await
            .unwrap();
        let incoming = listener.incoming();

        let offer = CallSignal::Offer {
            caller_id: caller,
            kind: CallKind::Voice,
            sdp: "v=0".into(),
        };
        bus.publish(&chat_id.call_topic(), offer.to_json())
            .await
            .unwrap();
        settle().await;
        assert!(incoming.borrow().is_some());

        tokio::time::sleep(Duration::from_secs(RING_TIMEOUT_SECS + 1)).await;
        assert!(incoming.borrow().is_none());

        listener.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn chats_created_mid_session_raise_prompts_too() {
        let bus = MemoryBus::new();
        let backend = MemoryBackend::new(None);
        let me = UserId::new();
        let caller = UserId::new();

        // No chats exist at sign-in.
        let listener = CallNotificationListener::spawn(me, backend.clone(), bus.clone())
            .await
            .unwrap();
        let incoming = listener.incoming();

        let chat_id = ChatId::new();
        let chat = chat_between(chat_id, me, caller);
        backend.insert_chat(chat.clone());
        listener.clone().watch_chat(chat.clone()).await.unwrap();
        // Watching the same chat again must not double-subscribe.
        listener.clone().watch_chat(chat).await.unwrap();

        let offer = CallSignal::Offer {
            caller_id: caller,
            kind: CallKind::Voice,
            sdp: "v=0".into(),
        };
        bus.publish(&chat_id.call_topic(), offer.to_json())
            .await
            .unwrap();
        settle().await;

        let prompt = incoming.borrow().clone().unwrap();
        assert_eq!(prompt.chat_id, chat_id);

        listener.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn a_newer_offer_restarts_the_ring_window() {
        let bus = MemoryBus::new();
        let backend = MemoryBackend::new(None);
        let me = UserId::new();
        let (caller_a, caller_b) = (UserId::new(), UserId::new());
        let (chat_a, chat_b) = (ChatId::new(), ChatId::new());
        backend.insert_chat(chat_between(chat_a, me, caller_a));
        backend.insert_chat(chat_between(chat_b, me, caller_b));

        let listener = CallNotificationListener::spawn(me, backend, bus.clone())
            .await
            .unwrap();
        let incoming = listener.incoming();

        let offer_a = CallSignal::Offer {
            caller_id: caller_a,
            kind: CallKind::Voice,
            sdp: "v=0 a".into(),
        };
        bus.publish(&chat_a.call_topic(), offer_a.to_json())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;

        let offer_b = CallSignal::Offer {
            caller_id: caller_b,
            kind: CallKind::Voice,
            sdp: "v=0 b".into(),
        };
        bus.publish(&chat_b.call_topic(), offer_b.to_json())
            .await
            .unwrap();
        settle().await;

        // Past the first offer's deadline: the newer prompt still rings.
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(incoming.borrow().clone().unwrap().chat_id, chat_b);

        // And expires on its own schedule.
        tokio::time::sleep(Duration::from_secs(RING_TIMEOUT_SECS)).await;
        assert!(incoming.borrow().is_none());

        listener.shutdown();
    }
}
