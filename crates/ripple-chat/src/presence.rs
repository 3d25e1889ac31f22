//! Presence heartbeats and the liveness map.
//!
//! Cheap, best-effort signaling: the tracker publishes an upsert on start,
//! on a fixed interval and on every viewing-chat change, and folds inbound
//! broadcasts into a user-to-record map.  Queries are point-in-time reads of
//! the last known heartbeat; there is no freshness guarantee beyond
//! "received before now".

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use ripple_shared::constants::PRESENCE_TOPIC;
use ripple_shared::protocol::PresenceUpdate;
use ripple_shared::types::{ChatId, PresenceRecord, PresenceStatus, UserId};
use ripple_transport::{Backend, EventBus, TransportError};

pub struct PresenceTracker {
    local_user: UserId,
    backend: Arc<dyn Backend>,
    bus: Arc<dyn EventBus>,
    records: Arc<Mutex<HashMap<UserId, PresenceRecord>>>,
    viewing_tx: watch::Sender<Option<ChatId>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PresenceTracker {
    /// Subscribe to the presence topic and start the heartbeat loop.
    pub async fn spawn(
        local_user: UserId,
        backend: Arc<dyn Backend>,
        bus: Arc<dyn EventBus>,
        interval: Duration,
    ) -> Result<Arc<Self>, TransportError> {
        let mut inbound = bus.subscribe(PRESENCE_TOPIC).await?;
        let (viewing_tx, mut viewing_rx) = watch::channel(None);

        let tracker = Arc::new(Self {
            local_user,
            backend: backend.clone(),
            bus: bus.clone(),
            records: Arc::new(Mutex::new(HashMap::new())),
            viewing_tx,
            tasks: Mutex::new(Vec::new()),
        });

        let records = tracker.records.clone();
        let inbound_task = tokio::spawn(async move {
            while let Some(envelope) = inbound.recv().await {
                match PresenceUpdate::from_json(&envelope.payload) {
                    Ok(update) => {
                        records.lock().expect("presence lock").insert(
                            update.user_id,
                            PresenceRecord {
                                user_id: update.user_id,
                                status: update.status,
                                last_heartbeat: update.sent_at,
                                viewing_chat: update.viewing_chat,
                            },
                        );
                    }
                    Err(e) => debug!(error = %e, "ignoring malformed presence payload"),
                }
            }
        });

        let heartbeat_backend = backend;
        let heartbeat_bus = bus;
        let heartbeat_task = tokio::spawn(async move {
            loop {
                let viewing = *viewing_rx.borrow();
                beat(
                    &*heartbeat_backend,
                    &*heartbeat_bus,
                    local_user,
                    PresenceStatus::Online,
                    viewing,
                )
                .await;

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    changed = viewing_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        tracker
            .tasks
            .lock()
            .expect("task lock")
            .extend([inbound_task, heartbeat_task]);

        Ok(tracker)
    }

    /// Record which chat the local user is looking at; triggers an
    /// immediate heartbeat.
    pub fn set_viewing(&self, chat: Option<ChatId>) {
        let _ = self.viewing_tx.send(chat);
    }

    pub fn is_online(&self, user: UserId) -> bool {
        self.records
            .lock()
            .expect("presence lock")
            .get(&user)
            .map(|r| r.status == PresenceStatus::Online)
            .unwrap_or(false)
    }

    pub fn is_viewing_chat(&self, user: UserId, chat: ChatId) -> bool {
        self.records
            .lock()
            .expect("presence lock")
            .get(&user)
            .map(|r| r.status == PresenceStatus::Online && r.viewing_chat == Some(chat))
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> HashMap<UserId, PresenceRecord> {
        self.records.lock().expect("presence lock").clone()
    }

    /// Clean disconnect: stop the heartbeat and downgrade to offline.  A
    /// missed-heartbeat timeout on the backend covers the unclean case.
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().expect("task lock").drain(..) {
            task.abort();
        }
        beat(
            &*self.backend,
            &*self.bus,
            self.local_user,
            PresenceStatus::Offline,
            None,
        )
        .await;
    }
}

/// One presence upsert: persisted via the backend and broadcast on the
/// presence topic.  Fire-and-forget on both legs.
async fn beat(
    backend: &dyn Backend,
    bus: &dyn EventBus,
    user_id: UserId,
    status: PresenceStatus,
    viewing_chat: Option<ChatId>,
) {
    let update = PresenceUpdate {
        user_id,
        status,
        viewing_chat,
        sent_at: Utc::now(),
    };

    if let Err(e) = backend.upsert_presence(&update).await {
        debug!(error = %e, "presence upsert failed");
    }
    if let Err(e) = bus.publish(PRESENCE_TOPIC, update.to_json()).await {
        debug!(error = %e, "presence broadcast dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripple_transport::{MemoryBackend, MemoryBus};

    async fn settle() {
        // Paused-clock sleep: lets every spawned task run to its next await
        // without consuming real time.
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_shows_up_in_peer_maps() {
        let bus = MemoryBus::new();
        let backend = MemoryBackend::new(Some(bus.clone()));
        let alice = UserId::new();
        let bob = UserId::new();

        let alice_tracker = PresenceTracker::spawn(
            alice,
            backend.clone(),
            bus.clone(),
            Duration::from_secs(30),
        )
        .await
        .unwrap();
        let bob_tracker =
            PresenceTracker::spawn(bob, backend.clone(), bus.clone(), Duration::from_secs(30))
                .await
                .unwrap();
        settle().await;

        assert!(bob_tracker.is_online(alice));
        assert!(alice_tracker.is_online(bob));

        alice_tracker.shutdown().await;
        settle().await;
        assert!(!bob_tracker.is_online(alice));
    }

    #[tokio::test(start_paused = true)]
    async fn viewing_change_is_broadcast_immediately() {
        let bus = MemoryBus::new();
        let backend = MemoryBackend::new(Some(bus.clone()));
        let alice = UserId::new();
        let bob = UserId::new();
        let chat = ChatId::new();

        let alice_tracker = PresenceTracker::spawn(
            alice,
            backend.clone(),
            bus.clone(),
            Duration::from_secs(30),
        )
        .await
        .unwrap();
        let bob_tracker =
            PresenceTracker::spawn(bob, backend, bus, Duration::from_secs(30))
                .await
                .unwrap();
        settle().await;

        assert!(!bob_tracker.is_viewing_chat(alice, chat));

        alice_tracker.set_viewing(Some(chat));
        settle().await;

        assert!(bob_tracker.is_viewing_chat(alice, chat));

        alice_tracker.set_viewing(None);
        settle().await;
        assert!(!bob_tracker.is_viewing_chat(alice, chat));
    }
}
