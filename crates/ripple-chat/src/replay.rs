//! Outbox replay on reconnect.
//!
//! The replayer watches the transport connectivity flag and drains the
//! persisted queue whenever the link comes back.  Drains are single-flight:
//! rapid reconnect flaps never run two drains concurrently.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use ripple_shared::constants::EVENT_CHANNEL_CAPACITY;
use ripple_shared::types::{ChatId, MessageRecord, ProvisionalId};
use ripple_transport::Backend;

use crate::outbox::Outbox;

/// Outcome of a replayed send, routed back to the owning chat engine.
#[derive(Debug)]
pub enum ReplayEvent {
    /// The backend acknowledged the send; reconciliation applies by
    /// provisional id.
    Delivered {
        provisional_id: ProvisionalId,
        chat_id: ChatId,
        record: MessageRecord,
    },
    /// Attempts exhausted or the backend rejected the payload; surfaced as
    /// permanently failed, never silently dropped.
    Dead {
        provisional_id: ProvisionalId,
        chat_id: ChatId,
    },
}

pub struct Replayer {
    outbox: Arc<Outbox>,
    backend: Arc<dyn Backend>,
    max_attempts: u32,
    backoff_initial_ms: u64,
    backoff_max_ms: u64,
    draining: AtomicBool,
    events_tx: mpsc::Sender<ReplayEvent>,
}

impl Replayer {
    pub fn new(
        outbox: Arc<Outbox>,
        backend: Arc<dyn Backend>,
        max_attempts: u32,
        backoff_initial_ms: u64,
        backoff_max_ms: u64,
    ) -> (Arc<Self>, mpsc::Receiver<ReplayEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (
            Arc::new(Self {
                outbox,
                backend,
                max_attempts,
                backoff_initial_ms,
                backoff_max_ms,
                draining: AtomicBool::new(false),
                events_tx,
            }),
            events_rx,
        )
    }

    /// Run the replay loop: drain once on startup (pending sends from a
    /// previous run), then on every offline-to-online transition.
    pub fn spawn(self: Arc<Self>, mut connectivity: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if *connectivity.borrow() {
                self.drain(&connectivity).await;
            }
            while connectivity.changed().await.is_ok() {
                if *connectivity.borrow() {
                    self.drain(&connectivity).await;
                }
            }
            debug!("connectivity watch closed; replayer stopping");
        })
    }

    /// Drain the queue in enqueue order, one entry at a time.  Re-entrant
    /// calls while a drain is running are no-ops.
    pub async fn drain(&self, connectivity: &watch::Receiver<bool>) {
        if self.draining.swap(true, Ordering::SeqCst) {
            return;
        }

        let drained = self.drain_inner(connectivity).await;
        if drained > 0 {
            info!(count = drained, "outbox replay finished");
        }

        self.draining.store(false, Ordering::SeqCst);
    }

    async fn drain_inner(&self, connectivity: &watch::Receiver<bool>) -> usize {
        let mut drained = 0;

        loop {
            if !*connectivity.borrow() {
                debug!("connection lost mid-drain; replay paused");
                break;
            }

            // Re-read the head each round so entries enqueued mid-drain are
            // picked up in order.
            let Some(entry) = self.outbox.pending().into_iter().next() else {
                break;
            };

            let provisional_id = entry.provisional_id;
            let chat_id = entry.chat_id;
            let attempts = self.outbox.bump_attempts(provisional_id);

            match self
                .backend
                .create_message(chat_id, entry.sender_id, &entry.draft)
                .await
            {
                Ok(record) => {
                    self.outbox.remove(provisional_id);
                    drained += 1;
                    debug!(provisional_id = %provisional_id, durable_id = %record.id, "replayed send acknowledged");
                    let _ = self
                        .events_tx
                        .send(ReplayEvent::Delivered {
                            provisional_id,
                            chat_id,
                            record,
                        })
                        .await;
                }
                Err(e) if e.is_transient() => {
                    if attempts >= self.max_attempts {
                        warn!(
                            provisional_id = %provisional_id,
                            attempts,
                            "send attempts exhausted; entry is dead"
                        );
                        self.outbox.remove(provisional_id);
                        let _ = self
                            .events_tx
                            .send(ReplayEvent::Dead {
                                provisional_id,
                                chat_id,
                            })
                            .await;
                    } else {
                        let backoff = self.backoff(attempts);
                        debug!(
                            provisional_id = %provisional_id,
                            attempts,
                            backoff_ms = backoff.as_millis() as u64,
                            "replay attempt failed; backing off"
                        );
                        tokio::time::sleep(backoff).await;
                    }
                }
                Err(e) => {
                    // Validation errors are never retried.
                    warn!(provisional_id = %provisional_id, error = %e, "backend rejected replayed send");
                    self.outbox.remove(provisional_id);
                    let _ = self
                        .events_tx
                        .send(ReplayEvent::Dead {
                            provisional_id,
                            chat_id,
                        })
                        .await;
                }
            }
        }

        drained
    }

    /// Exponential backoff capped at `backoff_max_ms`, with random jitter so
    /// reconnecting clients do not stampede in sync.
    fn backoff(&self, attempts: u32) -> std::time::Duration {
        let factor = 1u64 << attempts.saturating_sub(1).min(16);
        let capped = self
            .backoff_initial_ms
            .saturating_mul(factor)
            .min(self.backoff_max_ms);
        let jitter = rand::thread_rng().gen_range(0..=capped / 2 + 1);
        std::time::Duration::from_millis(capped + jitter)
    }
}
