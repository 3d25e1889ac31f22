//! Typing indicator broadcasts.
//!
//! One cancel-and-reschedule deadline per chat: the first keystroke
//! broadcasts typing-start immediately, every further keystroke pushes the
//! stop deadline out, and a single watcher task broadcasts typing-stop once
//! the deadline passes.  Timers never stack.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use ripple_shared::protocol::TypingEvent;
use ripple_shared::types::{ChatId, UserId};
use ripple_transport::EventBus;

pub struct TypingNotifier {
    bus: Arc<dyn EventBus>,
    topic: String,
    user_id: UserId,
    stop_delay: Duration,
    deadline: Arc<Mutex<Option<Instant>>>,
}

impl TypingNotifier {
    pub fn new(
        bus: Arc<dyn EventBus>,
        chat_id: ChatId,
        user_id: UserId,
        stop_delay: Duration,
    ) -> Self {
        Self {
            bus,
            topic: chat_id.typing_topic(),
            user_id,
            stop_delay,
            deadline: Arc::new(Mutex::new(None)),
        }
    }

    /// Register local input activity.  Broadcasts typing-start on the first
    /// keystroke of a burst and reschedules the stop deadline on every one.
    pub async fn input_activity(&self) {
        let became_active = {
            let mut deadline = self.deadline.lock().expect("typing lock");
            let was_active = deadline.is_some();
            *deadline = Some(Instant::now() + self.stop_delay);
            !was_active
        };

        if became_active {
            broadcast(&*self.bus, &self.topic, self.user_id, true).await;

            let bus = self.bus.clone();
            let topic = self.topic.clone();
            let user_id = self.user_id;
            let deadline = self.deadline.clone();
            tokio::spawn(async move {
                loop {
                    let target = match *deadline.lock().expect("typing lock") {
                        Some(t) => t,
                        None => return, // stopped explicitly
                    };
                    if Instant::now() >= target {
                        *deadline.lock().expect("typing lock") = None;
                        broadcast(&*bus, &topic, user_id, false).await;
                        return;
                    }
                    tokio::time::sleep_until(target).await;
                }
            });
        }
    }

    /// Broadcast typing-stop immediately (view unmount, message sent).
    pub async fn stop(&self) {
        let was_active = self
            .deadline
            .lock()
            .expect("typing lock")
            .take()
            .is_some();
        if was_active {
            broadcast(&*self.bus, &self.topic, self.user_id, false).await;
        }
    }

    pub fn is_active(&self) -> bool {
        self.deadline.lock().expect("typing lock").is_some()
    }
}

async fn broadcast(bus: &dyn EventBus, topic: &str, user_id: UserId, active: bool) {
    let event = TypingEvent { user_id, active };
    // Pure fire-and-forget: a lost event means a lingering indicator at
    // worst.
    if let Err(e) = bus.publish(topic, event.to_json()).await {
        debug!(topic, error = %e, "typing broadcast dropped");
    }
}
