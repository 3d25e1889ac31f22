//! Call signaling state machine.
//!
//! One [`CallManager`] per chat drives the full lifecycle of a peer call:
//! log row first, then media, then the offer/answer exchange over the
//! chat's `call:{id}` topic.  State is observable through a watch channel;
//! every terminal transition finalizes the call log exactly once and
//! releases whatever media resources were acquired, from any state.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use ripple_shared::constants::RING_TIMEOUT_SECS;
use ripple_shared::protocol::CallSignal;
use ripple_shared::types::{CallKind, CallLogEntry, CallLogId, CallOutcome, ChatId, UserId};
use ripple_transport::{Backend, EventBus};

use crate::error::CallError;
use crate::media::{MediaProvider, MediaStream, PeerConnection};

/// Observable call lifecycle.
///
/// `Offering` and `Ringing` are both pre-answer caller states; the caller
/// moves to `Ringing` the moment its offer is published, since no remote
/// acknowledgement exists to observe.  Terminal states stay visible on the
/// watch until the next call begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Offering,
    Ringing,
    Answering,
    Connected,
    Ended,
    Declined,
    Missed,
    Failed,
}

impl CallState {
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Offering | Self::Ringing | Self::Answering | Self::Connected
        )
    }
}

/// Everything held by one in-progress call.
struct ActiveCall {
    /// The caller writes a log row; the callee's side has none.
    log_id: Option<CallLogId>,
    started_at: DateTime<Utc>,
    stream: Arc<dyn MediaStream>,
    connection: Arc<dyn PeerConnection>,
    finalized: bool,
    tasks: Vec<JoinHandle<()>>,
}

pub struct CallManager {
    chat_id: ChatId,
    local_user: UserId,
    remote_user: UserId,
    backend: Arc<dyn Backend>,
    bus: Arc<dyn EventBus>,
    media: Arc<dyn MediaProvider>,
    state_tx: watch::Sender<CallState>,
    active: Mutex<Option<ActiveCall>>,
    /// Remote candidates that arrived before the local connection existed;
    /// applied when the offer is accepted, discarded at teardown.
    pending_candidates: Mutex<Vec<String>>,
    listener: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl CallManager {
    /// Subscribe the chat's signaling topic and start dispatching remote
    /// signals.  The manager is idle until `start_call` or `answer_call`.
    pub async fn new(
        chat_id: ChatId,
        local_user: UserId,
        remote_user: UserId,
        backend: Arc<dyn Backend>,
        bus: Arc<dyn EventBus>,
        media: Arc<dyn MediaProvider>,
    ) -> Result<(Arc<Self>, watch::Receiver<CallState>), CallError> {
        let mut signals = bus.subscribe(&chat_id.call_topic()).await?;
        let (state_tx, state_rx) = watch::channel(CallState::Idle);

        let manager = Arc::new(Self {
            chat_id,
            local_user,
            remote_user,
            backend,
            bus,
            media,
            state_tx,
            active: Mutex::new(None),
            pending_candidates: Mutex::new(Vec::new()),
            listener: std::sync::Mutex::new(None),
        });

        let dispatch = {
            let manager = manager.clone();
            tokio::spawn(async move {
                while let Some(envelope) = signals.recv().await {
                    match CallSignal::from_json(&envelope.payload) {
                        Ok(signal) if signal.sender() != manager.local_user => {
                            manager.handle_signal(signal).await;
                        }
                        Ok(_) => {} // own signal echoed back
                        Err(e) => {
                            debug!(chat_id = %manager.chat_id, error = %e, "ignoring malformed call payload")
                        }
                    }
                }
            })
        };
        *manager.listener.lock().expect("listener lock") = Some(dispatch);

        Ok((manager, state_rx))
    }

    pub fn state(&self) -> watch::Receiver<CallState> {
        self.state_tx.subscribe()
    }

    pub async fn is_active(&self) -> bool {
        self.active.lock().await.is_some()
    }

    /// Place a call.  The log row is written before any media is touched so
    /// a device failure still leaves an auditable `failed` attempt.
    pub async fn start_call(self: &Arc<Self>, kind: CallKind) -> Result<(), CallError> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(CallError::Busy);
        }
        // Candidates from an offer the user never accepted.
        self.pending_candidates.lock().await.clear();

        let started_at = Utc::now();
        let entry = CallLogEntry {
            chat_id: self.chat_id,
            caller_id: self.local_user,
            receiver_id: self.remote_user,
            kind,
            // Optimistic; finalized to the real outcome at termination.
            outcome: CallOutcome::Completed,
            started_at,
            duration_secs: None,
        };
        let log_id = self.backend.create_call_log(&entry).await?;

        let stream = match self.media.acquire(kind).await {
            Ok(stream) => stream,
            Err(e) => {
                self.fail_before_connect(Some(log_id), None).await;
                return Err(e.into());
            }
        };

        let (connection, candidates) = match self.media.connect(stream.clone()).await {
            Ok(pair) => pair,
            Err(e) => {
                stream.stop();
                self.fail_before_connect(Some(log_id), None).await;
                return Err(e.into());
            }
        };

        self.state_tx.send_replace(CallState::Offering);

        let sdp = match connection.create_offer().await {
            Ok(sdp) => sdp,
            Err(e) => {
                stream.stop();
                connection.close().await;
                self.fail_before_connect(Some(log_id), None).await;
                return Err(e.into());
            }
        };

        let offer = CallSignal::Offer {
            caller_id: self.local_user,
            kind,
            sdp,
        };
        if let Err(e) = self
            .bus
            .publish(&self.chat_id.call_topic(), offer.to_json())
            .await
        {
            stream.stop();
            connection.close().await;
            self.fail_before_connect(Some(log_id), None).await;
            return Err(e.into());
        }

        // No remote ack exists; published means ringing.
        self.state_tx.send_replace(CallState::Ringing);
        info!(chat_id = %self.chat_id, ?kind, "call offer published");

        let mut tasks = vec![self.spawn_candidate_forwarder(candidates)];
        tasks.push(self.spawn_ring_timeout());

        *active = Some(ActiveCall {
            log_id: Some(log_id),
            started_at,
            stream,
            connection,
            finalized: false,
            tasks,
        });
        Ok(())
    }

    /// Accept a received offer.  The caller owns the log row, so none is
    /// written here.
    pub async fn answer_call(&self, offer_sdp: &str, kind: CallKind) -> Result<(), CallError> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(CallError::Busy);
        }

        self.state_tx.send_replace(CallState::Answering);
        let started_at = Utc::now();

        let stream = match self.media.acquire(kind).await {
            Ok(stream) => stream,
            Err(e) => {
                self.fail_before_connect(None, None).await;
                return Err(e.into());
            }
        };

        let result = async {
            let (connection, candidates) = self.media.connect(stream.clone()).await?;
            connection.set_remote_description(offer_sdp).await?;
            // Candidates the caller gathered while the prompt was up.
            for candidate in self.pending_candidates.lock().await.drain(..) {
                if let Err(e) = connection.add_ice_candidate(&candidate).await {
                    debug!(chat_id = %self.chat_id, error = %e, "buffered candidate rejected");
                }
            }
            let sdp = connection.create_answer().await?;
            Ok::<_, CallError>((connection, candidates, sdp))
        }
        .await;

        let (connection, candidates, sdp) = match result {
            Ok(parts) => parts,
            Err(e) => {
                stream.stop();
                self.fail_before_connect(None, None).await;
                return Err(e);
            }
        };

        let answer = CallSignal::Answer {
            sender_id: self.local_user,
            sdp,
        };
        if let Err(e) = self
            .bus
            .publish(&self.chat_id.call_topic(), answer.to_json())
            .await
        {
            stream.stop();
            connection.close().await;
            self.fail_before_connect(None, None).await;
            return Err(e.into());
        }

        let tasks = vec![self.spawn_candidate_forwarder(candidates)];
        *active = Some(ActiveCall {
            log_id: None,
            started_at,
            stream,
            connection,
            finalized: false,
            tasks,
        });
        self.state_tx.send_replace(CallState::Connected);
        info!(chat_id = %self.chat_id, ?kind, "call answered");
        Ok(())
    }

    /// Hang up.  Safe from any state; a second call is a no-op.
    pub async fn end_call(&self) -> Result<(), CallError> {
        let mut active = self.active.lock().await;
        let Some(call) = active.take() else {
            return Ok(());
        };
        let duration = (Utc::now() - call.started_at).num_seconds();
        self.teardown(call, CallOutcome::Completed, Some(duration), CallState::Ended)
            .await;
        Ok(())
    }

    /// Flip the local audio track; returns the new enabled flag.
    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        let active = self.active.lock().await;
        let call = active.as_ref().ok_or(CallError::NotInCall)?;
        let enabled = !call.stream.audio_enabled();
        call.stream.set_audio_enabled(enabled);
        Ok(enabled)
    }

    /// Flip the local video track; returns the new enabled flag.
    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        let active = self.active.lock().await;
        let call = active.as_ref().ok_or(CallError::NotInCall)?;
        let enabled = !call.stream.video_enabled();
        call.stream.set_video_enabled(enabled);
        Ok(enabled)
    }

    /// Stop dispatching and release everything.
    pub async fn shutdown(&self) {
        let _ = self.end_call().await;
        if let Some(task) = self.listener.lock().expect("listener lock").take() {
            task.abort();
        }
    }

    async fn handle_signal(&self, signal: CallSignal) {
        match signal {
            // Prompting the user for inbound offers is the notification
            // listener's job, not the per-chat session's.
            CallSignal::Offer { .. } => {}
            CallSignal::Answer { sdp, .. } => self.handle_remote_answer(&sdp).await,
            CallSignal::IceCandidate { candidate, .. } => {
                self.handle_remote_candidate(&candidate).await
            }
            CallSignal::Decline { .. } => self.handle_remote_decline().await,
        }
    }

    async fn handle_remote_answer(&self, sdp: &str) {
        let active = self.active.lock().await;
        let Some(call) = active.as_ref() else {
            debug!(chat_id = %self.chat_id, "answer with no active call");
            return;
        };
        if *self.state_tx.borrow() != CallState::Ringing {
            return;
        }
        match call.connection.set_remote_description(sdp).await {
            Ok(()) => {
                self.state_tx.send_replace(CallState::Connected);
                info!(chat_id = %self.chat_id, "call connected");
            }
            Err(e) => {
                warn!(chat_id = %self.chat_id, error = %e, "failed to apply remote answer");
            }
        }
    }

    async fn handle_remote_candidate(&self, candidate: &str) {
        let active = self.active.lock().await;
        let Some(call) = active.as_ref() else {
            // Candidates for an offer the user has not accepted yet.
            self.pending_candidates
                .lock()
                .await
                .push(candidate.to_string());
            return;
        };
        if let Err(e) = call.connection.add_ice_candidate(candidate).await {
            debug!(chat_id = %self.chat_id, error = %e, "candidate rejected");
        }
    }

    async fn handle_remote_decline(&self) {
        let mut active = self.active.lock().await;
        // A decline only answers a pending offer; once connected, a stray
        // or duplicated one must not tear the live call down.
        if *self.state_tx.borrow() == CallState::Connected {
            debug!(chat_id = %self.chat_id, "decline after connect ignored");
            return;
        }
        let Some(call) = active.take() else { return };
        info!(chat_id = %self.chat_id, "call declined by remote");
        self.teardown(call, CallOutcome::Declined, None, CallState::Declined)
            .await;
    }

    /// Unanswered ring window elapsed.
    async fn on_ring_timeout(&self) {
        let mut active = self.active.lock().await;
        if *self.state_tx.borrow() != CallState::Ringing {
            return;
        }
        let Some(call) = active.take() else { return };
        info!(chat_id = %self.chat_id, "ring timeout, marking missed");
        self.teardown(call, CallOutcome::Missed, None, CallState::Missed)
            .await;
    }

    /// Common terminal path: finalize the log once, release media, publish
    /// the terminal state, then cancel the call's tasks.  Task cancellation
    /// comes last so this is safe to run from one of those very tasks.
    async fn teardown(
        &self,
        mut call: ActiveCall,
        outcome: CallOutcome,
        duration_secs: Option<i64>,
        state: CallState,
    ) {
        if let Some(log_id) = call.log_id {
            if !call.finalized {
                call.finalized = true;
                if let Err(e) = self
                    .backend
                    .update_call_log(log_id, outcome, duration_secs)
                    .await
                {
                    warn!(chat_id = %self.chat_id, error = %e, "failed to finalize call log");
                }
            }
        }
        call.stream.stop();
        call.connection.close().await;
        self.pending_candidates.lock().await.clear();
        self.state_tx.send_replace(state);
        for task in call.tasks.drain(..) {
            task.abort();
        }
    }

    /// Failure before an `ActiveCall` exists; partial resources are already
    /// released by the caller.
    async fn fail_before_connect(&self, log_id: Option<CallLogId>, duration_secs: Option<i64>) {
        if let Some(log_id) = log_id {
            if let Err(e) = self
                .backend
                .update_call_log(log_id, CallOutcome::Failed, duration_secs)
                .await
            {
                warn!(chat_id = %self.chat_id, error = %e, "failed to finalize call log");
            }
        }
        self.state_tx.send_replace(CallState::Failed);
    }

    fn spawn_candidate_forwarder(
        &self,
        mut candidates: tokio::sync::mpsc::Receiver<String>,
    ) -> JoinHandle<()> {
        let bus = self.bus.clone();
        let topic = self.chat_id.call_topic();
        let sender_id = self.local_user;
        tokio::spawn(async move {
            while let Some(candidate) = candidates.recv().await {
                let signal = CallSignal::IceCandidate {
                    sender_id,
                    candidate,
                };
                if let Err(e) = bus.publish(&topic, signal.to_json()).await {
                    debug!(topic, error = %e, "candidate publish dropped");
                }
            }
        })
    }

    fn spawn_ring_timeout(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(RING_TIMEOUT_SECS)).await;
            manager.on_ring_timeout().await;
        })
    }
}
