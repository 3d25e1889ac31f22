//! End-to-end session scenarios over the in-memory transport.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ripple_call::{CallError, CallState, NullMediaProvider};
use ripple_chat::ChatUpdate;
use ripple_client::{ClientConfig, RtcSession};
use ripple_shared::types::{CallKind, CallOutcome, DeliveryStatus, MessageDraft, UserId};
use ripple_transport::{Backend, MemoryBackend, MemoryBus};
use tokio::sync::watch;

struct World {
    bus: Arc<MemoryBus>,
    backend: Arc<MemoryBackend>,
}

fn world() -> World {
    let bus = MemoryBus::new();
    let backend = MemoryBackend::new(Some(bus.clone()));
    World { bus, backend }
}

async fn sign_in(w: &World, user: UserId) -> (Arc<RtcSession>, Arc<NullMediaProvider>) {
    let media = NullMediaProvider::new();
    let session = RtcSession::sign_in(
        user,
        w.backend.clone(),
        w.bus.clone(),
        media.clone(),
        ClientConfig::ephemeral(),
    )
    .await
    .unwrap();
    (session, media)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

/// Record every state a watch channel passes through.
fn record_states(mut rx: watch::Receiver<CallState>) -> Arc<Mutex<Vec<CallState>>> {
    let seen = Arc::new(Mutex::new(vec![*rx.borrow()]));
    let sink = seen.clone();
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            sink.lock().unwrap().push(*rx.borrow());
        }
    });
    seen
}

#[tokio::test(start_paused = true)]
async fn offline_send_is_replayed_on_reconnect() {
    let w = world();
    let alice = UserId::new();
    let bob = UserId::new();
    let (session, _media) = sign_in(&w, alice).await;

    let chat = session.start_private_chat(bob).await.unwrap();
    let (engine, _updates) = session.open_chat(chat.id).await.unwrap();

    w.bus.set_online(false);
    let pid = engine.send(MessageDraft::text("hi")).await.unwrap();

    assert!(!session.is_online());
    assert_eq!(session.outbox_len(), 1);
    assert_eq!(engine.messages()[0].status, DeliveryStatus::Sending);

    w.bus.set_online(true);
    settle().await;

    let messages = engine.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].provisional_id, Some(pid));
    assert_eq!(messages[0].status, DeliveryStatus::Sent);
    assert!(messages[0].id.is_some());
    assert_eq!(session.outbox_len(), 0);

    session.sign_out().await;
}

#[tokio::test(start_paused = true)]
async fn declined_call_never_connects_the_caller() {
    let w = world();
    let alice = UserId::new();
    let bob = UserId::new();
    let (alice_session, _alice_media) = sign_in(&w, alice).await;

    let chat = alice_session.start_private_chat(bob).await.unwrap();
    // Bob signs in after the chat exists so his listener watches it.
    let (bob_session, _bob_media) = sign_in(&w, bob).await;

    alice_session.call(chat.id, CallKind::Voice).await.unwrap();
    let states = record_states(alice_session.call_state(chat.id).unwrap());
    settle().await;

    let prompt = bob_session.incoming_call().borrow().clone().unwrap();
    assert_eq!(prompt.chat_id, chat.id);
    assert_eq!(prompt.caller_id, alice);

    bob_session.decline_call().await.unwrap();
    settle().await;

    assert!(bob_session.incoming_call().borrow().is_none());
    let seen = states.lock().unwrap().clone();
    assert!(seen.contains(&CallState::Declined));
    assert!(!seen.contains(&CallState::Connected));

    let logs = w.backend.call_logs_for_chat(chat.id);
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].outcome, CallOutcome::Declined);

    alice_session.sign_out().await;
    bob_session.sign_out().await;
}

#[tokio::test(start_paused = true)]
async fn a_chat_created_after_sign_in_still_rings_the_callee() {
    let w = world();
    let alice = UserId::new();
    let bob = UserId::new();
    // Both users sign in before any chat between them exists.
    let (alice_session, _am) = sign_in(&w, alice).await;
    let (bob_session, _bm) = sign_in(&w, bob).await;

    let chat = alice_session.start_private_chat(bob).await.unwrap();
    // Bob resolves the same chat; the idempotent create is how his side
    // discovers it.
    let bobs_view = bob_session.start_private_chat(alice).await.unwrap();
    assert_eq!(bobs_view.id, chat.id);

    alice_session.call(chat.id, CallKind::Voice).await.unwrap();
    settle().await;

    let prompt = bob_session.incoming_call().borrow().clone().unwrap();
    assert_eq!(prompt.chat_id, chat.id);
    assert_eq!(prompt.caller_id, alice);

    bob_session.decline_call().await.unwrap();
    settle().await;
    assert_eq!(
        *alice_session.call_state(chat.id).unwrap().borrow(),
        CallState::Declined
    );

    alice_session.sign_out().await;
    bob_session.sign_out().await;
}

#[tokio::test(start_paused = true)]
async fn accepted_call_connects_both_sides() {
    let w = world();
    let alice = UserId::new();
    let bob = UserId::new();
    let (alice_session, _alice_media) = sign_in(&w, alice).await;
    let chat = alice_session.start_private_chat(bob).await.unwrap();
    let (bob_session, _bob_media) = sign_in(&w, bob).await;

    alice_session.call(chat.id, CallKind::Video).await.unwrap();
    settle().await;

    let answered = bob_session.accept_call().await.unwrap();
    assert_eq!(answered, chat.id);
    settle().await;

    assert_eq!(
        *alice_session.call_state(chat.id).unwrap().borrow(),
        CallState::Connected
    );
    assert_eq!(
        *bob_session.call_state(chat.id).unwrap().borrow(),
        CallState::Connected
    );
    assert!(bob_session.incoming_call().borrow().is_none());

    alice_session.end_call(chat.id).await.unwrap();
    assert_eq!(
        *alice_session.call_state(chat.id).unwrap().borrow(),
        CallState::Ended
    );

    alice_session.sign_out().await;
    bob_session.sign_out().await;
}

#[tokio::test(start_paused = true)]
async fn second_call_in_the_same_chat_is_rejected() {
    let w = world();
    let alice = UserId::new();
    let bob = UserId::new();
    let (session, media) = sign_in(&w, alice).await;
    let chat = session.start_private_chat(bob).await.unwrap();

    session.call(chat.id, CallKind::Voice).await.unwrap();
    let err = session.call(chat.id, CallKind::Voice).await.unwrap_err();

    assert!(matches!(
        err.downcast_ref::<CallError>(),
        Some(CallError::Busy)
    ));
    assert_eq!(media.acquisitions(), 1);
    assert_eq!(w.backend.call_logs_for_chat(chat.id).len(), 1);

    session.sign_out().await;
}

#[tokio::test(start_paused = true)]
async fn sign_out_releases_calls_and_goes_offline() {
    let w = world();
    let alice = UserId::new();
    let bob = UserId::new();
    let (alice_session, alice_media) = sign_in(&w, alice).await;
    let chat = alice_session.start_private_chat(bob).await.unwrap();
    let (bob_session, _bob_media) = sign_in(&w, bob).await;

    // Bob observes Alice's next heartbeat.
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(bob_session.is_user_online(alice));

    alice_session.call(chat.id, CallKind::Voice).await.unwrap();
    alice_session.sign_out().await;
    settle().await;

    assert!(alice_media.streams()[0].is_stopped());
    assert!(alice_media.connections()[0].is_closed());
    assert!(!bob_session.is_user_online(alice));

    bob_session.sign_out().await;
}

#[tokio::test(start_paused = true)]
async fn typing_and_peer_messages_flow_between_sessions() {
    let w = world();
    let alice = UserId::new();
    let bob = UserId::new();
    let (alice_session, _am) = sign_in(&w, alice).await;
    let chat = alice_session.start_private_chat(bob).await.unwrap();
    let (bob_session, _bm) = sign_in(&w, bob).await;

    let (alice_engine, mut alice_updates) = alice_session.open_chat(chat.id).await.unwrap();
    let (bob_engine, _bob_updates) = bob_session.open_chat(chat.id).await.unwrap();

    bob_engine.input_activity().await;
    settle().await;
    assert_eq!(
        alice_updates.recv().await,
        Some(ChatUpdate::Typing {
            user_id: bob,
            active: true
        })
    );

    bob_engine
        .send(MessageDraft::text("hello from bob"))
        .await
        .unwrap();
    settle().await;

    let visible = alice_engine.messages();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].sender_id, bob);
    assert_eq!(visible[0].body.as_deref(), Some("hello from bob"));
    // Bob's own timeline holds exactly one entry too, reconciled not echoed.
    assert_eq!(bob_engine.messages().len(), 1);

    alice_session.close_chat(chat.id).await;
    bob_session.close_chat(chat.id).await;
    alice_session.sign_out().await;
    bob_session.sign_out().await;
}

#[tokio::test(start_paused = true)]
async fn pending_sends_survive_a_restart() {
    let w = world();
    let alice = UserId::new();
    let bob = UserId::new();
    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("outbox.db");

    let config = ClientConfig {
        store_path: Some(store_path.clone()),
        ..ClientConfig::default()
    };

    let media = NullMediaProvider::new();
    let session = RtcSession::sign_in(
        alice,
        w.backend.clone(),
        w.bus.clone(),
        media.clone(),
        config.clone(),
    )
    .await
    .unwrap();

    let chat = session.start_private_chat(bob).await.unwrap();
    let (engine, _updates) = session.open_chat(chat.id).await.unwrap();

    w.bus.set_online(false);
    engine
        .send(MessageDraft::text("written before the crash"))
        .await
        .unwrap();
    assert_eq!(session.outbox_len(), 1);
    session.sign_out().await;
    drop(session);

    // New process, same store, link restored.
    w.bus.set_online(true);
    let session = RtcSession::sign_in(alice, w.backend.clone(), w.bus.clone(), media, config)
        .await
        .unwrap();
    settle().await;

    assert_eq!(session.outbox_len(), 0);
    let history = w.backend.fetch_messages(chat.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(
        history[0].body.as_deref(),
        Some("written before the crash")
    );

    session.sign_out().await;
}

#[tokio::test(start_paused = true)]
async fn reopening_an_open_chat_is_rejected() {
    let w = world();
    let alice = UserId::new();
    let (session, _media) = sign_in(&w, alice).await;
    let chat = session.start_private_chat(UserId::new()).await.unwrap();

    let (_engine, _updates) = session.open_chat(chat.id).await.unwrap();
    assert!(session.open_chat(chat.id).await.is_err());

    session.close_chat(chat.id).await;
    // Closed means reopenable.
    assert!(session.open_chat(chat.id).await.is_ok());

    session.sign_out().await;
}
