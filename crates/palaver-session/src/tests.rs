use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;

use palaver_wire::MessageFactory;

use super::*;

/// Records everything the session puts on the wire, like the send spies in
/// a transport integration test.
#[derive(Clone, Default)]
struct RecordingTransport {
    sent: Arc<Mutex<Vec<Message>>>,
    down: Arc<AtomicBool>,
}

impl RecordingTransport {
    fn sent(&self) -> Vec<Message> {
        self.sent.lock().clone()
    }

    fn sent_replies(&self) -> Vec<(u64, bool, Value)> {
        self.sent()
            .into_iter()
            .filter_map(|m| match m {
                Message::Reply {
                    part, done, payload, ..
                } => Some((part, done, payload)),
                _ => None,
            })
            .collect()
    }
}

impl Transport for RecordingTransport {
    fn send<'a>(&'a self, msg: &'a Message) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            if self.down.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "transport down"));
            }
            self.sent.lock().push(msg.clone());
            Ok(())
        })
    }
}

fn session() -> (Session, UnboundedReceiver<SessionEvent>, RecordingTransport) {
    let transport = RecordingTransport::default();
    let (session, events) = Session::new(
        Origin::new("local"),
        transport.clone(),
        SessionConfig::default(),
    )
    .unwrap();
    (session, events, transport)
}

fn peer() -> MessageFactory {
    MessageFactory::new(Origin::new("peer"))
}

fn reply_to(call: &Message, part: u64, done: bool, payload: Value) -> Message {
    let Message::Call { id, event, .. } = call else {
        panic!("expected a call message");
    };
    peer().reply(id.clone(), event.clone(), part, done, payload)
}

/// Let spawned tasks catch up without advancing the clock.
async fn breathe() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

// ========================================================================
// Outgoing calls
// ========================================================================

#[tokio::test]
async fn call_puts_a_call_message_on_the_wire() {
    let (session, _events, transport) = session();

    let handle = session
        .call("lime", json!({ "where": "inside" }), CallOptions::new())
        .await
        .unwrap();

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    let Message::Call {
        id,
        event,
        payload,
        origin,
        ..
    } = &sent[0]
    else {
        panic!("expected a call, got {:?}", sent[0]);
    };
    assert_eq!(event, "lime");
    assert_eq!(payload, &json!({ "where": "inside" }));
    assert_eq!(origin.id, "local");
    assert_eq!(id, handle.id());
}

#[tokio::test]
async fn call_resolves_on_done_reply() {
    let (session, _events, _transport) = session();

    let handle = session
        .call("order-milk", json!({ "size": "litre" }), CallOptions::new())
        .await
        .unwrap();
    let expected = json!({ "id": "123", "total": "$123.00" });

    session
        .dispatch(vec![reply_to(handle.message(), 0, true, expected.clone())])
        .await
        .unwrap();

    let outcome = handle.result().await.unwrap();
    assert_eq!(outcome.data, expected);
    assert_eq!(outcome.parts, vec![expected]);
    assert!(!outcome.canceled);
    assert_eq!(session.outstanding_calls(), 0);
}

#[tokio::test]
async fn call_accumulates_streamed_parts_in_order() {
    let (session, _events, _transport) = session();
    let replies: Arc<Mutex<Vec<(Value, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let dones: Arc<Mutex<Vec<(Value, Vec<Value>)>>> = Arc::new(Mutex::new(Vec::new()));

    let options = CallOptions::new()
        .on_reply({
            let replies = replies.clone();
            move |payload, part| replies.lock().push((payload, part))
        })
        .on_done({
            let dones = dones.clone();
            move |payload, parts| dones.lock().push((payload, parts.to_vec()))
        });
    let handle = session.call("lime", Value::Null, options).await.unwrap();

    session
        .dispatch(vec![
            reply_to(handle.message(), 0, false, json!("coconut")),
            reply_to(handle.message(), 1, false, json!("lime")),
            reply_to(handle.message(), 2, true, json!("water")),
        ])
        .await
        .unwrap();

    let outcome = handle.result().await.unwrap();
    assert_eq!(outcome.data, json!("water"), "data is the final payload");
    assert_eq!(
        outcome.parts,
        vec![json!("coconut"), json!("lime"), json!("water")]
    );

    // on_reply fires for the streamed parts only, on_done once at the end.
    assert_eq!(
        *replies.lock(),
        vec![(json!("coconut"), 0), (json!("lime"), 1)]
    );
    assert_eq!(
        *dones.lock(),
        vec![(
            json!("water"),
            vec![json!("coconut"), json!("lime"), json!("water")]
        )]
    );
}

#[tokio::test(start_paused = true)]
async fn first_reply_timeout_rejects_and_unregisters() {
    let (session, _events, _transport) = session();

    let handle = session
        .call("lime", Value::Null, CallOptions::new())
        .await
        .unwrap();
    let call = handle.message().clone();

    let err = handle.result().await.unwrap_err();
    let CallError::Timeout { call_id, timer } = &err else {
        panic!("expected timeout, got {err:?}");
    };
    assert_eq!(timer, &TimerKind::FirstReply);
    assert!(err.to_string().contains(call_id));
    assert_eq!(session.outstanding_calls(), 0);

    // A late reply is dropped silently, no crash.
    session
        .dispatch(vec![reply_to(&call, 0, true, json!("late"))])
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn done_timeout_rejects_after_first_reply_cleared_its_timer() {
    let (session, _events, _transport) = session();

    let handle = session
        .call("lime", Value::Null, CallOptions::new())
        .await
        .unwrap();
    session
        .dispatch(vec![reply_to(handle.message(), 0, false, json!("part"))])
        .await
        .unwrap();

    let err = handle.result().await.unwrap_err();
    assert!(
        matches!(&err, CallError::Timeout { timer, .. } if *timer == TimerKind::Done),
        "expected done timeout, got {err:?}"
    );
    assert_eq!(session.outstanding_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn disabled_timers_leave_the_call_pending() {
    let (session, _events, _transport) = session();

    let _handle = session
        .call(
            "lime",
            Value::Null,
            CallOptions::new().reply_timeout(None).done_timeout(None),
        )
        .await
        .unwrap();

    tokio::time::advance(Duration::from_secs(60)).await;
    breathe().await;
    assert_eq!(session.outstanding_calls(), 1);
}

#[tokio::test]
async fn cancel_resolves_with_parts_so_far() {
    let (session, _events, _transport) = session();

    let handle = session
        .call("lime", Value::Null, CallOptions::new())
        .await
        .unwrap();
    session
        .dispatch(vec![reply_to(handle.message(), 0, false, json!("partial"))])
        .await
        .unwrap();

    handle.cancel();
    handle.cancel(); // idempotent

    let outcome = handle.result().await.unwrap();
    assert_eq!(outcome.data, Value::Null);
    assert_eq!(outcome.parts, vec![json!("partial")]);
    assert!(outcome.canceled);
    assert_eq!(session.outstanding_calls(), 0);
}

#[tokio::test]
async fn cancel_after_done_is_a_noop() {
    let (session, _events, _transport) = session();

    let handle = session
        .call("lime", Value::Null, CallOptions::new())
        .await
        .unwrap();
    session
        .dispatch(vec![reply_to(handle.message(), 0, true, json!("done"))])
        .await
        .unwrap();

    handle.cancel();
    let outcome = handle.result().await.unwrap();
    assert!(!outcome.canceled, "the done reply won the race");
    assert_eq!(outcome.data, json!("done"));
}

#[tokio::test]
async fn keep_alive_retains_the_entry_for_late_replies() {
    let (session, _events, _transport) = session();
    let replies: Arc<Mutex<Vec<(Value, u64)>>> = Arc::new(Mutex::new(Vec::new()));

    let options = CallOptions::new().keep_alive(true).on_reply({
        let replies = replies.clone();
        move |payload, part| replies.lock().push((payload, part))
    });
    let handle = session.call("watch", Value::Null, options).await.unwrap();
    let call = handle.message().clone();
    let canceler = handle.canceler();

    session
        .dispatch(vec![reply_to(&call, 0, true, json!("first-done"))])
        .await
        .unwrap();
    let outcome = handle.result().await.unwrap();
    assert_eq!(outcome.data, json!("first-done"));
    assert_eq!(session.outstanding_calls(), 1, "entry is retained");

    // Late and duplicate replies keep feeding on_reply.
    session
        .dispatch(vec![
            reply_to(&call, 1, false, json!("late")),
            reply_to(&call, 2, true, json!("late-done")),
        ])
        .await
        .unwrap();
    assert_eq!(
        *replies.lock(),
        vec![(json!("late"), 1), (json!("late-done"), 2)]
    );

    // Resources are held until an explicit cancel.
    canceler.cancel();
    assert_eq!(session.outstanding_calls(), 0);
}

#[tokio::test]
async fn transport_refusal_surfaces_and_unregisters() {
    let (session, _events, transport) = session();
    transport.down.store(true, Ordering::SeqCst);

    let err = session
        .call("lime", Value::Null, CallOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Transport(_)));
    assert_eq!(session.outstanding_calls(), 0);
}

// ========================================================================
// Incoming calls
// ========================================================================

#[tokio::test]
async fn unhandled_incoming_call_is_dropped_silently() {
    let (session, _events, transport) = session();

    session
        .dispatch(vec![peer().call("nobody-home", json!({}))])
        .await
        .unwrap();

    assert!(transport.sent().is_empty(), "no reply is ever sent");
}

#[tokio::test]
async fn handler_reply_then_return_emits_exactly_two_replies() {
    let (session, _events, transport) = session();

    session.on("order-milk", |_payload, replier: Replier| async move {
        let _ = replier.reply(json!({ "meaningfuldata": "doge" })).await;
        json!({ "id": "123", "total": "$123.00" })
    });

    session
        .dispatch(vec![peer().call("order-milk", json!({ "size": "litre" }))])
        .await
        .unwrap();

    let replies = transport.sent_replies();
    assert_eq!(replies.len(), 2);
    assert_eq!(
        replies[0],
        (0, false, json!({ "meaningfuldata": "doge" })),
        "streamed part comes first"
    );
    assert_eq!(
        replies[1],
        (1, true, json!({ "id": "123", "total": "$123.00" })),
        "return value terminates the stream"
    );
}

#[tokio::test]
async fn handler_return_value_becomes_a_done_reply_at_part_zero() {
    let (session, _events, transport) = session();

    session.on("order-milk", |payload, _replier| async move {
        assert_eq!(payload, json!({ "size": "litre" }));
        json!({ "id": "123", "total": "$123.00" })
    });

    session
        .dispatch(vec![peer().call("order-milk", json!({ "size": "litre" }))])
        .await
        .unwrap();

    assert_eq!(
        transport.sent_replies(),
        vec![(0, true, json!({ "id": "123", "total": "$123.00" }))]
    );
}

#[tokio::test]
async fn multiple_handlers_share_one_part_counter() {
    let (session, _events, transport) = session();

    session.on("lime", |_p, _r| async move { json!("first") });
    session.on("lime", |_p, _r| async move { json!("second") });

    let call = peer().call("lime", Value::Null);
    let call_id = call.id().unwrap().to_string();
    session.dispatch(vec![call]).await.unwrap();

    let replies = transport.sent_replies();
    assert_eq!(replies.len(), 2, "one done reply per handler");
    assert!(replies.iter().all(|(_, done, _)| *done));

    let mut parts: Vec<u64> = replies.iter().map(|(part, _, _)| *part).collect();
    parts.sort_unstable();
    assert_eq!(parts, vec![0, 1], "parts never collide across handlers");

    for msg in transport.sent() {
        let Message::Reply { to, .. } = msg else {
            continue;
        };
        assert_eq!(to.id, call_id, "all replies route to the one caller");
    }
}

#[tokio::test]
async fn off_removes_a_handler_registration() {
    let (session, _events, transport) = session();

    let id = session.on("lime", |_p, _r| async move { json!("ack") });
    session.dispatch(vec![peer().call("lime", json!({}))]).await.unwrap();
    assert_eq!(transport.sent_replies().len(), 1);

    assert!(session.off("lime", id));
    session.dispatch(vec![peer().call("lime", json!({}))]).await.unwrap();
    assert_eq!(transport.sent_replies().len(), 1, "handler is gone");

    assert!(!session.off("lime", id), "second removal reports false");
}

// ========================================================================
// Dispatch validation
// ========================================================================

#[tokio::test]
async fn invalid_message_fails_dispatch_after_earlier_messages_ran() {
    let (session, _events, _transport) = session();
    let replies: Arc<Mutex<Vec<(Value, u64)>>> = Arc::new(Mutex::new(Vec::new()));

    let options = CallOptions::new().on_reply({
        let replies = replies.clone();
        move |payload, part| replies.lock().push((payload, part))
    });
    let handle = session.call("lime", Value::Null, options).await.unwrap();

    let invalid = Message::Call {
        id: "c2".into(),
        seq: 0,
        event: String::new(),
        payload: Value::Null,
        origin: Origin::new("peer"),
    };
    let err = session
        .dispatch(vec![
            reply_to(handle.message(), 0, false, json!("early")),
            invalid,
        ])
        .await
        .unwrap_err();

    assert!(matches!(err, DispatchError::Validation(_)));
    assert_eq!(
        *replies.lock(),
        vec![(json!("early"), 0)],
        "the message before the invalid one was already dispatched"
    );
}

// ========================================================================
// Handshake
// ========================================================================

#[tokio::test(start_paused = true)]
async fn open_resolves_when_the_accept_arrives() {
    let (session, mut events, transport) = session();

    let opening = tokio::spawn({
        let session = session.clone();
        async move { session.open().await }
    });
    breathe().await;

    let sent = transport.sent();
    let Some(Message::Handshake { id, origin, .. }) = sent.first() else {
        panic!("expected a handshake, got {sent:?}");
    };
    assert_eq!(origin.id, "local");
    assert!(!session.is_ready());

    let accept = peer().handshake_accept(id.clone(), Value::Null);
    session.dispatch(vec![accept]).await.unwrap();

    opening.await.unwrap().unwrap();
    assert!(session.is_ready());
    assert_eq!(events.recv().await, Some(SessionEvent::Ready));
}

#[tokio::test(start_paused = true)]
async fn open_times_out_as_a_failure_value() {
    let (session, _events, _transport) = session();

    let err = session.open().await.unwrap_err();
    assert!(matches!(err, HandshakeError::TimedOut));
    assert!(!session.is_ready());

    // A timed-out session may try again.
    let err = session.open().await.unwrap_err();
    assert!(matches!(err, HandshakeError::TimedOut));
}

#[tokio::test]
async fn auto_accept_policy_answers_a_peer_handshake() {
    let transport = RecordingTransport::default();
    let (session, mut events) = Session::with_policy(
        Origin::new("server"),
        transport.clone(),
        SessionConfig::default(),
        AutoAccept,
    )
    .unwrap();

    let handshake = peer().handshake(json!({ "hello": true }));
    let handshake_id = handshake.id().unwrap().to_string();
    session.dispatch(vec![handshake]).await.unwrap();

    let sent = transport.sent();
    let Some(Message::HandshakeAccept { to, .. }) = sent.first() else {
        panic!("expected a handshake-accept, got {sent:?}");
    };
    assert_eq!(to.id, handshake_id);

    assert!(matches!(
        events.recv().await,
        Some(SessionEvent::HandshakeReceived { origin, .. }) if origin.id == "peer"
    ));
}

#[tokio::test]
async fn default_policy_never_answers_a_peer_handshake() {
    let (session, mut events, transport) = session();

    session
        .dispatch(vec![peer().handshake(Value::Null)])
        .await
        .unwrap();

    assert!(transport.sent().is_empty(), "accepting is not the engine's call");
    assert!(matches!(
        events.recv().await,
        Some(SessionEvent::HandshakeReceived { .. })
    ));
}

// ========================================================================
// Keepalive
// ========================================================================

async fn open_and_accept(
    session: &Session,
    events: &mut UnboundedReceiver<SessionEvent>,
    transport: &RecordingTransport,
) {
    let opening = tokio::spawn({
        let session = session.clone();
        async move { session.open().await }
    });
    breathe().await;
    let Some(Message::Handshake { id, .. }) = transport.sent().first().cloned() else {
        panic!("expected a handshake");
    };
    session
        .dispatch(vec![peer().handshake_accept(id, Value::Null)])
        .await
        .unwrap();
    opening.await.unwrap().unwrap();
    assert_eq!(events.recv().await, Some(SessionEvent::Ready));
}

fn ping_count(transport: &RecordingTransport) -> usize {
    transport
        .sent()
        .iter()
        .filter(|m| matches!(m, Message::Ping))
        .count()
}

#[tokio::test(start_paused = true)]
async fn heartbeat_signals_liveness_per_tick() {
    let (session, mut events, transport) = session();
    open_and_accept(&session, &mut events, &transport).await;

    // First tick: the seeded flag judges the pre-ping interval as alive.
    assert_eq!(events.recv().await, Some(SessionEvent::LivenessOk));
    assert_eq!(ping_count(&transport), 1);

    // No pong before the second tick: one failure per missed tick.
    assert_eq!(events.recv().await, Some(SessionEvent::LivenessFailed));
    assert_eq!(events.recv().await, Some(SessionEvent::LivenessFailed));

    // A pong restores liveness for the following tick.
    session.dispatch(vec![Message::Pong]).await.unwrap();
    assert_eq!(events.recv().await, Some(SessionEvent::LivenessOk));
}

#[tokio::test(start_paused = true)]
async fn stop_keepalive_prevents_further_ticks_and_is_idempotent() {
    let (session, mut events, transport) = session();
    open_and_accept(&session, &mut events, &transport).await;

    assert_eq!(events.recv().await, Some(SessionEvent::LivenessOk));
    session.stop_keepalive();
    session.stop_keepalive();

    let pings = ping_count(&transport);
    tokio::time::advance(Duration::from_secs(2)).await;
    breathe().await;
    assert_eq!(ping_count(&transport), pings, "no ticks after stop");
}

#[tokio::test]
async fn inbound_ping_is_answered_with_a_pong() {
    let (session, _events, transport) = session();

    session.dispatch(vec![Message::Ping]).await.unwrap();

    assert!(matches!(transport.sent().as_slice(), [Message::Pong]));
}

// ========================================================================
// Lifecycle
// ========================================================================

#[tokio::test]
async fn close_cancels_pending_calls_and_emits_closed() {
    let (session, mut events, _transport) = session();

    let handle = session
        .call("lime", Value::Null, CallOptions::new())
        .await
        .unwrap();

    session.close();
    session.close(); // idempotent

    let outcome = handle.result().await.unwrap();
    assert!(outcome.canceled, "close cancels, it does not complete");
    assert_eq!(outcome.data, Value::Null);

    assert_eq!(events.recv().await, Some(SessionEvent::Closed));
    assert!(matches!(
        session.call("lime", Value::Null, CallOptions::new()).await,
        Err(CallError::SessionClosed)
    ));
    assert!(matches!(session.open().await, Err(HandshakeError::Closed)));
}

#[tokio::test(start_paused = true)]
async fn close_wakes_a_pending_open() {
    let (session, _events, _transport) = session();

    let opening = tokio::spawn({
        let session = session.clone();
        async move { session.open().await }
    });
    breathe().await;

    session.close();
    assert!(matches!(
        opening.await.unwrap(),
        Err(HandshakeError::Closed)
    ));
}

#[tokio::test]
async fn empty_origin_id_is_a_construction_error() {
    let err = Session::new(
        Origin::new(""),
        RecordingTransport::default(),
        SessionConfig::default(),
    )
    .unwrap_err();
    assert!(err.to_string().contains("origin.id"));
}
