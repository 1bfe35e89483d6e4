mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use call_negotiator::testing::{RecordingSink, ScriptedFactory};
use call_negotiator::{
    CallConfig, CallEvent, CallManager, Delivery, DialOptions, IceCandidate, IceState,
    NegotiationError, Role, Signal, SignalMessage, SignalingState,
};
use common::{connected_pair, eventually, init_tracing, Peer};
use signal_relay::LocalRelay;

#[test_timeout::tokio_timeout_test]
async fn close_before_answer_reports_disconnected_once() {
    init_tracing();
    let relay = LocalRelay::new();
    let mut alice = Peer::attach(&relay, CallConfig::localhost("alice"));
    let _bob_inbound = relay.attach("bob");
    relay.set_offline("bob", true);

    let id = alice.manager.dial("bob", DialOptions::new()).expect("dial");
    let engine = alice.engine(&id).await;
    eventually(|| engine.signaling_state() == SignalingState::HaveLocalOffer).await;

    alice.manager.close(&id).await.expect("close");
    assert!(!alice.manager.is_live(&id));
    assert!(engine.is_closed());
    alice.next_event(&id, "disconnected").await;

    alice.manager.close(&id).await.expect("second close is a no-op");
    assert!(alice.drain().iter().all(|(_, name)| *name != "disconnected"));
}

#[test_timeout::tokio_timeout_test]
async fn ice_failure_restarts_once_then_closes() {
    init_tracing();
    let (_relay, mut alice, bob, id) =
        connected_pair(CallConfig::localhost("alice"), CallConfig::localhost("bob")).await;
    let alice_engine = alice.engine(&id).await;
    let bob_engine = bob.engine(&id).await;

    alice_engine.emit_ice_state(IceState::Failed);
    let mut snapshots = alice.manager.watch(&id).expect("live");
    call_negotiator::testing::wait_for_snapshot(&mut snapshots, |s| {
        s.ice_restarts == 1 && s.is_stable()
    })
    .await;
    assert_eq!(alice_engine.ice_restart_offers(), 1);
    eventually(|| bob_engine.answers_created() == 2).await;

    alice_engine.emit_ice_state(IceState::Failed);
    match alice.next_event(&id, "error").await {
        CallEvent::Error(err) => assert_eq!(err, NegotiationError::IceFailed { restarts: 1 }),
        other => panic!("unexpected {other:?}"),
    }
    alice.next_event(&id, "disconnected").await;
    alice.wait_closed(&id).await;
    assert!(!alice.manager.is_live(&id));
    assert!(alice_engine.is_closed());
    assert!(alice.drain().is_empty());
}

#[test_timeout::tokio_timeout_test]
async fn connected_resets_the_restart_budget() {
    init_tracing();
    let (_relay, mut alice, _bob, id) =
        connected_pair(CallConfig::localhost("alice"), CallConfig::localhost("bob")).await;
    let engine = alice.engine(&id).await;
    let mut snapshots = alice.manager.watch(&id).expect("live");

    engine.emit_ice_state(IceState::Failed);
    call_negotiator::testing::wait_for_snapshot(&mut snapshots, |s| s.ice_restarts == 1 && s.is_stable())
        .await;
    engine.emit_ice_state(IceState::Connected);
    alice.next_event(&id, "connected").await;
    assert_eq!(alice.manager.snapshot(&id).expect("live").ice_restarts, 0);

    engine.emit_ice_state(IceState::Failed);
    call_negotiator::testing::wait_for_snapshot(&mut snapshots, |s| s.ice_restarts == 1 && s.is_stable())
        .await;
    assert_eq!(engine.ice_restart_offers(), 2);
    assert!(alice.manager.is_live(&id));
}

#[test_timeout::tokio_timeout_test]
async fn ice_disconnect_is_reported_once_per_drop() {
    init_tracing();
    let (_relay, mut alice, _bob, id) =
        connected_pair(CallConfig::localhost("alice"), CallConfig::localhost("bob")).await;
    let engine = alice.engine(&id).await;

    engine.emit_ice_state(IceState::Connected);
    alice.next_event(&id, "connected").await;
    engine.emit_ice_state(IceState::Disconnected);
    alice.next_event(&id, "disconnected").await;

    alice.manager.close(&id).await.expect("close");
    assert!(alice.drain().iter().all(|(_, name)| *name != "disconnected"));
}

#[test_timeout::tokio_timeout_test]
async fn close_discards_an_offer_in_flight() {
    init_tracing();
    let sink = RecordingSink::new();
    let factory = ScriptedFactory::with_offer_delay(Duration::from_secs(5));
    let alice = CallManager::new(CallConfig::localhost("alice"), factory.clone(), sink.clone())
        .expect("manager");
    let mut events = alice.subscribe();

    let id = alice.dial("bob", DialOptions::new()).expect("dial");
    let engine = factory.wait_engine(&id).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    alice.close(&id).await.expect("close");

    assert!(sink.envelopes().is_empty());
    assert_eq!(engine.offers_created(), 0);
    assert!(engine.is_closed());
    let (call, event) = events.recv().await.expect("event");
    assert_eq!(call, id);
    assert!(matches!(event, CallEvent::Disconnected));
}

#[test_timeout::tokio_timeout_test(timeout = 10, paused)]
async fn unanswered_offer_times_out() {
    init_tracing();
    let sink = RecordingSink::new();
    let config = CallConfig::builder()
        .local_peer_id("alice")
        .localhost_only()
        .answer_timeout(Duration::from_secs(15))
        .build()
        .expect("config");
    let alice = CallManager::new(config, ScriptedFactory::new(), sink.clone()).expect("manager");
    let mut events = alice.subscribe();
    let id = alice.dial("bob", DialOptions::new()).expect("dial");

    let (call, event) = events.recv().await.expect("event");
    assert_eq!(call, id);
    match event {
        CallEvent::Error(err) => {
            assert_eq!(err, NegotiationError::AnswerTimeout(Duration::from_secs(15)))
        }
        other => panic!("unexpected {other:?}"),
    }
    let (_, event) = events.recv().await.expect("event");
    assert!(matches!(event, CallEvent::Disconnected));
    assert!(!alice.is_live(&id));
    assert_eq!(sink.messages().len(), 1);
}

#[test_timeout::tokio_timeout_test]
async fn remote_hangup_closes_and_tombstones_the_call() {
    init_tracing();
    let (_relay, alice, mut bob, id) =
        connected_pair(CallConfig::localhost("alice"), CallConfig::localhost("bob")).await;

    bob.manager.remote_closed(&id).await.expect("closed");
    bob.next_event(&id, "disconnected").await;
    assert!(!bob.manager.is_live(&id));
    assert!(alice.manager.is_live(&id));

    let late = SignalMessage::new(
        id.clone(),
        "bob",
        Some("alice".into()),
        Role::Caller,
        Signal::Candidate(IceCandidate::new("candidate:9 1 udp 1 10.0.0.9 9 typ host")),
    );
    assert_eq!(
        bob.manager.gateway().handle_message(late).expect("routed"),
        Delivery::Ignored
    );
    assert!(bob.manager.calls().is_empty());
}

#[test_timeout::tokio_timeout_test]
async fn engine_creation_failure_is_reported() {
    init_tracing();
    let sink = RecordingSink::new();
    let factory = ScriptedFactory::new();
    factory.set_fail_create(true);
    let alice = CallManager::new(CallConfig::localhost("alice"), factory, sink.clone())
        .expect("manager");
    let errors = Arc::new(AtomicUsize::new(0));
    let counter = errors.clone();
    alice.on_error(move |_, err| {
        assert!(matches!(err, NegotiationError::NegotiationFailed(_)));
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let mut events = alice.subscribe();

    let id = alice.dial("bob", DialOptions::new()).expect("dial");
    let mut names = Vec::new();
    while names.last() != Some(&"disconnected") {
        let (call, event) = events.recv().await.expect("event");
        assert_eq!(call, id);
        names.push(event.name());
    }
    assert_eq!(names, vec!["error", "disconnected"]);
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert!(sink.envelopes().is_empty());
    assert!(!alice.is_live(&id));
}

#[test_timeout::tokio_timeout_test]
async fn failed_offer_can_be_retried() {
    init_tracing();
    let sink = RecordingSink::new();
    let factory = ScriptedFactory::new();
    factory.set_fail_offers(true);
    let alice = CallManager::new(CallConfig::localhost("alice"), factory.clone(), sink.clone())
        .expect("manager");
    let mut events = alice.subscribe();

    let id = alice.dial("bob", DialOptions::new()).expect("dial");
    let (_, event) = events.recv().await.expect("event");
    assert!(matches!(event, CallEvent::Error(NegotiationError::NegotiationFailed(_))));
    assert!(alice.is_live(&id));
    assert!(sink.envelopes().is_empty());

    factory.engine(&id).expect("engine").set_fail_offers(false);
    alice.renegotiate(&id).expect("renegotiate");
    let sent = sink.wait_for(1).await;
    assert_eq!(sent[0].id, id);
    assert!(matches!(sent[0].signal(), Ok(Signal::Description(desc)) if desc.is_offer()));
}

#[test_timeout::tokio_timeout_test]
async fn shutdown_closes_every_call() {
    init_tracing();
    let relay = LocalRelay::new();
    let mut alice = Peer::attach(&relay, CallConfig::localhost("alice"));
    let _bob = relay.attach("bob");
    let _carol = relay.attach("carol");
    let first = alice.manager.dial("bob", DialOptions::new()).expect("dial bob");
    let second = alice.manager.dial("carol", DialOptions::new()).expect("dial carol");
    assert_eq!(alice.manager.calls().len(), 2);

    alice.manager.shutdown().await;
    assert!(alice.manager.calls().is_empty());
    let closed: Vec<_> = alice
        .drain()
        .into_iter()
        .filter(|(_, name)| *name == "disconnected")
        .map(|(call, _)| call)
        .collect();
    assert_eq!(closed.len(), 2);
    assert!(closed.contains(&first));
    assert!(closed.contains(&second));
}
