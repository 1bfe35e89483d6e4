#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use call_negotiator::testing::{wait_for_snapshot, ScriptedEngine, ScriptedFactory};
use call_negotiator::{CallConfig, CallEvent, CallId, CallManager, SessionSnapshot};
use signal_relay::LocalRelay;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One side of a call: a manager wired to the shared relay, its scripted
/// engines and everything it reported.
pub struct Peer {
    pub manager: CallManager,
    pub factory: Arc<ScriptedFactory>,
    pub events: mpsc::UnboundedReceiver<(CallId, CallEvent)>,
    pump: JoinHandle<()>,
}

impl Peer {
    pub fn attach(relay: &Arc<LocalRelay>, config: CallConfig) -> Self {
        Self::attach_with(relay, config, ScriptedFactory::new())
    }

    pub fn attach_with(relay: &Arc<LocalRelay>, config: CallConfig, factory: Arc<ScriptedFactory>) -> Self {
        let inbound = relay.attach(&config.local_peer_id);
        let manager = CallManager::new(config, factory.clone(), relay.clone()).expect("manager");
        let events = manager.subscribe();
        let pump = manager.gateway().spawn_pump(inbound);
        Self {
            manager,
            factory,
            events,
            pump,
        }
    }

    pub async fn engine(&self, id: &CallId) -> Arc<ScriptedEngine> {
        self.factory.wait_engine(id).await
    }

    /// Waits for the next event named `name` on call `id`, skipping others.
    pub async fn next_event(&mut self, id: &CallId, name: &str) -> CallEvent {
        loop {
            let (call, event) = self.events.recv().await.expect("event stream open");
            if &call == id && event.name() == name {
                return event;
            }
        }
    }

    /// Waits for the next incoming call from anyone.
    pub async fn incoming(&mut self) -> (CallId, String) {
        loop {
            let (call, event) = self.events.recv().await.expect("event stream open");
            if let CallEvent::IncomingCall { from, .. } = event {
                return (call, from);
            }
        }
    }

    /// Everything reported so far that has not been consumed.
    pub fn drain(&mut self) -> Vec<(CallId, &'static str)> {
        let mut seen = Vec::new();
        while let Ok((call, event)) = self.events.try_recv() {
            seen.push((call, event.name()));
        }
        seen
    }

    pub async fn wait_stable(&self, id: &CallId) -> SessionSnapshot {
        let mut snapshots = self.manager.watch(id).expect("call is live");
        let snapshot = wait_for_snapshot(&mut snapshots, |s| s.is_stable() || s.closed).await;
        assert!(!snapshot.closed, "call {id} closed before reaching stable");
        snapshot
    }

    pub async fn wait_closed(&self, id: &CallId) {
        if let Some(mut snapshots) = self.manager.watch(id) {
            wait_for_snapshot(&mut snapshots, |s| s.closed).await;
        }
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Alice calls bob over a fresh relay and both reach stable.
pub async fn connected_pair(alice: CallConfig, bob: CallConfig) -> (Arc<LocalRelay>, Peer, Peer, CallId) {
    let relay = LocalRelay::new();
    let alice = Peer::attach(&relay, alice);
    let mut bob = Peer::attach(&relay, bob);
    let bob_id = bob.manager.local_peer_id().to_string();
    let id = alice
        .manager
        .dial(&bob_id, call_negotiator::DialOptions::new().channel("chat"))
        .expect("dial");
    let (incoming, from) = bob.incoming().await;
    assert_eq!(incoming, id);
    assert_eq!(from, alice.manager.local_peer_id());
    alice.wait_stable(&id).await;
    bob.wait_stable(&id).await;
    (relay, alice, bob, id)
}

/// Polls `condition` until it holds.
pub async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    while !condition() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
