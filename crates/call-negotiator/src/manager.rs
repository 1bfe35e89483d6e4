use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use signal_relay::SignalSink;
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::CallConfig;
use crate::engine::{ChannelHandle, ChannelOptions, EngineFactory, TrackHandle};
use crate::error::{NegotiationError, Result};
use crate::events::{CallEvent, EventBus};
use crate::gateway::{OrphanCandidates, Outbound, SignalingGateway};
use crate::id::CallId;
use crate::negotiation::{DialOptions, NegotiationEngine};
use crate::registry::{SessionHandle, SessionRegistry};
use crate::session::{Role, SessionSnapshot};
use crate::worker::{self, CloseReason, SessionCommand, WorkerContext};

/// State shared by the manager, its gateway and every call worker.
pub(crate) struct Shared {
    ctx: Arc<WorkerContext>,
    events: Arc<EventBus>,
    orphans: Mutex<OrphanCandidates>,
}

impl Shared {
    pub(crate) fn config(&self) -> &CallConfig {
        &self.ctx.config
    }

    pub(crate) fn registry(&self) -> &SessionRegistry {
        &self.ctx.registry
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.events
    }

    pub(crate) fn orphans(&self) -> MutexGuard<'_, OrphanCandidates> {
        self.orphans.lock()
    }

    pub(crate) fn spawn_session(
        &self,
        id: CallId,
        remote_peer: &str,
        role: Role,
        stream: bool,
    ) -> Result<SessionHandle> {
        let seed = self.ctx.registry.create(id, remote_peer, role)?;
        let handle = seed.handle.clone();
        worker::spawn(self.ctx.clone(), seed, stream);
        Ok(handle)
    }
}

/// Entry point for the application: places and tears down calls, and owns
/// the gateway that inbound signaling is fed through.
///
/// Must be used from within a tokio runtime; every call runs on its own
/// task.
#[derive(Clone)]
pub struct CallManager {
    shared: Arc<Shared>,
}

impl CallManager {
    pub fn new(
        config: CallConfig,
        factory: Arc<dyn EngineFactory>,
        sink: Arc<dyn SignalSink>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let events = Arc::new(EventBus::new());
        let outbound = Outbound::new(config.local_peer_id.clone(), sink);
        let negotiation = Arc::new(NegotiationEngine::new(config.clone(), events.clone(), outbound));
        let orphans = OrphanCandidates::new(config.orphan_candidate_limit, config.orphan_candidate_ttl);
        let ctx = Arc::new(WorkerContext {
            registry: Arc::new(SessionRegistry::new(config.closed_id_memory)),
            config,
            negotiation,
            factory,
        });
        tracing::info!(target = "negotiation", peer = %ctx.config.local_peer_id, "call manager ready");
        Ok(Self {
            shared: Arc::new(Shared {
                ctx,
                events,
                orphans: Mutex::new(orphans),
            }),
        })
    }

    pub fn local_peer_id(&self) -> &str {
        &self.shared.config().local_peer_id
    }

    pub fn config(&self) -> &CallConfig {
        self.shared.config()
    }

    /// Places a call under a fresh id. The offer is produced asynchronously
    /// by the call's worker.
    pub fn dial(&self, remote_peer: &str, options: DialOptions) -> Result<CallId> {
        let id = CallId::random();
        let stream = options.stream || !options.tracks.is_empty();
        let handle = self
            .shared
            .spawn_session(id.clone(), remote_peer, Role::Caller, stream)?;
        tracing::info!(target = "negotiation", call_id = %id, peer = %remote_peer, "dialing");
        handle.send(SessionCommand::Dial(options))?;
        Ok(id)
    }

    /// Closes a call and waits for its teardown. Closing a call that is not
    /// live is a no-op.
    pub async fn close(&self, id: &CallId) -> Result<()> {
        self.close_with(id, CloseReason::Local).await
    }

    /// The remote side hung up, as reported by the application's transport.
    pub async fn remote_closed(&self, id: &CallId) -> Result<()> {
        self.close_with(id, CloseReason::Remote).await
    }

    async fn close_with(&self, id: &CallId, reason: CloseReason) -> Result<()> {
        let registry = self.shared.registry();
        let Ok(handle) = registry.get(id) else {
            tracing::debug!(target = "negotiation", call_id = %id, "close for call that is not live");
            return Ok(());
        };
        let task = registry.take_task(id);
        handle.cancel(reason);
        if let Some(task) = task {
            if let Err(err) = task.await {
                tracing::warn!(target = "negotiation", call_id = %id, error = %err, "call worker panicked");
            }
        }
        Ok(())
    }

    /// Closes every live call.
    pub async fn shutdown(&self) {
        let registry = self.shared.registry();
        let mut tasks = Vec::new();
        for handle in registry.handles() {
            if let Some(task) = registry.take_task(&handle.id) {
                tasks.push(task);
            }
            handle.cancel(CloseReason::Shutdown);
        }
        for task in tasks {
            let _ = task.await;
        }
    }

    pub async fn add_track(&self, id: &CallId, track: TrackHandle) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(id, SessionCommand::AddTrack { track, reply })?;
        rx.await.map_err(|_| NegotiationError::Closed)?
    }

    /// Adds a channel to a live call. The first channel on a negotiated call
    /// triggers a fresh offer.
    pub async fn create_data_channel(
        &self,
        id: &CallId,
        label: &str,
        options: ChannelOptions,
    ) -> Result<ChannelHandle> {
        let (reply, rx) = oneshot::channel();
        self.command(
            id,
            SessionCommand::CreateChannel {
                label: label.to_string(),
                options,
                reply,
            },
        )?;
        rx.await.map_err(|_| NegotiationError::Closed)?
    }

    /// Starts a new offer cycle on the call, e.g. to retry after a failed
    /// offer.
    pub fn renegotiate(&self, id: &CallId) -> Result<()> {
        self.command(id, SessionCommand::Renegotiate)
    }

    pub async fn data_channel(&self, id: &CallId, label: &str) -> Result<Option<ChannelHandle>> {
        let (reply, rx) = oneshot::channel();
        self.command(
            id,
            SessionCommand::DataChannel {
                label: label.to_string(),
                reply,
            },
        )?;
        rx.await.map_err(|_| NegotiationError::Closed)
    }

    pub async fn remote_tracks(&self, id: &CallId) -> Result<Vec<TrackHandle>> {
        let (reply, rx) = oneshot::channel();
        self.command(id, SessionCommand::RemoteTracks { reply })?;
        rx.await.map_err(|_| NegotiationError::Closed)
    }

    fn command(&self, id: &CallId, command: SessionCommand) -> Result<()> {
        self.shared.registry().get(id)?.send(command)
    }

    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(&CallId, CallEvent) + Send + Sync + 'static,
    {
        self.shared.events.on_event(handler);
    }

    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&CallId, &NegotiationError) + Send + Sync + 'static,
    {
        self.shared.events.on_error(handler);
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<(CallId, CallEvent)> {
        self.shared.events.subscribe()
    }

    pub fn snapshot(&self, id: &CallId) -> Option<SessionSnapshot> {
        self.shared.registry().get(id).ok().map(|handle| handle.snapshot())
    }

    /// Follows a call's snapshots; the last one published has `closed` set.
    pub fn watch(&self, id: &CallId) -> Option<watch::Receiver<SessionSnapshot>> {
        self.shared.registry().get(id).ok().map(|handle| handle.watch())
    }

    /// Live call ids, sorted.
    pub fn calls(&self) -> Vec<CallId> {
        self.shared.registry().ids()
    }

    pub fn is_live(&self, id: &CallId) -> bool {
        self.shared.registry().get(id).is_ok()
    }

    pub fn gateway(&self) -> SignalingGateway {
        SignalingGateway::new(self.shared.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingSink, ScriptedFactory};

    #[test]
    fn invalid_config_is_rejected() {
        let config = CallConfig::new("");
        let err = CallManager::new(config, ScriptedFactory::new(), RecordingSink::new())
            .err()
            .expect("empty peer id");
        assert!(matches!(err, NegotiationError::Config(_)));
    }

    #[tokio::test]
    async fn dial_produces_distinct_ids() {
        let manager = CallManager::new(
            CallConfig::localhost("alice"),
            ScriptedFactory::new(),
            RecordingSink::new(),
        )
        .expect("manager");
        let first = manager.dial("bob", DialOptions::new()).expect("dial bob");
        let second = manager.dial("carol", DialOptions::new()).expect("dial carol");
        assert_ne!(first, second);
        assert_eq!(manager.calls().len(), 2);
        manager.shutdown().await;
        assert!(manager.calls().is_empty());
    }

    #[tokio::test]
    async fn operations_on_unknown_call_fail() {
        let manager = CallManager::new(
            CallConfig::localhost("alice"),
            ScriptedFactory::new(),
            RecordingSink::new(),
        )
        .expect("manager");
        let id = CallId::random();
        assert_eq!(
            manager.renegotiate(&id).err(),
            Some(NegotiationError::UnknownSession(id.clone()))
        );
        assert!(manager.close(&id).await.is_ok());
        assert!(manager.snapshot(&id).is_none());
    }
}
