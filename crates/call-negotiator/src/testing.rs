//! Deterministic stand-ins for the engine and the signaling transport.
//!
//! [`ScriptedEngine`] follows the offer/answer rules of a real peer
//! connection closely enough to catch sequencing mistakes: it refuses
//! answers without a local offer, refuses remote offers while holding one of
//! its own, and rejects candidates before a remote description. Nothing
//! happens on the network; tests drive ICE progress and channel/track
//! callbacks by hand.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use signal_relay::{RelayResult, SignalEnvelope, SignalSink};
use tokio::sync::{mpsc, watch};

use crate::config::CallConfig;
use crate::engine::{
    ChannelHandle, ChannelOptions, EngineError, EngineEvent, EngineEventSender, EngineFactory,
    EngineResult, PeerEngine, TrackHandle, TrackKind,
};
use crate::id::CallId;
use crate::protocol::{IceCandidate, SdpType, SessionDescription, SignalMessage};
use crate::session::{IceState, SessionSnapshot, SignalingState};

/// Native object behind channels created by [`ScriptedEngine`].
#[derive(Debug, Clone)]
pub struct ScriptedChannel {
    pub label: String,
    pub options: ChannelOptions,
}

struct ScriptedState {
    signaling: SignalingState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied_candidates: Vec<IceCandidate>,
    offers: usize,
    restart_offers: usize,
    answers: usize,
    rollbacks: usize,
    channels: Vec<String>,
    tracks: Vec<String>,
    closed: bool,
}

pub struct ScriptedEngine {
    id: CallId,
    events: EngineEventSender,
    offer_delay: Option<Duration>,
    fail_offers: AtomicBool,
    state: Mutex<ScriptedState>,
}

impl ScriptedEngine {
    pub fn new(id: CallId, events: EngineEventSender) -> Arc<Self> {
        Self::with_options(id, events, None, false)
    }

    /// An engine whose callbacks go nowhere.
    pub fn detached(id: CallId) -> Arc<Self> {
        let (events, _) = mpsc::unbounded_channel();
        Self::new(id, events)
    }

    fn with_options(
        id: CallId,
        events: EngineEventSender,
        offer_delay: Option<Duration>,
        fail_offers: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            events,
            offer_delay,
            fail_offers: AtomicBool::new(fail_offers),
            state: Mutex::new(ScriptedState {
                signaling: SignalingState::Stable,
                local: None,
                remote: None,
                applied_candidates: Vec::new(),
                offers: 0,
                restart_offers: 0,
                answers: 0,
                rollbacks: 0,
                channels: Vec::new(),
                tracks: Vec::new(),
                closed: false,
            }),
        })
    }

    pub fn id(&self) -> &CallId {
        &self.id
    }

    pub fn set_fail_offers(&self, fail: bool) {
        self.fail_offers.store(fail, Ordering::SeqCst);
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied_candidates.clone()
    }

    pub fn offers_created(&self) -> usize {
        self.state.lock().offers
    }

    pub fn ice_restart_offers(&self) -> usize {
        self.state.lock().restart_offers
    }

    pub fn answers_created(&self) -> usize {
        self.state.lock().answers
    }

    pub fn rollbacks(&self) -> usize {
        self.state.lock().rollbacks
    }

    pub fn channels(&self) -> Vec<String> {
        self.state.lock().channels.clone()
    }

    pub fn tracks(&self) -> Vec<String> {
        self.state.lock().tracks.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    pub fn emit_ice_state(&self, state: IceState) {
        self.emit(EngineEvent::IceState(state));
    }

    pub fn emit_local_candidate(&self, candidate: &str) {
        self.emit(EngineEvent::LocalCandidate(Some(IceCandidate::new(candidate))));
    }

    pub fn emit_gathering_complete(&self) {
        self.emit(EngineEvent::LocalCandidate(None));
    }

    pub fn emit_remote_track(&self, id: &str, kind: TrackKind) -> TrackHandle {
        let track = TrackHandle::new(id, kind, Some(format!("stream-{id}")), id.to_string());
        self.emit(EngineEvent::RemoteTrack(track.clone()));
        track
    }

    pub fn emit_remote_channel(&self, label: &str) -> ChannelHandle {
        let channel = ChannelHandle::new(
            label,
            ScriptedChannel {
                label: label.to_string(),
                options: ChannelOptions::default(),
            },
        );
        self.emit(EngineEvent::RemoteChannel(channel.clone()));
        channel
    }

    pub fn open_channel(&self, label: &str) {
        self.emit(EngineEvent::ChannelOpen(label.to_string()));
    }

    fn sdp(&self, kind: &str, version: usize) -> String {
        format!("v=0\r\no=- {} {version} IN IP4 127.0.0.1\r\ns={kind}\r\nt=0 0\r\n", self.id)
    }
}

fn invalid(state: SignalingState, action: &str) -> EngineError {
    EngineError::InvalidState(format!("cannot {action} in {state:?}"))
}

#[async_trait]
impl PeerEngine for ScriptedEngine {
    async fn create_offer(&self, ice_restart: bool) -> EngineResult<SessionDescription> {
        if let Some(delay) = self.offer_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_offers.load(Ordering::SeqCst) {
            return Err(EngineError::Failed("scripted offer failure".into()));
        }
        let mut state = self.state.lock();
        if state.closed {
            return Err(EngineError::Closed);
        }
        state.offers += 1;
        if ice_restart {
            state.restart_offers += 1;
        }
        Ok(SessionDescription::offer(self.sdp("offer", state.offers)))
    }

    async fn create_answer(&self) -> EngineResult<SessionDescription> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(EngineError::Closed);
        }
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(invalid(state.signaling, "create answer"));
        }
        state.answers += 1;
        Ok(SessionDescription::answer(self.sdp("answer", state.answers)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> EngineResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(EngineError::Closed);
        }
        state.signaling = match (desc.kind, state.signaling) {
            (SdpType::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                SignalingState::HaveLocalOffer
            }
            (SdpType::Answer | SdpType::Pranswer, SignalingState::HaveRemoteOffer) => {
                SignalingState::Stable
            }
            (SdpType::Rollback, _) => SignalingState::Stable,
            (_, current) => return Err(invalid(current, "set local description")),
        };
        state.local = Some(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> EngineResult<()> {
        if desc.kind != SdpType::Rollback && !desc.sdp.starts_with("v=0") {
            return Err(EngineError::Failed("unparseable session description".into()));
        }
        let mut state = self.state.lock();
        if state.closed {
            return Err(EngineError::Closed);
        }
        state.signaling = match (desc.kind, state.signaling) {
            (SdpType::Offer, SignalingState::Stable | SignalingState::HaveRemoteOffer) => {
                SignalingState::HaveRemoteOffer
            }
            (SdpType::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
            (SdpType::Pranswer, SignalingState::HaveLocalOffer) => SignalingState::HaveLocalOffer,
            (SdpType::Rollback, _) => SignalingState::Stable,
            (_, current) => return Err(invalid(current, "set remote description")),
        };
        state.remote = Some(desc);
        Ok(())
    }

    /// Only a pending local offer can be rolled back, as with webrtc-rs.
    async fn rollback(&self) -> EngineResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(EngineError::Closed);
        }
        let pending_offer = state.local.as_ref().is_some_and(SessionDescription::is_offer);
        if state.signaling != SignalingState::HaveLocalOffer || !pending_offer {
            return Err(invalid(state.signaling, "rollback"));
        }
        state.signaling = SignalingState::Stable;
        state.local = None;
        state.rollbacks += 1;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> EngineResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(EngineError::Closed);
        }
        if state.remote.is_none() {
            return Err(EngineError::CandidateRejected("no remote description".into()));
        }
        if candidate.candidate.is_empty() || candidate.candidate.starts_with("bad") {
            return Err(EngineError::CandidateRejected(format!(
                "unparseable candidate {:?}",
                candidate.candidate
            )));
        }
        state.applied_candidates.push(candidate);
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
        options: &ChannelOptions,
    ) -> EngineResult<ChannelHandle> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(EngineError::Closed);
        }
        state.channels.push(label.to_string());
        Ok(ChannelHandle::new(
            label,
            ScriptedChannel {
                label: label.to_string(),
                options: options.clone(),
            },
        ))
    }

    async fn add_track(&self, track: &TrackHandle) -> EngineResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(EngineError::Closed);
        }
        state.tracks.push(track.id().to_string());
        Ok(())
    }

    async fn close(&self) -> EngineResult<()> {
        self.state.lock().closed = true;
        Ok(())
    }
}

/// Hands out [`ScriptedEngine`]s and keeps them reachable by call id.
pub struct ScriptedFactory {
    engines: Mutex<HashMap<CallId, Arc<ScriptedEngine>>>,
    created: watch::Sender<usize>,
    offer_delay: Option<Duration>,
    fail_create: AtomicBool,
    fail_offers: AtomicBool,
}

impl ScriptedFactory {
    pub fn new() -> Arc<Self> {
        Self::build(None)
    }

    /// Every engine sleeps this long inside `create_offer`.
    pub fn with_offer_delay(delay: Duration) -> Arc<Self> {
        Self::build(Some(delay))
    }

    fn build(offer_delay: Option<Duration>) -> Arc<Self> {
        let (created, _) = watch::channel(0);
        Arc::new(Self {
            engines: Mutex::new(HashMap::new()),
            created,
            offer_delay,
            fail_create: AtomicBool::new(false),
            fail_offers: AtomicBool::new(false),
        })
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Applies to engines created from now on.
    pub fn set_fail_offers(&self, fail: bool) {
        self.fail_offers.store(fail, Ordering::SeqCst);
    }

    pub fn engine(&self, id: &CallId) -> Option<Arc<ScriptedEngine>> {
        self.engines.lock().get(id).cloned()
    }

    pub async fn wait_engine(&self, id: &CallId) -> Arc<ScriptedEngine> {
        let mut created = self.created.subscribe();
        loop {
            if let Some(engine) = self.engine(id) {
                return engine;
            }
            if created.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    pub fn engine_count(&self) -> usize {
        self.engines.lock().len()
    }
}

#[async_trait]
impl EngineFactory for ScriptedFactory {
    async fn create(
        &self,
        id: &CallId,
        _config: &CallConfig,
        events: EngineEventSender,
    ) -> EngineResult<Arc<dyn PeerEngine>> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(EngineError::Failed("scripted factory failure".into()));
        }
        let engine = ScriptedEngine::with_options(
            id.clone(),
            events,
            self.offer_delay,
            self.fail_offers.load(Ordering::SeqCst),
        );
        self.engines.lock().insert(id.clone(), engine.clone());
        self.created.send_modify(|count| *count += 1);
        Ok(engine)
    }
}

/// Sink that keeps everything sent through it.
pub struct RecordingSink {
    sent: Mutex<Vec<SignalEnvelope>>,
    count: watch::Sender<usize>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        let (count, _) = watch::channel(0);
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            count,
        })
    }

    pub fn envelopes(&self) -> Vec<SignalEnvelope> {
        self.sent.lock().clone()
    }

    pub fn messages(&self) -> Vec<SignalMessage> {
        self.sent
            .lock()
            .iter()
            .filter_map(|envelope| SignalMessage::from_slice(&envelope.payload).ok())
            .collect()
    }

    /// Waits until at least `count` messages were sent and returns them all.
    pub async fn wait_for(&self, count: usize) -> Vec<SignalMessage> {
        let mut sent = self.count.subscribe();
        let _ = sent.wait_for(|sent| *sent >= count).await;
        self.messages()
    }
}

impl SignalSink for RecordingSink {
    fn send(&self, envelope: SignalEnvelope) -> RelayResult<()> {
        self.sent.lock().push(envelope);
        self.count.send_modify(|count| *count += 1);
        Ok(())
    }
}

/// Waits for a snapshot matching `predicate`, or returns the last one if the
/// call goes away first.
pub async fn wait_for_snapshot<F>(
    snapshots: &mut watch::Receiver<SessionSnapshot>,
    predicate: F,
) -> SessionSnapshot
where
    F: FnMut(&SessionSnapshot) -> bool,
{
    let matched = snapshots
        .wait_for(predicate)
        .await
        .map(|snapshot| (*snapshot).clone());
    match matched {
        Ok(snapshot) => snapshot,
        Err(_) => snapshots.borrow().clone(),
    }
}
