//! Offer/answer/candidate sequencing for one call.
//!
//! Every method here runs on the call's worker with exclusive access to its
//! [`PeerSession`], so steps for one call never interleave. Collisions are
//! resolved the perfect-negotiation way: the impolite peer (the caller)
//! ignores a colliding offer, the polite peer (the callee) rolls back its own
//! and answers.

use std::sync::Arc;

use tokio::time::Instant;

use crate::config::CallConfig;
use crate::engine::{ChannelHandle, ChannelOptions, EngineEvent, TrackHandle};
use crate::error::{NegotiationError, Result};
use crate::events::{CallEvent, EventBus};
use crate::gateway::Outbound;
use crate::protocol::{IceCandidate, SdpType, SessionDescription, Signal};
use crate::session::{IceState, OfferKind, PeerSession, SignalingState};
use crate::worker::CloseReason;

/// What an outbound call carries into its first offer.
#[derive(Debug, Clone, Default)]
pub struct DialOptions {
    /// Announce media on the call even before any track is attached.
    pub stream: bool,
    pub channels: Vec<(String, ChannelOptions)>,
    pub tracks: Vec<TrackHandle>,
}

impl DialOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn channel(self, label: impl Into<String>) -> Self {
        self.channel_with(label, ChannelOptions::default())
    }

    pub fn channel_with(mut self, label: impl Into<String>, options: ChannelOptions) -> Self {
        self.channels.push((label.into(), options));
        self
    }

    pub fn track(mut self, track: TrackHandle) -> Self {
        self.tracks.push(track);
        self
    }
}

/// Outcome of one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Close(CloseReason),
}

pub(crate) struct NegotiationEngine {
    config: Arc<CallConfig>,
    events: Arc<EventBus>,
    outbound: Outbound,
}

impl NegotiationEngine {
    pub(crate) fn new(config: Arc<CallConfig>, events: Arc<EventBus>, outbound: Outbound) -> Self {
        Self {
            config,
            events,
            outbound,
        }
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.events
    }

    pub(crate) async fn dial(&self, s: &mut PeerSession, options: DialOptions) -> Result<()> {
        for (label, channel_options) in &options.channels {
            self.create_channel(s, label, channel_options).await?;
        }
        for track in options.tracks {
            self.add_track(s, track).await?;
        }
        self.start_offer(s, OfferKind::Initial).await
    }

    /// Creates and sends a local offer, or defers it until the current
    /// exchange settles.
    pub(crate) async fn start_offer(&self, s: &mut PeerSession, kind: OfferKind) -> Result<()> {
        if s.signaling() != SignalingState::Stable || s.making_offer {
            tracing::debug!(
                target = "negotiation",
                call_id = %s.id,
                kind = ?kind,
                state = ?s.signaling(),
                "offer deferred until stable"
            );
            defer_offer(s, kind);
            return Ok(());
        }

        s.making_offer = true;
        let created = self.create_local_offer(s, kind == OfferKind::Restart).await;
        s.making_offer = false;
        let offer = created?;

        s.transition(SignalingState::HaveLocalOffer);
        s.last_offer = Some(kind);
        tracing::debug!(target = "negotiation", call_id = %s.id, kind = ?kind, "sending offer");
        self.outbound.send(s, Signal::Description(offer));
        if kind == OfferKind::Initial {
            s.answer_deadline = self.config.answer_timeout.map(|timeout| Instant::now() + timeout);
        }
        self.flush_candidates(s);
        Ok(())
    }

    async fn create_local_offer(
        &self,
        s: &mut PeerSession,
        ice_restart: bool,
    ) -> Result<SessionDescription> {
        let state = s.signaling();
        let offer = s
            .engine
            .create_offer(ice_restart)
            .await
            .map_err(|err| NegotiationError::from_engine("create offer", state, err))?;
        s.engine
            .set_local_description(offer.clone())
            .await
            .map_err(|err| NegotiationError::from_engine("set local offer", state, err))?;
        Ok(offer)
    }

    pub(crate) async fn handle_signal(&self, s: &mut PeerSession, signal: Signal) -> Result<()> {
        match signal {
            Signal::Description(desc) => self.handle_description(s, desc).await,
            Signal::Candidate(candidate) => self.handle_candidate(s, candidate).await,
        }
    }

    async fn handle_description(&self, s: &mut PeerSession, desc: SessionDescription) -> Result<()> {
        match desc.kind {
            SdpType::Offer => self.handle_offer(s, desc).await,
            SdpType::Answer | SdpType::Pranswer => self.handle_answer(s, desc).await,
            SdpType::Rollback => Err(NegotiationError::Malformed(
                "rollback is not a signaling message".into(),
            )),
        }
    }

    async fn handle_offer(&self, s: &mut PeerSession, offer: SessionDescription) -> Result<()> {
        let collision = s.making_offer || s.signaling() != SignalingState::Stable;
        s.ignore_offer = !s.polite && collision;
        if s.ignore_offer {
            tracing::debug!(
                target = "negotiation",
                call_id = %s.id,
                state = ?s.signaling(),
                "ignoring colliding remote offer"
            );
            return Ok(());
        }

        if collision {
            let state = s.signaling();
            tracing::debug!(
                target = "negotiation",
                call_id = %s.id,
                state = ?state,
                "rolling back local offer for remote offer"
            );
            s.engine
                .rollback()
                .await
                .map_err(|err| NegotiationError::from_engine("rollback", state, err))?;
            s.transition(SignalingState::Stable);
            s.answer_deadline = None;
            if let Some(kind) = s.last_offer {
                defer_offer(s, kind);
            }
        }

        let state = s.signaling();
        s.engine
            .set_remote_description(offer)
            .await
            .map_err(|err| NegotiationError::from_engine("apply remote offer", state, err))?;
        s.remote_description_set = true;
        s.transition(SignalingState::HaveRemoteOffer);
        self.drain_pending_candidates(s).await;

        let state = s.signaling();
        let answer = s
            .engine
            .create_answer()
            .await
            .map_err(|err| NegotiationError::from_engine("create answer", state, err))?;
        s.engine
            .set_local_description(answer.clone())
            .await
            .map_err(|err| NegotiationError::from_engine("set local answer", state, err))?;
        s.transition(SignalingState::Stable);
        tracing::debug!(target = "negotiation", call_id = %s.id, "sending answer");
        self.outbound.send(s, Signal::Description(answer));
        self.flush_candidates(s);
        self.resume_deferred_offer(s).await
    }

    async fn handle_answer(&self, s: &mut PeerSession, answer: SessionDescription) -> Result<()> {
        let state = s.signaling();
        if state != SignalingState::HaveLocalOffer {
            return Err(NegotiationError::InvalidState {
                action: "apply remote answer",
                state,
            });
        }
        let provisional = answer.kind == SdpType::Pranswer;
        s.engine
            .set_remote_description(answer)
            .await
            .map_err(|err| NegotiationError::from_engine("apply remote answer", state, err))?;
        s.remote_description_set = true;
        self.drain_pending_candidates(s).await;
        if provisional {
            return Ok(());
        }
        s.transition(SignalingState::Stable);
        s.answer_deadline = None;
        s.ignore_offer = false;
        self.resume_deferred_offer(s).await
    }

    async fn resume_deferred_offer(&self, s: &mut PeerSession) -> Result<()> {
        match s.deferred_offer.take() {
            Some(kind) => self.start_offer(s, kind).await,
            None => Ok(()),
        }
    }

    async fn handle_candidate(&self, s: &mut PeerSession, candidate: IceCandidate) -> Result<()> {
        if !s.remote_description_set {
            tracing::debug!(
                target = "negotiation",
                call_id = %s.id,
                queued = s.pending_candidates.len() + 1,
                "queueing remote candidate until remote description"
            );
            s.pending_candidates.push(candidate);
            return Ok(());
        }
        match s.engine.add_ice_candidate(candidate).await {
            Ok(()) => Ok(()),
            // Candidates for an offer we chose to ignore are expected to fail.
            Err(err) if s.ignore_offer => {
                tracing::debug!(
                    target = "negotiation",
                    call_id = %s.id,
                    error = %err,
                    "dropping candidate for ignored offer"
                );
                Ok(())
            }
            Err(err) => Err(NegotiationError::from_engine(
                "add remote candidate",
                s.signaling(),
                err,
            )),
        }
    }

    async fn drain_pending_candidates(&self, s: &mut PeerSession) {
        let queued = std::mem::take(&mut s.pending_candidates);
        if queued.is_empty() {
            return;
        }
        tracing::debug!(
            target = "negotiation",
            call_id = %s.id,
            count = queued.len(),
            "applying queued remote candidates"
        );
        for candidate in queued {
            if let Err(err) = s.engine.add_ice_candidate(candidate).await {
                tracing::warn!(
                    target = "negotiation",
                    call_id = %s.id,
                    error = %err,
                    "queued candidate rejected"
                );
            }
        }
    }

    fn on_local_candidate(&self, s: &mut PeerSession, candidate: Option<IceCandidate>) {
        let Some(candidate) = candidate else {
            tracing::debug!(target = "negotiation", call_id = %s.id, "local gathering complete");
            self.flush_candidates(s);
            return;
        };
        match self.config.candidate_batch_window {
            None => self.outbound.send(s, Signal::Candidate(candidate)),
            Some(window) => {
                s.outbox.push(candidate);
                if s.batch_deadline.is_none() {
                    s.batch_deadline = Some(Instant::now() + window);
                }
            }
        }
    }

    pub(crate) fn flush_candidates(&self, s: &mut PeerSession) {
        s.batch_deadline = None;
        for candidate in std::mem::take(&mut s.outbox) {
            self.outbound.send(s, Signal::Candidate(candidate));
        }
    }

    pub(crate) async fn on_engine_event(&self, s: &mut PeerSession, event: EngineEvent) -> Result<Flow> {
        match event {
            EngineEvent::IceState(state) => return self.on_ice_state(s, state).await,
            EngineEvent::LocalCandidate(candidate) => self.on_local_candidate(s, candidate),
            EngineEvent::RemoteTrack(track) => {
                tracing::debug!(
                    target = "negotiation",
                    call_id = %s.id,
                    track = %track.id(),
                    kind = ?track.kind(),
                    "remote track added"
                );
                s.remote_tracks.push(track.clone());
                self.events.emit(&s.id, CallEvent::TrackAdded { track });
            }
            EngineEvent::RemoteChannel(channel) => {
                tracing::debug!(
                    target = "negotiation",
                    call_id = %s.id,
                    label = %channel.label(),
                    "remote data channel registered"
                );
                s.data_channels.insert(channel.label().to_string(), channel);
            }
            EngineEvent::ChannelOpen(label) => {
                if !s.data_channels.contains_key(&label) {
                    tracing::debug!(
                        target = "negotiation",
                        call_id = %s.id,
                        label = %label,
                        "open event for unregistered channel"
                    );
                } else if s.open_channels.insert(label.clone()) {
                    tracing::info!(target = "negotiation", call_id = %s.id, label = %label, "data channel open");
                    self.events.emit(&s.id, CallEvent::ChannelOpen { label });
                }
            }
        }
        Ok(Flow::Continue)
    }

    async fn on_ice_state(&self, s: &mut PeerSession, state: IceState) -> Result<Flow> {
        if s.ice == state && state != IceState::Failed {
            return Ok(Flow::Continue);
        }
        tracing::info!(
            target = "negotiation",
            call_id = %s.id,
            from = ?s.ice,
            to = ?state,
            "ice state change"
        );
        s.ice = state;
        match state {
            IceState::New | IceState::Checking => {}
            IceState::Connected => {
                s.ice_restarts = 0;
                s.disconnect_reported = false;
                self.events.emit(&s.id, CallEvent::Connected);
            }
            IceState::Disconnected => {
                if !s.disconnect_reported {
                    s.disconnect_reported = true;
                    self.events.emit(&s.id, CallEvent::Disconnected);
                }
            }
            IceState::Failed => {
                if s.ice_restarts >= self.config.max_ice_restarts {
                    return Ok(Flow::Close(CloseReason::IceFailed {
                        restarts: s.ice_restarts,
                    }));
                }
                s.ice_restarts += 1;
                tracing::info!(
                    target = "negotiation",
                    call_id = %s.id,
                    attempt = s.ice_restarts,
                    "restarting ice"
                );
                self.start_offer(s, OfferKind::Restart).await?;
            }
            IceState::Closed => return Ok(Flow::Close(CloseReason::EngineClosed)),
        }
        Ok(Flow::Continue)
    }

    pub(crate) async fn create_channel(
        &self,
        s: &mut PeerSession,
        label: &str,
        options: &ChannelOptions,
    ) -> Result<ChannelHandle> {
        if let Some(existing) = s.data_channels.get(label) {
            tracing::debug!(target = "negotiation", call_id = %s.id, label = %label, "channel already registered");
            return Ok(existing.clone());
        }
        let first_channel = s.data_channels.is_empty();
        let channel = s
            .engine
            .create_data_channel(label, options)
            .await
            .map_err(|err| NegotiationError::from_engine("create data channel", s.signaling(), err))?;
        s.data_channels.insert(label.to_string(), channel.clone());
        tracing::debug!(target = "negotiation", call_id = %s.id, label = %label, "local data channel created");
        // Later channels ride on the already negotiated SCTP association.
        if first_channel {
            self.renegotiate_if_live(s).await?;
        }
        Ok(channel)
    }

    pub(crate) async fn add_track(&self, s: &mut PeerSession, track: TrackHandle) -> Result<()> {
        s.engine
            .add_track(&track)
            .await
            .map_err(|err| NegotiationError::from_engine("add track", s.signaling(), err))?;
        s.local_tracks.push(track.clone());
        s.stream = true;
        self.events.emit(&s.id, CallEvent::LocalTrackAdded { track });
        self.renegotiate_if_live(s).await
    }

    /// Offers again when the call has already been negotiated; before the
    /// first offer there is nothing to do.
    async fn renegotiate_if_live(&self, s: &mut PeerSession) -> Result<()> {
        if s.last_offer.is_none() && !s.remote_description_set {
            return Ok(());
        }
        self.start_offer(s, OfferKind::Renegotiation).await
    }

    pub(crate) async fn renegotiate(&self, s: &mut PeerSession) -> Result<()> {
        let kind = if s.last_offer.is_none() && !s.remote_description_set {
            OfferKind::Initial
        } else {
            OfferKind::Renegotiation
        };
        self.start_offer(s, kind).await
    }
}

/// A pending ICE restart outranks any other deferred offer.
fn defer_offer(s: &mut PeerSession, kind: OfferKind) {
    s.deferred_offer = Some(match s.deferred_offer {
        Some(OfferKind::Restart) => OfferKind::Restart,
        _ => kind,
    });
}
