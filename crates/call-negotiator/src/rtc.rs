//! [`PeerEngine`] backed by webrtc-rs.

use std::sync::Arc;

use async_trait::async_trait;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::CallConfig;
use crate::engine::{
    ChannelHandle, ChannelOptions, EngineError, EngineEvent, EngineEventSender, EngineFactory,
    EngineResult, PeerEngine, TrackHandle, TrackKind,
};
use crate::id::CallId;
use crate::protocol::{IceCandidate, SdpType, SessionDescription};
use crate::session::IceState;

/// Local media as handed to [`crate::CallManager::add_track`].
pub type LocalTrack = Arc<dyn TrackLocal + Send + Sync>;

/// Wraps a webrtc-rs local track for the negotiator.
pub fn local_track(track: LocalTrack) -> TrackHandle {
    let id = track.id().to_string();
    let stream_id = Some(track.stream_id().to_string());
    let kind = track_kind(track.kind());
    TrackHandle::new(id, kind, stream_id, track)
}

/// The webrtc-rs channel behind a handle produced by this engine.
pub fn data_channel(handle: &ChannelHandle) -> Option<Arc<RTCDataChannel>> {
    handle.native::<Arc<RTCDataChannel>>().cloned()
}

/// The webrtc-rs remote track behind a handle produced by this engine.
pub fn remote_track(handle: &TrackHandle) -> Option<Arc<TrackRemote>> {
    handle.native::<Arc<TrackRemote>>().cloned()
}

fn track_kind(kind: RTPCodecType) -> TrackKind {
    match kind {
        RTPCodecType::Audio => TrackKind::Audio,
        RTPCodecType::Video => TrackKind::Video,
        _ => TrackKind::Unknown,
    }
}

fn ice_state(state: RTCIceConnectionState) -> Option<IceState> {
    match state {
        RTCIceConnectionState::New => Some(IceState::New),
        RTCIceConnectionState::Checking => Some(IceState::Checking),
        RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
            Some(IceState::Connected)
        }
        RTCIceConnectionState::Disconnected => Some(IceState::Disconnected),
        RTCIceConnectionState::Failed => Some(IceState::Failed),
        RTCIceConnectionState::Closed => Some(IceState::Closed),
        _ => None,
    }
}

fn engine_error(err: webrtc::Error) -> EngineError {
    match err {
        webrtc::Error::ErrConnectionClosed => EngineError::Closed,
        webrtc::Error::ErrNoRemoteDescription => EngineError::InvalidState(err.to_string()),
        other => EngineError::Failed(other.to_string()),
    }
}

fn to_native(desc: SessionDescription) -> EngineResult<RTCSessionDescription> {
    let converted = match desc.kind {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SdpType::Rollback => {
            return Err(EngineError::Unsupported(
                "rollback goes through PeerEngine::rollback".into(),
            ))
        }
    };
    converted.map_err(engine_error)
}

fn from_native(desc: RTCSessionDescription) -> EngineResult<SessionDescription> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        other => return Err(EngineError::Unsupported(format!("sdp type {other:?}"))),
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}

/// webrtc-rs parses the SDP of a rollback, so it carries the pending offer.
fn rollback_description(pending: RTCSessionDescription) -> RTCSessionDescription {
    let mut rollback = RTCSessionDescription::default();
    rollback.sdp_type = RTCSdpType::Rollback;
    rollback.sdp = pending.sdp;
    rollback
}

fn candidate_from_native(candidate: &RTCIceCandidate) -> Option<IceCandidate> {
    match candidate.to_json() {
        Ok(init) => Some(IceCandidate {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }),
        Err(err) => {
            tracing::warn!(target = "negotiation", error = %err, "failed to serialize local candidate");
            None
        }
    }
}

/// Builds one webrtc-rs peer connection per call.
pub struct RtcEngineFactory {
    api: API,
}

impl RtcEngineFactory {
    pub fn new() -> EngineResult<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(engine_error)?;
        let registry =
            register_default_interceptors(Registry::new(), &mut media_engine).map_err(engine_error)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

#[async_trait]
impl EngineFactory for RtcEngineFactory {
    async fn create(
        &self,
        id: &CallId,
        config: &CallConfig,
        events: EngineEventSender,
    ) -> EngineResult<Arc<dyn PeerEngine>> {
        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(rtc_config)
                .await
                .map_err(engine_error)?,
        );
        install_handlers(&pc, id, &events);
        tracing::debug!(target = "negotiation", call_id = %id, "peer connection created");
        Ok(Arc::new(RtcEngine { pc, events }))
    }
}

fn install_handlers(pc: &Arc<RTCPeerConnection>, id: &CallId, events: &EngineEventSender) {
    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let event = match candidate {
            Some(candidate) => candidate_from_native(&candidate).map(|c| EngineEvent::LocalCandidate(Some(c))),
            None => Some(EngineEvent::LocalCandidate(None)),
        };
        if let Some(event) = event {
            let _ = tx.send(event);
        }
        Box::pin(async {})
    }));

    let tx = events.clone();
    let call_id = id.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        tracing::trace!(target = "negotiation", call_id = %call_id, state = ?state, "native ice state");
        if let Some(state) = ice_state(state) {
            let _ = tx.send(EngineEvent::IceState(state));
        }
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
        let handle = TrackHandle::new(
            track.id().to_string(),
            track_kind(track.kind()),
            Some(track.stream_id().to_string()),
            track.clone(),
        );
        let _ = tx.send(EngineEvent::RemoteTrack(handle));
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
        let label = channel.label().to_string();
        watch_open(&channel, &tx);
        let _ = tx.send(EngineEvent::RemoteChannel(ChannelHandle::new(label, channel)));
        Box::pin(async {})
    }));
}

fn watch_open(channel: &Arc<RTCDataChannel>, events: &EngineEventSender) {
    let tx = events.clone();
    let label = channel.label().to_string();
    channel.on_open(Box::new(move || {
        let _ = tx.send(EngineEvent::ChannelOpen(label));
        Box::pin(async {})
    }));
}

pub struct RtcEngine {
    pc: Arc<RTCPeerConnection>,
    events: EngineEventSender,
}

impl RtcEngine {
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }
}

#[async_trait]
impl PeerEngine for RtcEngine {
    async fn create_offer(&self, ice_restart: bool) -> EngineResult<SessionDescription> {
        let options = RTCOfferOptions {
            voice_activity_detection: false,
            ice_restart,
        };
        let offer = self.pc.create_offer(Some(options)).await.map_err(engine_error)?;
        from_native(offer)
    }

    async fn create_answer(&self) -> EngineResult<SessionDescription> {
        let answer = self.pc.create_answer(None).await.map_err(engine_error)?;
        from_native(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> EngineResult<()> {
        self.pc
            .set_local_description(to_native(desc)?)
            .await
            .map_err(engine_error)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> EngineResult<()> {
        self.pc
            .set_remote_description(to_native(desc)?)
            .await
            .map_err(engine_error)
    }

    async fn rollback(&self) -> EngineResult<()> {
        let pending = self.pc.pending_local_description().await.ok_or_else(|| {
            EngineError::InvalidState(format!(
                "no local offer to roll back in {}",
                self.pc.signaling_state()
            ))
        })?;
        self.pc
            .set_local_description(rollback_description(pending))
            .await
            .map_err(engine_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> EngineResult<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| match err {
                webrtc::Error::ErrConnectionClosed => EngineError::Closed,
                other => EngineError::CandidateRejected(other.to_string()),
            })
    }

    async fn create_data_channel(
        &self,
        label: &str,
        options: &ChannelOptions,
    ) -> EngineResult<ChannelHandle> {
        let init = RTCDataChannelInit {
            ordered: Some(options.ordered),
            max_packet_life_time: options.max_packet_life_time,
            max_retransmits: options.max_retransmits,
            protocol: options.protocol.clone(),
            negotiated: options.negotiated_id,
            ..Default::default()
        };
        let channel = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(engine_error)?;
        watch_open(&channel, &self.events);
        Ok(ChannelHandle::new(label, channel))
    }

    async fn add_track(&self, track: &TrackHandle) -> EngineResult<()> {
        let local = track.native::<LocalTrack>().cloned().ok_or_else(|| {
            EngineError::Unsupported(format!("track {} is not a webrtc-rs local track", track.id()))
        })?;
        self.pc.add_track(local).await.map_err(engine_error)?;
        Ok(())
    }

    async fn close(&self) -> EngineResult<()> {
        self.pc.close().await.map_err(engine_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::peer_connection::signaling_state::RTCSignalingState;

    #[test]
    fn ice_states_map_completed_to_connected() {
        assert_eq!(ice_state(RTCIceConnectionState::Completed), Some(IceState::Connected));
        assert_eq!(ice_state(RTCIceConnectionState::Failed), Some(IceState::Failed));
        assert_eq!(ice_state(RTCIceConnectionState::Unspecified), None);
    }

    async fn engine(factory: &RtcEngineFactory) -> RtcEngine {
        let (events, _rx) = tokio::sync::mpsc::unbounded_channel();
        let pc = factory
            .api
            .new_peer_connection(RTCConfiguration::default())
            .await
            .expect("peer connection");
        RtcEngine {
            pc: Arc::new(pc),
            events,
        }
    }

    async fn local_offer(engine: &RtcEngine) -> SessionDescription {
        engine
            .create_data_channel("chat", &ChannelOptions::default())
            .await
            .expect("channel");
        let offer = engine.create_offer(false).await.expect("offer");
        engine
            .set_local_description(offer.clone())
            .await
            .expect("local offer");
        offer
    }

    #[tokio::test]
    async fn rollback_drops_the_pending_offer() {
        let factory = RtcEngineFactory::new().expect("api");
        let engine = engine(&factory).await;
        assert!(matches!(engine.rollback().await, Err(EngineError::InvalidState(_))));

        local_offer(&engine).await;
        engine.rollback().await.expect("rollback");
        assert_eq!(engine.pc.signaling_state(), RTCSignalingState::Stable);
        assert!(engine.pc.pending_local_description().await.is_none());
        engine.close().await.expect("close");
    }

    #[tokio::test]
    async fn crossing_offers_settle_after_polite_rollback() {
        let factory = RtcEngineFactory::new().expect("api");
        let impolite = engine(&factory).await;
        let polite = engine(&factory).await;
        let impolite_offer = local_offer(&impolite).await;
        local_offer(&polite).await;

        polite.rollback().await.expect("rollback");
        polite
            .set_remote_description(impolite_offer)
            .await
            .expect("remote offer after rollback");
        let answer = polite.create_answer().await.expect("answer");
        polite
            .set_local_description(answer.clone())
            .await
            .expect("local answer");
        impolite
            .set_remote_description(answer)
            .await
            .expect("remote answer");

        assert_eq!(polite.pc.signaling_state(), RTCSignalingState::Stable);
        assert_eq!(impolite.pc.signaling_state(), RTCSignalingState::Stable);

        let renegotiation = local_offer(&polite).await;
        assert!(renegotiation.is_offer());
        assert_eq!(polite.pc.signaling_state(), RTCSignalingState::HaveLocalOffer);
        impolite.close().await.expect("close");
        polite.close().await.expect("close");
    }

    #[tokio::test]
    async fn offers_from_native_engine_are_parseable() {
        let factory = RtcEngineFactory::new().expect("api");
        let (events, _rx) = tokio::sync::mpsc::unbounded_channel();
        let id = CallId::random();
        let engine = factory
            .create(&id, &CallConfig::localhost("alice"), events)
            .await
            .expect("engine");
        engine
            .create_data_channel("chat", &ChannelOptions::default())
            .await
            .expect("channel");
        let offer = engine.create_offer(false).await.expect("offer");
        assert!(offer.is_offer());
        assert!(offer.sdp.starts_with("v=0"));
        engine.set_local_description(offer).await.expect("local offer");
        engine.close().await.expect("close");
    }
}
