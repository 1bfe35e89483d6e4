use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::time::Instant;

use crate::engine::{ChannelHandle, PeerEngine, TrackHandle};
use crate::id::CallId;
use crate::protocol::IceCandidate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Caller,
    Callee,
}

impl Role {
    /// The callee yields when both ends offer on the same call.
    pub fn is_polite(self) -> bool {
        matches!(self, Role::Callee)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IceState {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Why a local offer cycle was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OfferKind {
    Initial,
    Restart,
    Renegotiation,
}

/// State of one call. Owned by that call's worker task; nothing else mutates
/// it.
pub(crate) struct PeerSession {
    pub(crate) id: CallId,
    pub(crate) remote_peer: String,
    pub(crate) role: Role,
    pub(crate) polite: bool,
    pub(crate) stream: bool,
    signaling: SignalingState,
    pub(crate) ice: IceState,
    pub(crate) making_offer: bool,
    pub(crate) ignore_offer: bool,
    pub(crate) remote_description_set: bool,
    /// Remote candidates waiting for a remote description.
    pub(crate) pending_candidates: Vec<IceCandidate>,
    /// Local candidates waiting for the batch window to close.
    pub(crate) outbox: Vec<IceCandidate>,
    pub(crate) batch_deadline: Option<Instant>,
    pub(crate) answer_deadline: Option<Instant>,
    pub(crate) data_channels: BTreeMap<String, ChannelHandle>,
    pub(crate) open_channels: BTreeSet<String>,
    pub(crate) local_tracks: Vec<TrackHandle>,
    pub(crate) remote_tracks: Vec<TrackHandle>,
    pub(crate) ice_restarts: u32,
    pub(crate) last_offer: Option<OfferKind>,
    pub(crate) deferred_offer: Option<OfferKind>,
    pub(crate) disconnect_reported: bool,
    pub(crate) engine: Arc<dyn PeerEngine>,
}

impl PeerSession {
    pub(crate) fn new(
        id: CallId,
        remote_peer: String,
        role: Role,
        stream: bool,
        engine: Arc<dyn PeerEngine>,
    ) -> Self {
        Self {
            id,
            remote_peer,
            role,
            polite: role.is_polite(),
            stream,
            signaling: SignalingState::Stable,
            ice: IceState::New,
            making_offer: false,
            ignore_offer: false,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            outbox: Vec::new(),
            batch_deadline: None,
            answer_deadline: None,
            data_channels: BTreeMap::new(),
            open_channels: BTreeSet::new(),
            local_tracks: Vec::new(),
            remote_tracks: Vec::new(),
            ice_restarts: 0,
            last_offer: None,
            deferred_offer: None,
            disconnect_reported: false,
            engine,
        }
    }

    pub(crate) fn signaling(&self) -> SignalingState {
        self.signaling
    }

    /// Only the offer/answer steps in `negotiation` call this.
    pub(crate) fn transition(&mut self, next: SignalingState) {
        if self.signaling != next {
            tracing::debug!(
                target = "negotiation",
                call_id = %self.id,
                from = ?self.signaling,
                to = ?next,
                "signaling state change"
            );
            self.signaling = next;
        }
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            remote_peer: self.remote_peer.clone(),
            role: self.role,
            polite: self.polite,
            signaling: self.signaling,
            ice: self.ice,
            remote_description_set: self.remote_description_set,
            channels: self.data_channels.keys().cloned().collect(),
            open_channels: self.open_channels.iter().cloned().collect(),
            local_tracks: self.local_tracks.len(),
            remote_tracks: self.remote_tracks.len(),
            pending_candidates: self.pending_candidates.len(),
            ice_restarts: self.ice_restarts,
            closed: false,
        }
    }
}

/// Point-in-time view of a call, published after every step its worker
/// takes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub id: CallId,
    pub remote_peer: String,
    pub role: Role,
    pub polite: bool,
    pub signaling: SignalingState,
    pub ice: IceState,
    pub remote_description_set: bool,
    /// Registered channel labels, sorted.
    pub channels: Vec<String>,
    pub open_channels: Vec<String>,
    pub local_tracks: usize,
    pub remote_tracks: usize,
    pub pending_candidates: usize,
    pub ice_restarts: u32,
    /// Set on the final snapshot of a torn-down call.
    pub closed: bool,
}

impl SessionSnapshot {
    pub(crate) fn initial(id: CallId, remote_peer: String, role: Role) -> Self {
        Self {
            id,
            remote_peer,
            role,
            polite: role.is_polite(),
            signaling: SignalingState::Stable,
            ice: IceState::New,
            remote_description_set: false,
            channels: Vec::new(),
            open_channels: Vec::new(),
            local_tracks: 0,
            remote_tracks: 0,
            pending_candidates: 0,
            ice_restarts: 0,
            closed: false,
        }
    }

    pub fn is_stable(&self) -> bool {
        self.signaling == SignalingState::Stable && self.remote_description_set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedEngine;

    #[test]
    fn callee_is_polite() {
        assert!(Role::Callee.is_polite());
        assert!(!Role::Caller.is_polite());
    }

    #[test]
    fn snapshot_reflects_session() {
        let id = CallId::random();
        let engine = ScriptedEngine::detached(id.clone());
        let mut session = PeerSession::new(id.clone(), "bob".into(), Role::Caller, false, engine);
        session.transition(SignalingState::HaveLocalOffer);
        session
            .data_channels
            .insert("chat".into(), ChannelHandle::new("chat", ()));
        session.pending_candidates.push(IceCandidate::new("candidate:1"));

        let snapshot = session.snapshot();
        assert_eq!(snapshot.id, id);
        assert!(!snapshot.polite);
        assert_eq!(snapshot.signaling, SignalingState::HaveLocalOffer);
        assert_eq!(snapshot.channels, vec!["chat".to_string()]);
        assert_eq!(snapshot.pending_candidates, 1);
        assert!(!snapshot.is_stable());
    }

    #[test]
    fn initial_snapshot_is_fresh() {
        let snapshot = SessionSnapshot::initial(CallId::random(), "alice".into(), Role::Callee);
        assert!(snapshot.polite);
        assert_eq!(snapshot.ice, IceState::New);
        assert!(!snapshot.closed);
    }
}
