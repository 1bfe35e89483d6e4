//! Signaling transport seam.
//!
//! The negotiator never talks to a websocket or HTTP relay directly. It hands
//! serialized signaling messages to a [`SignalSink`] and is fed inbound
//! envelopes by whoever owns the transport. [`LocalRelay`] is an in-process
//! implementation that routes envelopes between attached peer ids.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;

/// One signaling message on its way to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalEnvelope {
    pub from: Option<String>,
    pub to: String,
    pub payload: Bytes,
}

impl SignalEnvelope {
    pub fn new(from: Option<String>, to: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            from,
            to: to.into(),
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("peer {0} is not attached to the relay")]
    UnknownPeer(String),
    #[error("relay channel for {0} closed")]
    Closed(String),
    #[error("relay transport error: {0}")]
    Transport(String),
}

pub type RelayResult<T> = Result<T, RelayError>;

/// Fire-and-forget delivery to a named peer. No acknowledgement is implied by
/// `Ok(())`; it only means the envelope left this process's hands.
pub trait SignalSink: Send + Sync {
    fn send(&self, envelope: SignalEnvelope) -> RelayResult<()>;
}

impl<T: SignalSink + ?Sized> SignalSink for Arc<T> {
    fn send(&self, envelope: SignalEnvelope) -> RelayResult<()> {
        (**self).send(envelope)
    }
}

/// In-memory relay for tests and single-process setups.
#[derive(Debug, Default)]
pub struct LocalRelay {
    peers: RwLock<HashMap<String, mpsc::UnboundedSender<SignalEnvelope>>>,
    offline: RwLock<HashSet<String>>,
}

impl LocalRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `peer_id` and returns its inbound feed. Attaching again
    /// replaces the previous feed.
    pub fn attach(&self, peer_id: &str) -> mpsc::UnboundedReceiver<SignalEnvelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        let previous = self.peers.write().insert(peer_id.to_string(), tx);
        if previous.is_some() {
            tracing::debug!(target = "relay", peer = %peer_id, "replaced relay attachment");
        }
        rx
    }

    pub fn detach(&self, peer_id: &str) {
        if self.peers.write().remove(peer_id).is_some() {
            tracing::debug!(target = "relay", peer = %peer_id, "peer detached");
        }
    }

    pub fn is_attached(&self, peer_id: &str) -> bool {
        self.peers.read().contains_key(peer_id)
    }

    /// While offline, envelopes addressed to `peer_id` are swallowed: the
    /// sender sees success and nothing is delivered.
    pub fn set_offline(&self, peer_id: &str, offline: bool) {
        let mut guard = self.offline.write();
        if offline {
            guard.insert(peer_id.to_string());
        } else {
            guard.remove(peer_id);
        }
    }
}

impl SignalSink for LocalRelay {
    fn send(&self, envelope: SignalEnvelope) -> RelayResult<()> {
        if self.offline.read().contains(&envelope.to) {
            tracing::trace!(target = "relay", to = %envelope.to, "dropping envelope for offline peer");
            return Ok(());
        }
        let sender = self
            .peers
            .read()
            .get(&envelope.to)
            .cloned()
            .ok_or_else(|| RelayError::UnknownPeer(envelope.to.clone()))?;
        let to = envelope.to.clone();
        tracing::trace!(
            target = "relay",
            to = %to,
            len = envelope.payload.len(),
            "relaying envelope"
        );
        sender.send(envelope).map_err(|_| RelayError::Closed(to))
    }
}
