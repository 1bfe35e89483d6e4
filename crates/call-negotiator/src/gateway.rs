//! Boundary with the signaling transport.
//!
//! Inbound: decode messages and route them to the owning call's worker,
//! creating a callee session for a new incoming call. Outbound: encode
//! negotiation output and hand it to the [`SignalSink`].

use std::collections::HashMap;
use std::sync::Arc;

use signal_relay::{SignalEnvelope, SignalSink};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{NegotiationError, Result};
use crate::events::CallEvent;
use crate::id::CallId;
use crate::manager::Shared;
use crate::protocol::{IceCandidate, MessageKind, SessionDescription, Signal, SignalMessage};
use crate::session::{PeerSession, Role};
use crate::worker::{CloseReason, SessionCommand};

/// Encodes and sends messages for every call of one local peer.
pub(crate) struct Outbound {
    local_peer: String,
    sink: Arc<dyn SignalSink>,
}

impl Outbound {
    pub(crate) fn new(local_peer: String, sink: Arc<dyn SignalSink>) -> Self {
        Self { local_peer, sink }
    }

    /// Fire and forget. A failed send is logged and the message is lost; the
    /// call stays where it is.
    pub(crate) fn send(&self, s: &PeerSession, signal: Signal) {
        let is_description = matches!(signal, Signal::Description(_));
        let mut message = SignalMessage::new(
            s.id.clone(),
            s.remote_peer.clone(),
            Some(self.local_peer.clone()),
            s.role,
            signal,
        );
        if is_description && s.role == Role::Caller {
            message = message.with_stream(s.stream);
        }
        let payload = match message.to_json() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(target = "signaling", call_id = %s.id, error = %err, "failed to encode message");
                return;
            }
        };
        tracing::trace!(
            target = "signaling",
            call_id = %s.id,
            peer = %s.remote_peer,
            kind = ?message.kind,
            description = is_description,
            "sending signal"
        );
        let envelope = SignalEnvelope::new(
            Some(self.local_peer.clone()),
            s.remote_peer.clone(),
            payload,
        );
        if let Err(err) = self.sink.send(envelope) {
            tracing::warn!(
                target = "signaling",
                call_id = %s.id,
                peer = %s.remote_peer,
                error = %err,
                "signal not delivered"
            );
        }
    }
}

/// Where an inbound message went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued on a live call.
    Forwarded,
    /// Started a new incoming call.
    Accepted,
    /// Candidate held until its call shows up.
    Buffered,
    /// Dropped: closed call, stale answer, crossing call we win, or not ours.
    Ignored,
}

/// Candidates that arrived ahead of the offer creating their call.
pub(crate) struct OrphanCandidates {
    limit: usize,
    ttl: std::time::Duration,
    entries: HashMap<CallId, (Instant, Vec<IceCandidate>)>,
    total: usize,
}

impl OrphanCandidates {
    pub(crate) fn new(limit: usize, ttl: std::time::Duration) -> Self {
        Self {
            limit,
            ttl,
            entries: HashMap::new(),
            total: 0,
        }
    }

    fn push(&mut self, id: CallId, candidate: IceCandidate) -> bool {
        self.expire();
        if self.total >= self.limit {
            return false;
        }
        self.entries
            .entry(id)
            .or_insert_with(|| (Instant::now(), Vec::new()))
            .1
            .push(candidate);
        self.total += 1;
        true
    }

    fn take(&mut self, id: &CallId) -> Vec<IceCandidate> {
        self.expire();
        match self.entries.remove(id) {
            Some((_, candidates)) => {
                self.total -= candidates.len();
                candidates
            }
            None => Vec::new(),
        }
    }

    fn expire(&mut self) {
        let now = Instant::now();
        let ttl = self.ttl;
        let total = &mut self.total;
        self.entries.retain(|_, (first_seen, candidates)| {
            let keep = now.duration_since(*first_seen) < ttl;
            if !keep {
                *total -= candidates.len();
            }
            keep
        });
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.total
    }
}

/// Feeds inbound signaling into the negotiator.
#[derive(Clone)]
pub struct SignalingGateway {
    shared: Arc<Shared>,
}

impl SignalingGateway {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub fn handle_bytes(&self, bytes: &[u8]) -> Result<Delivery> {
        self.handle_message(SignalMessage::from_slice(bytes)?)
    }

    pub fn handle_text(&self, text: &str) -> Result<Delivery> {
        self.handle_message(SignalMessage::from_json(text)?)
    }

    /// Routes one message. Only malformed input is an error; everything else
    /// the negotiator cannot use is dropped and logged.
    pub fn handle_message(&self, message: SignalMessage) -> Result<Delivery> {
        let local_peer = &self.shared.config().local_peer_id;
        if &message.to != local_peer {
            tracing::debug!(
                target = "signaling",
                call_id = %message.id,
                to = %message.to,
                "message addressed to another peer"
            );
            return Ok(Delivery::Ignored);
        }
        let signal = message.signal()?;
        let registry = self.shared.registry();

        if let Ok(handle) = registry.get(&message.id) {
            tracing::trace!(target = "signaling", call_id = %message.id, "forwarding to live call");
            return match handle.send(SessionCommand::Signal(signal)) {
                Ok(()) => Ok(Delivery::Forwarded),
                // Worker finished between lookup and send.
                Err(_) => Ok(Delivery::Ignored),
            };
        }
        if registry.is_closed(&message.id) {
            tracing::debug!(target = "signaling", call_id = %message.id, "dropping message for closed call");
            return Ok(Delivery::Ignored);
        }

        match signal {
            Signal::Candidate(candidate) => {
                let buffered = self.shared.orphans().push(message.id.clone(), candidate);
                if buffered {
                    tracing::debug!(target = "signaling", call_id = %message.id, "buffering candidate for unknown call");
                    Ok(Delivery::Buffered)
                } else {
                    tracing::warn!(target = "signaling", call_id = %message.id, "orphan candidate buffer full");
                    Ok(Delivery::Ignored)
                }
            }
            Signal::Description(desc) if desc.is_offer() && message.kind == MessageKind::Call => {
                self.accept_call(&message, desc)
            }
            Signal::Description(desc) => {
                tracing::debug!(
                    target = "signaling",
                    call_id = %message.id,
                    sdp_type = ?desc.kind,
                    "dropping description for unknown call"
                );
                Ok(Delivery::Ignored)
            }
        }
    }

    fn accept_call(&self, message: &SignalMessage, offer: SessionDescription) -> Result<Delivery> {
        let from = message
            .from
            .clone()
            .ok_or_else(|| NegotiationError::Malformed("incoming call has no sender".into()))?;
        let local_peer = self.shared.config().local_peer_id.as_str();
        let registry = self.shared.registry();

        // Both peers dialed each other under different ids. The greater peer
        // id keeps its own call; the other side drops its pending call and
        // answers.
        let pending = registry.pending_outbound(&from);
        if !pending.is_empty() {
            if local_peer > from.as_str() {
                tracing::debug!(
                    target = "signaling",
                    call_id = %message.id,
                    peer = %from,
                    "ignoring crossing call; our pending call wins"
                );
                registry.forget(message.id.clone());
                self.shared.orphans().take(&message.id);
                return Ok(Delivery::Ignored);
            }
            for handle in pending {
                tracing::debug!(
                    target = "signaling",
                    call_id = %handle.id,
                    peer = %from,
                    "abandoning pending call for crossing incoming call"
                );
                handle.cancel(CloseReason::Superseded);
            }
        }

        let stream = message.stream.unwrap_or(false);
        let handle = self
            .shared
            .spawn_session(message.id.clone(), &from, Role::Callee, stream)?;
        handle.send(SessionCommand::Signal(Signal::Description(offer)))?;
        let orphans = self.shared.orphans().take(&message.id);
        if !orphans.is_empty() {
            tracing::debug!(
                target = "signaling",
                call_id = %message.id,
                count = orphans.len(),
                "replaying buffered candidates"
            );
        }
        for candidate in orphans {
            handle.send(SessionCommand::Signal(Signal::Candidate(candidate)))?;
        }
        tracing::info!(target = "signaling", call_id = %message.id, peer = %from, "incoming call");
        self.shared
            .events()
            .emit(&message.id, CallEvent::IncomingCall { from, stream });
        Ok(Delivery::Accepted)
    }

    /// Drains an inbound feed until it closes.
    pub fn spawn_pump(&self, mut inbound: mpsc::UnboundedReceiver<SignalEnvelope>) -> JoinHandle<()> {
        let gateway = self.clone();
        tokio::spawn(async move {
            while let Some(envelope) = inbound.recv().await {
                if let Err(err) = gateway.handle_bytes(&envelope.payload) {
                    tracing::warn!(
                        target = "signaling",
                        from = ?envelope.from,
                        error = %err,
                        "rejected inbound message"
                    );
                }
            }
            tracing::debug!(target = "signaling", "inbound feed closed");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn orphans_expire_after_ttl() {
        let mut orphans = OrphanCandidates::new(8, Duration::from_secs(30));
        let id = CallId::random();
        assert!(orphans.push(id.clone(), IceCandidate::new("candidate:1")));
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(orphans.take(&id).is_empty());
        assert_eq!(orphans.len(), 0);
    }

    #[test]
    fn orphan_buffer_is_bounded() {
        let mut orphans = OrphanCandidates::new(2, Duration::from_secs(30));
        let id = CallId::random();
        assert!(orphans.push(id.clone(), IceCandidate::new("candidate:1")));
        assert!(orphans.push(CallId::random(), IceCandidate::new("candidate:2")));
        assert!(!orphans.push(id.clone(), IceCandidate::new("candidate:3")));
        assert_eq!(orphans.take(&id).len(), 1);
        assert_eq!(orphans.len(), 1);
    }
}
