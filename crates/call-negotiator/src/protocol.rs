//! Signaling wire schema.
//!
//! ```text
//! { id, to, from?, type: "call"|"answer", stream?,
//!   call?:   { desc?, candidate? },
//!   answer?: { desc?, candidate? } }
//! ```
//!
//! `type: "call"` always comes from the caller and `type: "answer"` from the
//! callee, whatever the description inside says. Descriptions and candidates
//! use the browser `toJSON()` shapes.

use serde::{Deserialize, Serialize};

use crate::error::{NegotiationError, Result};
use crate::id::CallId;
use crate::session::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    #[serde(default)]
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn is_offer(&self) -> bool {
        self.kind == SdpType::Offer
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[serde(alias = "offer")]
    Call,
    Answer,
}

impl MessageKind {
    /// The message type a peer in `role` sends.
    pub fn for_sender(role: Role) -> Self {
        match role {
            Role::Caller => MessageKind::Call,
            Role::Callee => MessageKind::Answer,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidate>,
}

/// What a single message carries once unwrapped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Description(SessionDescription),
    Candidate(IceCandidate),
}

impl From<Signal> for SignalPayload {
    fn from(signal: Signal) -> Self {
        match signal {
            Signal::Description(desc) => SignalPayload {
                desc: Some(desc),
                candidate: None,
            },
            Signal::Candidate(candidate) => SignalPayload {
                desc: None,
                candidate: Some(candidate),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub id: CallId,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call: Option<SignalPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SignalPayload>,
}

impl SignalMessage {
    pub fn new(
        id: CallId,
        to: impl Into<String>,
        from: Option<String>,
        sender_role: Role,
        signal: Signal,
    ) -> Self {
        let kind = MessageKind::for_sender(sender_role);
        let payload = Some(SignalPayload::from(signal));
        let (call, answer) = match kind {
            MessageKind::Call => (payload, None),
            MessageKind::Answer => (None, payload),
        };
        Self {
            id,
            to: to.into(),
            from,
            kind,
            stream: None,
            call,
            answer,
        }
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = Some(stream);
        self
    }

    /// Unwraps the payload matching `type`, falling back to the other slot
    /// for senders that mislabel it. Exactly one of `desc`/`candidate` must be
    /// present.
    pub fn signal(&self) -> Result<Signal> {
        let (primary, secondary) = match self.kind {
            MessageKind::Call => (self.call.as_ref(), self.answer.as_ref()),
            MessageKind::Answer => (self.answer.as_ref(), self.call.as_ref()),
        };
        let payload = primary
            .or(secondary)
            .ok_or_else(|| NegotiationError::Malformed("message carries no payload".into()))?;
        match (&payload.desc, &payload.candidate) {
            (Some(desc), None) => Ok(Signal::Description(desc.clone())),
            (None, Some(candidate)) => Ok(Signal::Candidate(candidate.clone())),
            (Some(_), Some(_)) => Err(NegotiationError::Malformed(
                "payload carries both desc and candidate".into(),
            )),
            (None, None) => Err(NegotiationError::Malformed("payload is empty".into())),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
