use thiserror::Error;

use crate::engine::EngineError;
use crate::id::CallId;
use crate::session::SignalingState;

pub type Result<T> = std::result::Result<T, NegotiationError>;

/// Failures surfaced by the negotiator. Everything here is contained to the
/// session it names; none of these tear down the registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    #[error("call {0} already exists")]
    DuplicateId(CallId),
    #[error("call {0} is not live")]
    UnknownSession(CallId),
    #[error("cannot apply {action} in signaling state {state:?}")]
    InvalidState {
        action: &'static str,
        state: SignalingState,
    },
    #[error("ice candidate rejected: {0}")]
    CandidateRejected(String),
    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),
    #[error("ice failed after {restarts} restart attempt(s)")]
    IceFailed { restarts: u32 },
    #[error("no answer received within {0:?}")]
    AnswerTimeout(std::time::Duration),
    #[error("session closed")]
    Closed,
    #[error("malformed signaling message: {0}")]
    Malformed(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl NegotiationError {
    /// Protocol hiccups that are retried or ignored internally stay in the
    /// logs; only these reach the application's error handler.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            NegotiationError::NegotiationFailed(_)
                | NegotiationError::IceFailed { .. }
                | NegotiationError::AnswerTimeout(_)
        )
    }

    pub(crate) fn from_engine(action: &'static str, state: SignalingState, err: EngineError) -> Self {
        match err {
            EngineError::InvalidState(_) => NegotiationError::InvalidState { action, state },
            EngineError::CandidateRejected(reason) => NegotiationError::CandidateRejected(reason),
            EngineError::Closed => NegotiationError::Closed,
            other => NegotiationError::NegotiationFailed(format!("{action}: {other}")),
        }
    }
}

impl From<serde_json::Error> for NegotiationError {
    fn from(err: serde_json::Error) -> Self {
        NegotiationError::Malformed(err.to_string())
    }
}
