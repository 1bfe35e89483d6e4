//! Seam to the native peer-connection engine.
//!
//! The engine does ICE, DTLS/SRTP and SDP generation; the negotiator only
//! sequences calls into it. Engine callbacks are not invoked on the
//! negotiator's state directly: they are posted as [`EngineEvent`]s to the
//! owning session's queue.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::CallConfig;
use crate::id::CallId;
use crate::protocol::{IceCandidate, SessionDescription};
use crate::session::IceState;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid engine state: {0}")]
    InvalidState(String),
    #[error("candidate rejected: {0}")]
    CandidateRejected(String),
    #[error("engine closed")]
    Closed,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("{0}")]
    Failed(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Callback traffic from one engine instance.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    IceState(IceState),
    /// A locally gathered candidate; `None` marks the end of gathering.
    LocalCandidate(Option<IceCandidate>),
    RemoteTrack(TrackHandle),
    RemoteChannel(ChannelHandle),
    /// Fired for local and remote channels alike once they are usable.
    ChannelOpen(String),
}

pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
    Unknown,
}

/// Opaque handle to an engine-owned object. The concrete native type can be
/// recovered with `native::<T>()` by code that knows which engine is in use.
#[derive(Clone)]
pub struct NativeHandle(Arc<dyn Any + Send + Sync>);

impl NativeHandle {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        NativeHandle(Arc::new(value))
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

#[derive(Clone)]
pub struct ChannelHandle {
    label: String,
    native: NativeHandle,
}

impl ChannelHandle {
    pub fn new<T: Any + Send + Sync>(label: impl Into<String>, native: T) -> Self {
        Self {
            label: label.into(),
            native: NativeHandle::new(native),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn native<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.native.downcast::<T>()
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct TrackHandle {
    id: String,
    kind: TrackKind,
    stream_id: Option<String>,
    native: NativeHandle,
}

impl TrackHandle {
    pub fn new<T: Any + Send + Sync>(
        id: impl Into<String>,
        kind: TrackKind,
        stream_id: Option<String>,
        native: T,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            stream_id,
            native: NativeHandle::new(native),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// The media stream the track was added with, if any.
    pub fn stream_id(&self) -> Option<&str> {
        self.stream_id.as_deref()
    }

    pub fn native<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.native.downcast::<T>()
    }
}

impl fmt::Debug for TrackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stream_id", &self.stream_id)
            .finish_non_exhaustive()
    }
}

/// Options for locally created data channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOptions {
    pub ordered: bool,
    pub max_retransmits: Option<u16>,
    pub max_packet_life_time: Option<u16>,
    pub protocol: Option<String>,
    /// Pre-negotiated stream id; `None` lets the engine announce the channel.
    pub negotiated_id: Option<u16>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            ordered: true,
            max_retransmits: None,
            max_packet_life_time: None,
            protocol: None,
            negotiated_id: None,
        }
    }
}

/// One native peer connection.
#[async_trait]
pub trait PeerEngine: Send + Sync {
    async fn create_offer(&self, ice_restart: bool) -> EngineResult<SessionDescription>;
    async fn create_answer(&self) -> EngineResult<SessionDescription>;
    async fn set_local_description(&self, desc: SessionDescription) -> EngineResult<()>;
    async fn set_remote_description(&self, desc: SessionDescription) -> EngineResult<()>;
    /// Discards a pending local offer, returning the engine to stable.
    async fn rollback(&self) -> EngineResult<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> EngineResult<()>;
    async fn create_data_channel(
        &self,
        label: &str,
        options: &ChannelOptions,
    ) -> EngineResult<ChannelHandle>;
    async fn add_track(&self, track: &TrackHandle) -> EngineResult<()>;
    async fn close(&self) -> EngineResult<()>;
}

/// Builds an engine per session; callbacks for that engine go to `events`.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(
        &self,
        id: &CallId,
        config: &CallConfig,
        events: EngineEventSender,
    ) -> EngineResult<Arc<dyn PeerEngine>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_recover_native_type() {
        let channel = ChannelHandle::new("chat", 42u32);
        assert_eq!(channel.label(), "chat");
        assert_eq!(channel.native::<u32>(), Some(&42));
        assert!(channel.native::<String>().is_none());

        let track = TrackHandle::new("t1", TrackKind::Audio, Some("s1".into()), "raw");
        assert_eq!(track.stream_id(), Some("s1"));
        assert_eq!(track.native::<&str>(), Some(&"raw"));
    }

    #[test]
    fn debug_output_hides_native_object() {
        let channel = ChannelHandle::new("chat", vec![1u8, 2, 3]);
        let rendered = format!("{channel:?}");
        assert!(rendered.contains("chat"));
        assert!(!rendered.contains("[1, 2, 3]"));
    }
}
