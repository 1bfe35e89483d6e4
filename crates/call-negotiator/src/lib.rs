//! Call signaling for peer-to-peer connections.
//!
//! A [`CallManager`] drives the offer/answer/candidate exchange for any number
//! of concurrent calls, resolves offer collisions between polite and
//! impolite peers, restarts ICE on failure and reports lifecycle events. The
//! native peer connection sits behind [`PeerEngine`]; the signaling transport
//! sits behind [`signal_relay::SignalSink`] on the way out and
//! [`SignalingGateway`] on the way in.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod gateway;
pub mod id;
pub mod manager;
pub mod negotiation;
pub mod protocol;
mod registry;
pub mod session;
mod worker;

#[cfg(feature = "webrtc-engine")]
pub mod rtc;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use config::{CallConfig, CallConfigBuilder, ConfigError, IceServer};
pub use engine::{
    ChannelHandle, ChannelOptions, EngineError, EngineEvent, EngineFactory, PeerEngine,
    TrackHandle, TrackKind,
};
pub use error::{NegotiationError, Result};
pub use events::{CallEvent, EventBus};
pub use gateway::{Delivery, SignalingGateway};
pub use id::{BlankCallId, CallId};
pub use manager::CallManager;
pub use negotiation::DialOptions;
pub use protocol::{IceCandidate, MessageKind, SdpType, SessionDescription, Signal, SignalMessage};
pub use session::{IceState, Role, SessionSnapshot, SignalingState};
