//! One task per call.
//!
//! The worker owns the call's [`PeerSession`] and is the only place it is
//! mutated. Commands from the application, inbound signals and engine
//! callbacks all arrive on queues and are applied one at a time. Each step is
//! raced against the cancellation signal so a close discards whatever the
//! step would have produced.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::config::CallConfig;
use crate::engine::{ChannelHandle, ChannelOptions, EngineEvent, EngineFactory, TrackHandle};
use crate::error::{NegotiationError, Result};
use crate::events::{CallEvent, EventBus};
use crate::negotiation::{DialOptions, Flow, NegotiationEngine};
use crate::protocol::Signal;
use crate::registry::{SessionHandle, SessionRegistry, SessionSeed};
use crate::id::CallId;
use crate::session::{PeerSession, SessionSnapshot, SignalingState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CloseReason {
    Local,
    Remote,
    /// Abandoned in favour of the remote peer's crossing call.
    Superseded,
    Shutdown,
    IceFailed { restarts: u32 },
    EngineClosed,
    AnswerTimeout(Duration),
    EngineUnavailable(String),
}

impl CloseReason {
    fn emits_disconnected(&self) -> bool {
        !matches!(self, CloseReason::Superseded)
    }

    fn error(&self) -> Option<NegotiationError> {
        match self {
            CloseReason::IceFailed { restarts } => Some(NegotiationError::IceFailed {
                restarts: *restarts,
            }),
            CloseReason::AnswerTimeout(timeout) => Some(NegotiationError::AnswerTimeout(*timeout)),
            CloseReason::EngineUnavailable(reason) => {
                Some(NegotiationError::NegotiationFailed(reason.clone()))
            }
            _ => None,
        }
    }
}

pub(crate) enum SessionCommand {
    Dial(DialOptions),
    Signal(Signal),
    AddTrack {
        track: TrackHandle,
        reply: oneshot::Sender<Result<()>>,
    },
    CreateChannel {
        label: String,
        options: ChannelOptions,
        reply: oneshot::Sender<Result<ChannelHandle>>,
    },
    Renegotiate,
    DataChannel {
        label: String,
        reply: oneshot::Sender<Option<ChannelHandle>>,
    },
    RemoteTracks {
        reply: oneshot::Sender<Vec<TrackHandle>>,
    },
}

enum Step {
    Command(SessionCommand),
    Engine(EngineEvent),
    FlushCandidates,
    AnswerTimeout,
}

/// Everything a worker needs besides its own queues.
pub(crate) struct WorkerContext {
    pub(crate) config: Arc<CallConfig>,
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) negotiation: Arc<NegotiationEngine>,
    pub(crate) factory: Arc<dyn EngineFactory>,
}

impl WorkerContext {
    fn events(&self) -> &EventBus {
        self.negotiation.events()
    }
}

pub(crate) fn spawn(ctx: Arc<WorkerContext>, seed: SessionSeed, stream: bool) {
    let id = seed.handle.id.clone();
    let generation = seed.handle.generation;
    let registry = ctx.registry.clone();
    let task = tokio::spawn(run(ctx, seed, stream));
    registry.attach_task(&id, generation, task);
}

async fn run(ctx: Arc<WorkerContext>, seed: SessionSeed, stream: bool) {
    let SessionSeed {
        handle,
        mut commands,
        mut cancel,
        snapshot,
    } = seed;
    let (event_tx, mut engine_events) = mpsc::unbounded_channel();

    let created = tokio::select! {
        biased;
        reason = cancelled(&mut cancel) => Err(reason),
        result = ctx.factory.create(&handle.id, &ctx.config, event_tx) => Ok(result),
    };
    let engine = match created {
        Ok(Ok(engine)) => engine,
        Ok(Err(err)) => {
            tracing::warn!(target = "negotiation", call_id = %handle.id, error = %err, "engine creation failed");
            let reason = CloseReason::EngineUnavailable(format!("create engine: {err}"));
            teardown(&ctx, &handle, None, reason, &snapshot).await;
            return;
        }
        Err(reason) => {
            teardown(&ctx, &handle, None, reason, &snapshot).await;
            return;
        }
    };

    let mut session = PeerSession::new(
        handle.id.clone(),
        handle.remote_peer.clone(),
        handle.role,
        stream,
        engine,
    );

    let reason = loop {
        snapshot.send_replace(session.snapshot());
        let batch_deadline = session.batch_deadline;
        let answer_deadline = session.answer_deadline;

        let step = tokio::select! {
            biased;
            reason = cancelled(&mut cancel) => break reason,
            Some(command) = commands.recv() => Step::Command(command),
            Some(event) = engine_events.recv() => Step::Engine(event),
            _ = sleep_until(batch_deadline) => Step::FlushCandidates,
            _ = sleep_until(answer_deadline) => Step::AnswerTimeout,
            else => break CloseReason::Shutdown,
        };

        let outcome = tokio::select! {
            biased;
            reason = cancelled(&mut cancel) => {
                tracing::debug!(target = "negotiation", call_id = %handle.id, "in-flight step discarded by close");
                break reason;
            }
            outcome = apply(&ctx, &mut session, step) => outcome,
        };

        match outcome {
            Ok(Flow::Continue) => {}
            Ok(Flow::Close(reason)) => break reason,
            Err(err) => report(ctx.events(), &session.id, err),
        }
    };

    teardown(&ctx, &handle, Some(session), reason, &snapshot).await;
}

async fn apply(ctx: &WorkerContext, session: &mut PeerSession, step: Step) -> Result<Flow> {
    let negotiation = &ctx.negotiation;
    match step {
        Step::Command(command) => {
            match command {
                SessionCommand::Dial(options) => negotiation.dial(session, options).await?,
                SessionCommand::Signal(signal) => negotiation.handle_signal(session, signal).await?,
                SessionCommand::AddTrack { track, reply } => {
                    let _ = reply.send(negotiation.add_track(session, track).await);
                }
                SessionCommand::CreateChannel {
                    label,
                    options,
                    reply,
                } => {
                    let _ = reply.send(negotiation.create_channel(session, &label, &options).await);
                }
                SessionCommand::Renegotiate => negotiation.renegotiate(session).await?,
                SessionCommand::DataChannel { label, reply } => {
                    let _ = reply.send(session.data_channels.get(&label).cloned());
                }
                SessionCommand::RemoteTracks { reply } => {
                    let _ = reply.send(session.remote_tracks.clone());
                }
            }
            Ok(Flow::Continue)
        }
        Step::Engine(event) => negotiation.on_engine_event(session, event).await,
        Step::FlushCandidates => {
            negotiation.flush_candidates(session);
            Ok(Flow::Continue)
        }
        Step::AnswerTimeout => {
            session.answer_deadline = None;
            if session.signaling() != SignalingState::HaveLocalOffer {
                return Ok(Flow::Continue);
            }
            let timeout = ctx.config.answer_timeout.unwrap_or_default();
            tracing::warn!(
                target = "negotiation",
                call_id = %session.id,
                timeout_ms = timeout.as_millis() as u64,
                "no answer received"
            );
            Ok(Flow::Close(CloseReason::AnswerTimeout(timeout)))
        }
    }
}

fn report(events: &EventBus, id: &CallId, err: NegotiationError) {
    if err.is_user_visible() {
        tracing::warn!(target = "negotiation", call_id = %id, error = %err, "negotiation step failed");
        events.error(id, err);
    } else {
        tracing::warn!(target = "negotiation", call_id = %id, error = %err, "signal dropped");
    }
}

async fn teardown(
    ctx: &WorkerContext,
    handle: &SessionHandle,
    session: Option<PeerSession>,
    reason: CloseReason,
    snapshot: &watch::Sender<SessionSnapshot>,
) {
    let disconnect_reported = session.as_ref().is_some_and(|s| s.disconnect_reported);
    let mut last = match &session {
        Some(session) => session.snapshot(),
        None => snapshot.borrow().clone(),
    };
    if let Some(session) = session {
        if let Err(err) = session.engine.close().await {
            tracing::debug!(target = "negotiation", call_id = %handle.id, error = %err, "engine close failed");
        }
    }

    ctx.registry.remove(&handle.id, Some(handle.generation));
    last.closed = true;
    snapshot.send_replace(last);
    tracing::info!(target = "negotiation", call_id = %handle.id, reason = ?reason, "session closed");

    let events = ctx.events();
    if let Some(err) = reason.error() {
        events.error(&handle.id, err);
    }
    if reason.emits_disconnected() && !disconnect_reported {
        events.emit(&handle.id, CallEvent::Disconnected);
    }
}

async fn cancelled(cancel: &mut watch::Receiver<Option<CloseReason>>) -> CloseReason {
    match cancel.wait_for(Option::is_some).await {
        Ok(reason) => reason.clone().unwrap_or(CloseReason::Shutdown),
        Err(_) => CloseReason::Shutdown,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
