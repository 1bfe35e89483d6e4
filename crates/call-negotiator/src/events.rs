//! Lifecycle notifications for the application.
//!
//! One observer at a time: registering a handler replaces the previous one.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::engine::TrackHandle;
use crate::error::NegotiationError;
use crate::id::CallId;

#[derive(Debug, Clone)]
pub enum CallEvent {
    Connected,
    Disconnected,
    ChannelOpen { label: String },
    TrackAdded { track: TrackHandle },
    LocalTrackAdded { track: TrackHandle },
    IncomingCall { from: String, stream: bool },
    Error(NegotiationError),
}

impl CallEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CallEvent::Connected => "connected",
            CallEvent::Disconnected => "disconnected",
            CallEvent::ChannelOpen { .. } => "channel-open",
            CallEvent::TrackAdded { .. } => "track-added",
            CallEvent::LocalTrackAdded { .. } => "local-track-added",
            CallEvent::IncomingCall { .. } => "incoming-call",
            CallEvent::Error(_) => "error",
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&CallId, CallEvent) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&CallId, &NegotiationError) + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    handler: RwLock<Option<EventHandler>>,
    error_handler: RwLock<Option<ErrorHandler>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(&CallId, CallEvent) + Send + Sync + 'static,
    {
        *self.handler.write() = Some(Arc::new(handler));
    }

    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&CallId, &NegotiationError) + Send + Sync + 'static,
    {
        *self.error_handler.write() = Some(Arc::new(handler));
    }

    /// Installs a handler that forwards every event into a channel. Like
    /// `on_event`, this replaces whatever observer was registered.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<(CallId, CallEvent)> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.on_event(move |id, event| {
            let _ = tx.send((id.clone(), event));
        });
        rx
    }

    pub fn emit(&self, id: &CallId, event: CallEvent) {
        // Clone out of the slot so a handler may re-register without deadlock.
        let handler = self.handler.read().clone();
        match handler {
            Some(handler) => {
                tracing::trace!(target = "negotiation", call_id = %id, event = event.name(), "emit");
                handler(id, event);
            }
            None => {
                tracing::trace!(target = "negotiation", call_id = %id, event = event.name(), "no observer");
            }
        }
    }

    /// Reports a failure to the error handler and as a `CallEvent::Error`.
    pub fn error(&self, id: &CallId, err: NegotiationError) {
        let handler = self.error_handler.read().clone();
        if let Some(handler) = handler {
            handler(id, &err);
        }
        self.emit(id, CallEvent::Error(err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn emit_without_handler_is_noop() {
        let bus = EventBus::new();
        bus.emit(&CallId::random(), CallEvent::Connected);
    }

    #[test]
    fn last_registration_wins() {
        let bus = EventBus::new();
        let first = Arc::new(Mutex::new(Vec::new()));
        let second = Arc::new(Mutex::new(Vec::new()));
        {
            let first = first.clone();
            bus.on_event(move |_, event| first.lock().push(event.name()));
        }
        {
            let second = second.clone();
            bus.on_event(move |_, event| second.lock().push(event.name()));
        }
        bus.emit(&CallId::random(), CallEvent::Connected);
        assert!(first.lock().is_empty());
        assert_eq!(*second.lock(), vec!["connected"]);
    }

    #[test]
    fn errors_reach_both_handlers() {
        let bus = EventBus::new();
        let errors = Arc::new(Mutex::new(Vec::new()));
        {
            let errors = errors.clone();
            bus.on_error(move |_, err| errors.lock().push(err.clone()));
        }
        let mut rx = bus.subscribe();
        let id = CallId::random();
        bus.error(&id, NegotiationError::IceFailed { restarts: 1 });

        assert_eq!(*errors.lock(), vec![NegotiationError::IceFailed { restarts: 1 }]);
        let (got_id, event) = rx.try_recv().expect("forwarded");
        assert_eq!(got_id, id);
        assert!(matches!(event, CallEvent::Error(NegotiationError::IceFailed { restarts: 1 })));
    }
}
