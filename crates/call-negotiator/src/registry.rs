use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{NegotiationError, Result};
use crate::id::CallId;
use crate::session::{Role, SessionSnapshot};
use crate::worker::{CloseReason, SessionCommand};

/// Cloneable front door to one live call's worker.
#[derive(Clone)]
pub(crate) struct SessionHandle {
    pub(crate) id: CallId,
    pub(crate) remote_peer: String,
    pub(crate) role: Role,
    pub(crate) generation: u64,
    commands: mpsc::UnboundedSender<SessionCommand>,
    cancel: Arc<watch::Sender<Option<CloseReason>>>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    pub(crate) fn send(&self, command: SessionCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| NegotiationError::UnknownSession(self.id.clone()))
    }

    /// Requests teardown. The first reason recorded wins; returns whether
    /// this call recorded it.
    pub(crate) fn cancel(&self, reason: CloseReason) -> bool {
        self.cancel.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(reason);
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }
}

/// Receiving ends handed to the worker that will own the new call.
pub(crate) struct SessionSeed {
    pub(crate) handle: SessionHandle,
    pub(crate) commands: mpsc::UnboundedReceiver<SessionCommand>,
    pub(crate) cancel: watch::Receiver<Option<CloseReason>>,
    pub(crate) snapshot: watch::Sender<SessionSnapshot>,
}

struct SessionEntry {
    handle: SessionHandle,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<CallId, SessionEntry>,
    closed: VecDeque<CallId>,
    closed_set: HashSet<CallId>,
    next_generation: u64,
}

/// Live calls by id, plus a bounded memory of recently closed ids so late
/// traffic for them is dropped instead of resurrecting the call.
///
/// The lock is only held for map operations, never across an await.
pub(crate) struct SessionRegistry {
    inner: Mutex<RegistryInner>,
    closed_capacity: usize,
}

impl SessionRegistry {
    pub(crate) fn new(closed_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            closed_capacity,
        }
    }

    pub(crate) fn create(&self, id: CallId, remote_peer: &str, role: Role) -> Result<SessionSeed> {
        let mut inner = self.inner.lock();
        if inner.sessions.contains_key(&id) {
            return Err(NegotiationError::DuplicateId(id));
        }
        inner.next_generation += 1;
        let generation = inner.next_generation;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(None);
        let (snapshot_tx, snapshot_rx) =
            watch::channel(SessionSnapshot::initial(id.clone(), remote_peer.to_string(), role));
        let handle = SessionHandle {
            id: id.clone(),
            remote_peer: remote_peer.to_string(),
            role,
            generation,
            commands: command_tx,
            cancel: Arc::new(cancel_tx),
            snapshot: snapshot_rx,
        };
        inner.sessions.insert(
            id.clone(),
            SessionEntry {
                handle: handle.clone(),
                task: None,
            },
        );
        tracing::info!(
            target = "negotiation",
            call_id = %id,
            peer = %remote_peer,
            role = ?role,
            "session created"
        );
        Ok(SessionSeed {
            handle,
            commands: command_rx,
            cancel: cancel_rx,
            snapshot: snapshot_tx,
        })
    }

    pub(crate) fn attach_task(&self, id: &CallId, generation: u64, task: JoinHandle<()>) {
        let mut inner = self.inner.lock();
        match inner.sessions.get_mut(id) {
            Some(entry) if entry.handle.generation == generation => entry.task = Some(task),
            // Worker already finished and removed itself.
            _ => {}
        }
    }

    pub(crate) fn get(&self, id: &CallId) -> Result<SessionHandle> {
        self.inner
            .lock()
            .sessions
            .get(id)
            .map(|entry| entry.handle.clone())
            .ok_or_else(|| NegotiationError::UnknownSession(id.clone()))
    }

    pub(crate) fn take_task(&self, id: &CallId) -> Option<JoinHandle<()>> {
        self.inner
            .lock()
            .sessions
            .get_mut(id)
            .and_then(|entry| entry.task.take())
    }

    /// Idempotent. With a generation, only that incarnation is removed.
    pub(crate) fn remove(&self, id: &CallId, generation: Option<u64>) -> bool {
        let mut inner = self.inner.lock();
        let matches = match (inner.sessions.get(id), generation) {
            (Some(entry), Some(generation)) => entry.handle.generation == generation,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !matches {
            return false;
        }
        inner.sessions.remove(id);
        self.remember_closed(&mut inner, id.clone());
        tracing::info!(target = "negotiation", call_id = %id, "session removed");
        true
    }

    /// Marks an id as closed without it ever having been live here.
    pub(crate) fn forget(&self, id: CallId) {
        let mut inner = self.inner.lock();
        if !inner.sessions.contains_key(&id) {
            self.remember_closed(&mut inner, id);
        }
    }

    fn remember_closed(&self, inner: &mut RegistryInner, id: CallId) {
        if self.closed_capacity == 0 || !inner.closed_set.insert(id.clone()) {
            return;
        }
        inner.closed.push_back(id);
        while inner.closed.len() > self.closed_capacity {
            if let Some(evicted) = inner.closed.pop_front() {
                inner.closed_set.remove(&evicted);
            }
        }
    }

    pub(crate) fn is_closed(&self, id: &CallId) -> bool {
        self.inner.lock().closed_set.contains(id)
    }

    pub(crate) fn ids(&self) -> Vec<CallId> {
        let mut ids: Vec<CallId> = self.inner.lock().sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub(crate) fn handles(&self) -> Vec<SessionHandle> {
        self.inner
            .lock()
            .sessions
            .values()
            .map(|entry| entry.handle.clone())
            .collect()
    }

    /// Calls we placed to `remote_peer` that have not been answered yet.
    pub(crate) fn pending_outbound(&self, remote_peer: &str) -> Vec<SessionHandle> {
        self.inner
            .lock()
            .sessions
            .values()
            .filter(|entry| {
                entry.handle.role == Role::Caller
                    && entry.handle.remote_peer == remote_peer
                    && !entry.handle.snapshot.borrow().remote_description_set
            })
            .map(|entry| entry.handle.clone())
            .collect()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_id_is_rejected() {
        let registry = SessionRegistry::new(8);
        let id = CallId::random();
        let _seed = registry.create(id.clone(), "bob", Role::Caller).expect("first");
        let err = registry
            .create(id.clone(), "bob", Role::Caller)
            .err()
            .expect("duplicate");
        assert_eq!(err, NegotiationError::DuplicateId(id));
    }

    #[test]
    fn get_unknown_is_not_found() {
        let registry = SessionRegistry::new(8);
        let id = CallId::random();
        assert_eq!(
            registry.get(&id).err(),
            Some(NegotiationError::UnknownSession(id))
        );
    }

    #[test]
    fn remove_is_idempotent_and_remembers_id() {
        let registry = SessionRegistry::new(8);
        let id = CallId::random();
        let _seed = registry.create(id.clone(), "bob", Role::Callee).expect("create");
        assert!(registry.remove(&id, None));
        assert!(!registry.remove(&id, None));
        assert!(registry.is_closed(&id));
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn stale_generation_does_not_remove_new_session() {
        let registry = SessionRegistry::new(8);
        let id = CallId::random();
        let first = registry.create(id.clone(), "bob", Role::Caller).expect("create");
        registry.remove(&id, Some(first.handle.generation));
        let second = registry.create(id.clone(), "bob", Role::Caller).expect("recreate");
        assert!(!registry.remove(&id, Some(first.handle.generation)));
        assert!(registry.get(&id).is_ok());
        assert!(registry.remove(&id, Some(second.handle.generation)));
    }

    #[test]
    fn closed_memory_is_bounded() {
        let registry = SessionRegistry::new(2);
        let ids: Vec<CallId> = (0..3).map(|_| CallId::random()).collect();
        for id in &ids {
            registry.forget(id.clone());
        }
        assert!(!registry.is_closed(&ids[0]));
        assert!(registry.is_closed(&ids[1]));
        assert!(registry.is_closed(&ids[2]));
    }

    #[test]
    fn first_cancel_reason_wins() {
        let registry = SessionRegistry::new(8);
        let seed = registry
            .create(CallId::random(), "bob", Role::Caller)
            .expect("create");
        assert!(seed.handle.cancel(CloseReason::Local));
        assert!(!seed.handle.cancel(CloseReason::Remote));
        assert_eq!(*seed.cancel.borrow(), Some(CloseReason::Local));
    }

    #[test]
    fn pending_outbound_lists_unanswered_calls() {
        let registry = SessionRegistry::new(8);
        let outbound = registry
            .create(CallId::random(), "bob", Role::Caller)
            .expect("create");
        let _inbound = registry
            .create(CallId::random(), "bob", Role::Callee)
            .expect("create");
        let _other = registry
            .create(CallId::random(), "carol", Role::Caller)
            .expect("create");

        let pending = registry.pending_outbound("bob");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, outbound.handle.id);

        outbound.snapshot.send_modify(|snapshot| snapshot.remote_description_set = true);
        assert!(registry.pending_outbound("bob").is_empty());
    }
}
