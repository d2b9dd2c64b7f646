//! Live session registry.
//!
//! The reactor's table of accepted connections, keyed by [`SessionId`]. Each
//! slot also tracks whether a worker task is currently running for the
//! session: readiness events that arrive while a task is in flight are
//! dropped, and the session is re-armed when the task reports back. That
//! gives one-task-per-session semantics on top of a multiplexer that would
//! otherwise keep reporting the same descriptor.
//!
//! Shared between the reactor and the heartbeat thread behind a mutex.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use switchboard_core::{Session, SessionId};

#[derive(Debug)]
struct Slot {
    session: Arc<Session>,
    in_flight: bool,
}

/// Registry of accepted sessions.
#[derive(Debug, Default)]
pub(crate) struct SessionRegistry {
    slots: HashMap<SessionId, Slot>,
}

impl SessionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Track a newly accepted session. Returns `false` if the id is taken.
    pub(crate) fn insert(&mut self, session: Arc<Session>) -> bool {
        let id = session.id();
        if self.slots.contains_key(&id) {
            return false;
        }
        self.slots.insert(id, Slot { session, in_flight: false });
        true
    }

    /// Stop tracking a session.
    pub(crate) fn remove(&mut self, id: SessionId) -> Option<Arc<Session>> {
        self.slots.remove(&id).map(|slot| slot.session)
    }

    /// Claim the session for a worker task.
    ///
    /// `None` if the session is unknown or a task is already in flight.
    pub(crate) fn begin_task(&mut self, id: SessionId) -> Option<Arc<Session>> {
        let slot = self.slots.get_mut(&id)?;
        if slot.in_flight {
            return None;
        }
        slot.in_flight = true;
        Some(Arc::clone(&slot.session))
    }

    /// Release the claim taken by [`SessionRegistry::begin_task`].
    ///
    /// `None` if the session was removed while the task ran.
    pub(crate) fn finish_task(&mut self, id: SessionId) -> Option<Arc<Session>> {
        let slot = self.slots.get_mut(&id)?;
        slot.in_flight = false;
        Some(Arc::clone(&slot.session))
    }

    /// The session, if tracked and no task is in flight for it.
    pub(crate) fn armed(&self, id: SessionId) -> Option<Arc<Session>> {
        self.slots.get(&id).filter(|slot| !slot.in_flight).map(|slot| Arc::clone(&slot.session))
    }

    /// Sessions idle for longer than `threshold` at `now`.
    pub(crate) fn idle(&self, now: Instant, threshold: Duration) -> Vec<Arc<Session>> {
        self.slots
            .values()
            .filter(|slot| slot.session.is_idle(now, threshold))
            .map(|slot| Arc::clone(&slot.session))
            .collect()
    }

    /// Remove and return every session.
    pub(crate) fn drain(&mut self) -> Vec<Arc<Session>> {
        self.slots.drain().map(|(_, slot)| slot.session).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}
