//! User directory: `user id → session` routing table.
//!
//! Written on LOGIN and teardown, read on every CHAT. A reader-writer lock
//! lets lookups from many workers proceed in parallel.
//!
//! # Invariants
//!
//! - At most one session per user id. A later LOGIN with the same id replaces
//!   the entry; the displaced session stays connected but is unreachable.
//! - Teardown removes an entry only if it still points at the closing session
//!   ([`Directory::release`]), so a displaced session cannot evict its
//!   replacement.

use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use serde::Serialize;
use switchboard_proto::UserId;

use crate::session::Session;

/// Concurrent user directory.
#[derive(Debug, Default)]
pub struct Directory {
    users: RwLock<HashMap<UserId, Arc<Session>>>,
}

impl Directory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `id` to `session`, replacing any existing entry.
    ///
    /// Returns the displaced session, if any.
    pub fn register(&self, id: UserId, session: Arc<Session>) -> Option<Arc<Session>> {
        let incoming = session.id();
        let replaced = self.users.write().insert(id, session);
        if let Some(old) = &replaced
            && old.id() != incoming
        {
            tracing::info!(user = id, displaced = %old.id(), session = %incoming, "User id taken over");
        }
        replaced
    }

    /// Remove the entry for `id` unconditionally.
    pub fn unregister(&self, id: UserId) -> Option<Arc<Session>> {
        self.users.write().remove(&id)
    }

    /// Remove the entry for `id` only if it maps to `session`.
    ///
    /// Returns whether an entry was removed.
    pub fn release(&self, id: UserId, session: &Session) -> bool {
        let mut users = self.users.write();
        match users.get(&id) {
            Some(current) if std::ptr::eq(Arc::as_ptr(current), session) => {
                users.remove(&id);
                true
            },
            _ => false,
        }
    }

    /// Session registered under `id`.
    pub fn lookup(&self, id: UserId) -> Option<Arc<Session>> {
        self.users.read().get(&id).cloned()
    }

    /// Send `message` to the session registered under `id`.
    ///
    /// Returns `true` if a recipient was found and a send was attempted. A
    /// send failure (recipient closing) is logged and swallowed; an unknown
    /// id is silently ignored.
    pub fn send_to<T: Serialize + ?Sized>(&self, id: UserId, message: &T) -> bool {
        let Some(session) = self.lookup(id) else {
            return false;
        };

        if let Err(e) = session.send(message) {
            tracing::debug!(user = id, session = %session.id(), error = %e, "Dropped routed message");
        }
        true
    }

    /// Send `message` to every registered session.
    ///
    /// Returns how many sends were attempted. Holds the read lock for the
    /// whole pass, so registrations wait until it finishes.
    pub fn broadcast<T: Serialize + ?Sized>(&self, message: &T) -> usize {
        let users = self.users.read();
        for (id, session) in users.iter() {
            if let Err(e) = session.send(message) {
                tracing::debug!(user = *id, session = %session.id(), error = %e, "Broadcast skipped");
            }
        }
        users.len()
    }

    /// Number of registered users.
    pub fn count(&self) -> usize {
        self.users.read().len()
    }

    /// Registered user ids in ascending order.
    pub fn list_ids(&self) -> Vec<UserId> {
        let mut ids: Vec<UserId> = self.users.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use switchboard_proto::Message;

    use super::*;
    use crate::{
        CloseReason,
        testing::{Recorder, Signal, connected, expect_frame},
    };

    #[test]
    fn register_lookup_unregister() {
        let directory = Arc::new(Directory::new());
        let recorder = Recorder::new();
        let (a, _ca) = connected(1, &directory, &recorder);
        let (b, _cb) = connected(2, &directory, &recorder);

        assert!(directory.register(10, Arc::clone(&a)).is_none());
        assert!(directory.register(3, Arc::clone(&b)).is_none());
        assert_eq!(directory.count(), 2);
        assert_eq!(directory.list_ids(), vec![3, 10]);
        assert!(Arc::ptr_eq(&directory.lookup(10).unwrap(), &a));

        let removed = directory.unregister(10).unwrap();
        assert!(Arc::ptr_eq(&removed, &a));
        assert!(directory.lookup(10).is_none());
        assert!(directory.unregister(10).is_none());
        assert_eq!(directory.count(), 1);
    }

    #[test]
    fn register_replaces_existing_entry() {
        let directory = Arc::new(Directory::new());
        let recorder = Recorder::new();
        let (old, _co) = connected(1, &directory, &recorder);
        let (new, _cn) = connected(2, &directory, &recorder);

        directory.register(5, Arc::clone(&old));
        let displaced = directory.register(5, Arc::clone(&new)).unwrap();

        assert!(Arc::ptr_eq(&displaced, &old));
        assert!(Arc::ptr_eq(&directory.lookup(5).unwrap(), &new));
        assert_eq!(directory.count(), 1);
    }

    #[test]
    fn release_ignores_other_sessions() {
        let directory = Arc::new(Directory::new());
        let recorder = Recorder::new();
        let (old, _co) = connected(1, &directory, &recorder);
        let (new, _cn) = connected(2, &directory, &recorder);

        directory.register(5, Arc::clone(&old));
        directory.register(5, Arc::clone(&new));

        assert!(!directory.release(5, &old));
        assert!(directory.lookup(5).is_some());
        assert!(directory.release(5, &new));
        assert!(directory.lookup(5).is_none());
    }

    #[test]
    fn displaced_session_close_keeps_replacement() {
        let directory = Arc::new(Directory::new());
        let recorder = Recorder::new();
        let (old, _co) = connected(1, &directory, &recorder);
        let (new, _cn) = connected(2, &directory, &recorder);

        old.dispatch(&Message::login(5));
        new.dispatch(&Message::login(5));
        old.close(CloseReason::PeerClosed);

        assert!(Arc::ptr_eq(&directory.lookup(5).unwrap(), &new));
    }

    #[test]
    fn send_to_unknown_user_is_a_miss() {
        let directory = Arc::new(Directory::new());
        assert!(!directory.send_to(99, &Message::heartbeat()));
    }

    #[test]
    fn send_to_queues_frame_for_recipient() {
        let directory = Arc::new(Directory::new());
        let recorder = Recorder::new();
        let (session, mut client) = connected(1, &directory, &recorder);
        directory.register(7, Arc::clone(&session));

        assert!(directory.send_to(7, &json!({"type": "CHAT", "to": 7, "msg": "hi"})));
        assert!(recorder.contains(Signal::WantWrite(session.id())));

        session.process_write();
        assert_eq!(expect_frame(&mut client), br#"{"type":"CHAT","to":7,"msg":"hi"}"#.to_vec());
    }

    #[test]
    fn send_to_closing_recipient_is_swallowed() {
        let directory = Arc::new(Directory::new());
        let recorder = Recorder::new();
        let (session, _client) = connected(1, &directory, &recorder);
        directory.register(7, Arc::clone(&session));
        session.close(CloseReason::Shutdown);

        // Registered manually, so close did not release it.
        assert!(directory.send_to(7, &Message::heartbeat()));
        assert!(!session.has_pending_output());
    }

    #[test]
    fn broadcast_reaches_every_open_session() {
        let directory = Arc::new(Directory::new());
        let recorder = Recorder::new();
        let (a, _ca) = connected(1, &directory, &recorder);
        let (b, _cb) = connected(2, &directory, &recorder);
        let (c, _cc) = connected(3, &directory, &recorder);
        directory.register(1, Arc::clone(&a));
        directory.register(2, Arc::clone(&b));
        directory.register(3, Arc::clone(&c));
        c.close(CloseReason::Shutdown);

        assert_eq!(directory.broadcast(&Message::heartbeat()), 3);
        assert!(a.has_pending_output());
        assert!(b.has_pending_output());
        assert!(!c.has_pending_output());
    }

    #[test]
    fn empty_directory() {
        let directory = Directory::new();
        assert_eq!(directory.count(), 0);
        assert!(directory.list_ids().is_empty());
        assert_eq!(directory.broadcast(&Message::heartbeat()), 0);
    }
}
