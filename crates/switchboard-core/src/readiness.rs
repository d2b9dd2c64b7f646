//! Session → reactor interest requests.
//!
//! Only the reactor thread may touch the readiness multiplexer. Sessions run
//! on worker threads (and are reached from other sessions' tasks through the
//! directory), so they never change interest directly: they post a request
//! through this trait and the reactor applies it on its own thread.

use crate::session::SessionId;

/// Interest-change requests a [`Session`](crate::Session) sends to the
/// reactor that owns its descriptor.
///
/// Implementations must be cheap and non-blocking; they are called while the
/// session holds no locks, from any thread.
pub trait Readiness: Send + Sync {
    /// Output was queued; the session needs write readiness.
    fn want_write(&self, session: SessionId);

    /// Output fully drained; revert to read-only interest.
    fn want_read(&self, session: SessionId);

    /// The session closed; stop watching its descriptor.
    fn closed(&self, session: SessionId);
}
