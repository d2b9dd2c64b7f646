//! Idle-connection sweeper.
//!
//! A background thread wakes every sweep interval and closes sessions that
//! have received no bytes for longer than the heartbeat timeout. Idle
//! sessions are collected under the registry lock and closed after it is
//! released; closing posts a command back to the reactor, which takes the
//! same lock.

use std::{
    io,
    sync::{Arc, mpsc},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::registry::SessionRegistry;

/// Handle to the running sweeper thread.
pub(crate) struct Heartbeat {
    stop: mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

impl Heartbeat {
    /// Start sweeping `registry`.
    pub(crate) fn spawn(
        registry: Arc<Mutex<SessionRegistry>>,
        timeout: Duration,
        interval: Duration,
    ) -> io::Result<Self> {
        let (stop, stopped) = mpsc::channel();

        let thread = thread::Builder::new().name("switchboard-heartbeat".to_string()).spawn(
            move || {
                while let Err(mpsc::RecvTimeoutError::Timeout) = stopped.recv_timeout(interval) {
                    let closed = sweep(&registry, Instant::now(), timeout);
                    if closed > 0 {
                        tracing::info!(closed, "Closed idle sessions");
                    }
                }
            },
        )?;

        Ok(Self { stop, thread })
    }

    /// Stop the thread and wait for it to exit.
    pub(crate) fn stop(self) {
        let _ = self.stop.send(());
        if self.thread.join().is_err() {
            tracing::error!("Heartbeat thread panicked");
        }
    }
}

/// Close every session idle for longer than `timeout` at `now`.
///
/// Returns how many sessions this pass closed.
pub(crate) fn sweep(registry: &Mutex<SessionRegistry>, now: Instant, timeout: Duration) -> usize {
    let idle = registry.lock().idle(now, timeout);

    idle.iter().filter(|session| session.check_timeout(now, timeout)).count()
}
