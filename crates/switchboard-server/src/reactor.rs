//! Readiness event loop.
//!
//! A single thread owns the multiplexer. It accepts connections, turns
//! readiness into worker tasks, and applies interest changes that sessions
//! request from other threads.
//!
//! ```text
//!            ┌──────────────── commands (Rearm, WantWrite, ...) ───────────┐
//!            v                                                             │
//! ┌──────────────────┐  ready(session)  ┌─────────────┐  process_read/     │
//! │ Reactor (poll)   │─────────────────>│ WorkerPool  │──process_write ───>┤
//! └──────────────────┘                  └─────────────┘                    │
//!            ^                                                             │
//!            └───── Waker ◄──── Notifier (Readiness impl on sessions) ─────┘
//! ```
//!
//! # Invariants
//!
//! - At most one worker task per session. An event is ignored while a task
//!   is in flight; when the task ends it posts `Rearm`, and the reactor
//!   re-registers interest, which re-reports readiness that arrived in the
//!   meantime.
//! - Write interest is held only while the session has queued output.
//! - Only this thread calls into the multiplexer registry.

use std::{
    io,
    net::{SocketAddr, TcpListener, TcpStream},
    os::fd::AsRawFd,
    sync::{Arc, mpsc},
    time::Instant,
};

use mio::{Events, Interest, Poll, Token, Waker, event::Event, unix::SourceFd};
use parking_lot::Mutex;
use switchboard_core::{CloseReason, Directory, Readiness, Session, SessionId};

use crate::{ServerConfig, pool::WorkerPool, registry::SessionRegistry};

/// Token of the listening socket.
pub(crate) const LISTENER: Token = Token(0);

/// Token of the cross-thread waker.
pub(crate) const WAKER: Token = Token(1);

/// First id handed to an accepted session. Ids double as poll tokens.
const FIRST_SESSION_ID: u64 = 2;

/// Requests posted to the reactor thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    /// A worker task for the session finished.
    Rearm(SessionId),
    /// The session queued output.
    WantWrite(SessionId),
    /// The session drained its output.
    WantRead(SessionId),
    /// The session closed itself.
    Closed(SessionId),
    /// Leave the event loop.
    Shutdown,
}

/// Posts commands to the reactor and wakes it.
///
/// This is the [`Readiness`] implementation every session receives.
#[derive(Debug, Clone)]
pub(crate) struct Notifier {
    commands: mpsc::Sender<Command>,
    waker: Arc<Waker>,
}

impl Notifier {
    pub(crate) fn post(&self, command: Command) {
        // The reactor is gone; nothing left to notify.
        if self.commands.send(command).is_err() {
            return;
        }
        if let Err(e) = self.waker.wake() {
            tracing::warn!(error = %e, ?command, "Failed to wake reactor");
        }
    }
}

impl Readiness for Notifier {
    fn want_write(&self, session: SessionId) {
        self.post(Command::WantWrite(session));
    }

    fn want_read(&self, session: SessionId) {
        self.post(Command::WantRead(session));
    }

    fn closed(&self, session: SessionId) {
        self.post(Command::Closed(session));
    }
}

/// Posts `Rearm` when the worker task holding it finishes, panics included.
struct RearmOnDrop {
    session: SessionId,
    notifier: Notifier,
}

impl Drop for RearmOnDrop {
    fn drop(&mut self) {
        self.notifier.post(Command::Rearm(self.session));
    }
}

/// The event loop and everything it owns.
pub(crate) struct Reactor {
    poll: Poll,
    listener: TcpListener,
    commands: mpsc::Receiver<Command>,
    notifier: Notifier,
    readiness: Arc<dyn Readiness>,
    registry: Arc<Mutex<SessionRegistry>>,
    directory: Arc<Directory>,
    pool: Arc<WorkerPool>,
    config: ServerConfig,
    next_id: u64,
}

impl Reactor {
    /// Register `listener` with a fresh poll instance.
    ///
    /// `listener` must already be non-blocking.
    pub(crate) fn new(
        listener: TcpListener,
        registry: Arc<Mutex<SessionRegistry>>,
        directory: Arc<Directory>,
        pool: Arc<WorkerPool>,
        config: ServerConfig,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        poll.registry().register(
            &mut SourceFd(&listener.as_raw_fd()),
            LISTENER,
            Interest::READABLE,
        )?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        let (tx, commands) = mpsc::channel();
        let notifier = Notifier { commands: tx, waker };
        let readiness: Arc<dyn Readiness> = Arc::new(notifier.clone());

        Ok(Self {
            poll,
            listener,
            commands,
            notifier,
            readiness,
            registry,
            directory,
            pool,
            config,
            next_id: FIRST_SESSION_ID,
        })
    }

    /// A notifier for posting commands from other threads.
    pub(crate) fn notifier(&self) -> Notifier {
        self.notifier.clone()
    }

    /// Run until a `Shutdown` command arrives.
    ///
    /// # Errors
    ///
    /// Returns the error if polling fails for a reason other than `EINTR`.
    pub(crate) fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(self.config.max_events);

        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!(error = %e, "Poll failed");
                return Err(e);
            }

            for event in &events {
                match event.token() {
                    LISTENER => self.accept(),
                    WAKER => {},
                    token => self.ready(SessionId(token.0 as u64), event),
                }
            }

            if !self.apply_commands() {
                tracing::info!("Reactor stopping");
                return Ok(());
            }
        }
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    return;
                },
            }
        }
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        if self.registry.lock().len() >= self.config.max_connections {
            tracing::warn!(%peer, limit = self.config.max_connections, "Connection limit reached");
            return;
        }
        if let Err(e) = stream.set_nonblocking(true) {
            tracing::warn!(%peer, error = %e, "Failed to make socket non-blocking");
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let id = SessionId(self.next_id);
        self.next_id += 1;

        let session = Session::new(
            id,
            stream,
            Arc::clone(&self.directory),
            Arc::clone(&self.readiness),
            &self.config.session,
            Instant::now(),
        );

        let fd = session.raw_fd();
        if let Err(e) =
            self.poll.registry().register(&mut SourceFd(&fd), token(id), Interest::READABLE)
        {
            tracing::warn!(session = %id, %peer, error = %e, "Failed to register connection");
            session.close(e.into());
            return;
        }

        self.registry.lock().insert(session);
        tracing::info!(session = %id, %peer, "Accepted connection");
    }

    fn ready(&mut self, id: SessionId, event: &Event) {
        if event.is_error() || (event.is_read_closed() && event.is_write_closed()) {
            self.teardown(id, CloseReason::HangUp);
            return;
        }

        let Some(session) = self.registry.lock().begin_task(id) else {
            return;
        };

        // A half-closed peer still gets its final frames processed; the read
        // that returns end-of-stream closes the session.
        let readable = event.is_readable() || event.is_read_closed();
        let writable = event.is_writable();

        let rearm = RearmOnDrop { session: id, notifier: self.notifier.clone() };
        let submitted = self.pool.submit(move || {
            let _rearm = rearm;
            if writable {
                session.process_write();
            }
            if readable {
                session.process_read();
            }
        });

        if let Err(e) = submitted {
            tracing::warn!(session = %id, error = %e, "Failed to schedule session task");
            self.teardown(id, CloseReason::Shutdown);
        }
    }

    /// Apply queued commands. Returns `false` on `Shutdown`.
    fn apply_commands(&mut self) -> bool {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Rearm(id) => self.rearm(id),
                Command::WantWrite(id) | Command::WantRead(id) => {
                    let armed = self.registry.lock().armed(id);
                    if let Some(session) = armed {
                        self.update_interest(&session);
                    }
                },
                Command::Closed(id) => {
                    self.forget(id);
                },
                Command::Shutdown => return false,
            }
        }
        true
    }

    fn rearm(&mut self, id: SessionId) {
        let Some(session) = self.registry.lock().finish_task(id) else {
            return;
        };

        if session.is_closed() {
            self.forget(id);
            return;
        }
        self.update_interest(&session);
    }

    fn update_interest(&mut self, session: &Session) {
        let interest = if session.has_pending_output() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };

        let fd = session.raw_fd();
        if let Err(e) =
            self.poll.registry().reregister(&mut SourceFd(&fd), token(session.id()), interest)
        {
            tracing::debug!(session = %session.id(), error = %e, "Re-arm failed");
            self.teardown(session.id(), e.into());
        }
    }

    /// Drop the session from the registry and the multiplexer, then close it.
    fn teardown(&mut self, id: SessionId, reason: CloseReason) {
        if let Some(session) = self.forget(id) {
            session.close(reason);
        }
    }

    /// Drop the session from the registry and the multiplexer.
    fn forget(&mut self, id: SessionId) -> Option<Arc<Session>> {
        let session = self.registry.lock().remove(id)?;

        let fd = session.raw_fd();
        if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
            tracing::debug!(session = %id, error = %e, "Deregister failed");
        }
        tracing::debug!(session = %id, "Connection released");
        Some(session)
    }
}

fn token(id: SessionId) -> Token {
    Token(id.0 as usize)
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        sync::atomic::{AtomicUsize, Ordering},
        thread,
        time::Duration,
    };

    use switchboard_core::SessionConfig;
    use switchboard_proto::Message;

    use super::*;

    /// Counts close notices, ignores everything else.
    #[derive(Debug, Default)]
    struct CloseCount(AtomicUsize);

    impl Readiness for CloseCount {
        fn want_write(&self, _session: SessionId) {}

        fn want_read(&self, _session: SessionId) {}

        fn closed(&self, _session: SessionId) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn reactor() -> (Reactor, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();

        let reactor = Reactor::new(
            listener,
            Arc::new(Mutex::new(SessionRegistry::new())),
            Arc::new(Directory::new()),
            Arc::new(WorkerPool::new(2).unwrap()),
            ServerConfig::default(),
        )
        .unwrap();
        (reactor, addr)
    }

    #[test]
    fn shutdown_command_stops_loop() {
        let (mut reactor, _addr) = reactor();
        let notifier = reactor.notifier();

        let runner = thread::spawn(move || reactor.run());
        notifier.post(Command::Shutdown);

        runner.join().unwrap().unwrap();
    }

    #[test]
    fn session_round_trip_through_reactor() {
        let (mut reactor, addr) = reactor();
        let directory = Arc::clone(&reactor.directory);
        let registry = Arc::clone(&reactor.registry);
        let notifier = reactor.notifier();
        let runner = thread::spawn(move || reactor.run());

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        let body = serde_json::to_vec(&Message::login(5)).unwrap();
        client.write_all(&(body.len() as i32).to_be_bytes()).unwrap();
        client.write_all(&body).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while directory.lookup(5).is_none() {
            assert!(Instant::now() < deadline, "LOGIN never processed");
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(registry.lock().len(), 1);

        assert!(directory.send_to(5, &Message::heartbeat()));
        let mut header = [0u8; 4];
        client.read_exact(&mut header).unwrap();
        let mut reply = vec![0u8; i32::from_be_bytes(header) as usize];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(reply, br#"{"type":"HEARTBEAT"}"#.to_vec());

        drop(client);
        while registry.lock().len() > 0 {
            assert!(Instant::now() < deadline, "closed connection never released");
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(directory.count(), 0);

        notifier.post(Command::Shutdown);
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn connection_limit_rejects_extra_clients() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = Arc::new(Mutex::new(SessionRegistry::new()));

        let mut reactor = Reactor::new(
            listener,
            Arc::clone(&registry),
            Arc::new(Directory::new()),
            Arc::new(WorkerPool::new(1).unwrap()),
            ServerConfig { max_connections: 1, ..ServerConfig::default() },
        )
        .unwrap();
        let notifier = reactor.notifier();
        let runner = thread::spawn(move || reactor.run());

        let _first = std::net::TcpStream::connect(addr).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while registry.lock().len() < 1 {
            assert!(Instant::now() < deadline, "first connection never admitted");
            thread::sleep(Duration::from_millis(5));
        }

        let mut second = std::net::TcpStream::connect(addr).unwrap();
        second.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut byte = [0u8; 1];
        let outcome = second.read(&mut byte);
        assert!(matches!(outcome, Ok(0) | Err(_)), "rejected client should see close");
        assert_eq!(registry.lock().len(), 1);

        notifier.post(Command::Shutdown);
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn rearm_failure_tears_session_down_once() {
        let (mut reactor, _addr) = reactor();
        let pair = TcpListener::bind("127.0.0.1:0").unwrap();
        let _client = std::net::TcpStream::connect(pair.local_addr().unwrap()).unwrap();
        let (stream, _) = pair.accept().unwrap();
        stream.set_nonblocking(true).unwrap();

        let closes = Arc::new(CloseCount::default());
        let readiness: Arc<dyn Readiness> = Arc::<CloseCount>::clone(&closes);
        let id = SessionId(9);
        let session = Session::new(
            id,
            stream,
            Arc::clone(&reactor.directory),
            readiness,
            &SessionConfig::default(),
            Instant::now(),
        );
        session.dispatch(&Message::login(9));
        assert!(reactor.directory.lookup(9).is_some());

        // Tracked but never registered with the poll instance, so the
        // reregister on rearm fails.
        reactor.registry.lock().insert(Arc::clone(&session));
        assert!(reactor.registry.lock().begin_task(id).is_some());
        reactor.rearm(id);

        assert!(session.is_closed());
        assert_eq!(reactor.registry.lock().len(), 0);
        assert_eq!(reactor.directory.count(), 0);
        assert_eq!(closes.0.load(Ordering::SeqCst), 1);

        assert!(reactor.forget(id).is_none());
        reactor.teardown(id, CloseReason::HangUp);
        assert_eq!(closes.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reset_connection_releases_session() {
        let (mut reactor, addr) = reactor();
        let directory = Arc::clone(&reactor.directory);
        let registry = Arc::clone(&reactor.registry);
        let notifier = reactor.notifier();
        let runner = thread::spawn(move || reactor.run());

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        let body = serde_json::to_vec(&Message::login(5)).unwrap();
        client.write_all(&(body.len() as i32).to_be_bytes()).unwrap();
        client.write_all(&body).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let session = loop {
            if let Some(session) = directory.lookup(5) {
                break session;
            }
            assert!(Instant::now() < deadline, "LOGIN never processed");
            thread::sleep(Duration::from_millis(5));
        };

        // Leave a frame unread on the client so dropping it sends a reset.
        assert!(directory.send_to(5, &Message::heartbeat()));
        while session.has_pending_output() {
            assert!(Instant::now() < deadline, "frame never flushed");
            thread::sleep(Duration::from_millis(5));
        }
        thread::sleep(Duration::from_millis(50));
        drop(client);

        while registry.lock().len() > 0 {
            assert!(Instant::now() < deadline, "reset connection never released");
            thread::sleep(Duration::from_millis(5));
        }
        assert!(session.is_closed());
        assert_eq!(directory.count(), 0);

        notifier.post(Command::Shutdown);
        runner.join().unwrap().unwrap();
    }
}
