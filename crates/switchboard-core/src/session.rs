//! Per-connection protocol state machine.
//!
//! A session owns one accepted TCP stream plus its inbound and outbound
//! buffers. The reactor never runs session code itself: it hands a ready
//! session to a worker, which calls [`Session::process_read`] and/or
//! [`Session::process_write`].
//!
//! # State Machine
//!
//! ```text
//! ┌─────────────────┐  LOGIN   ┌───────────────┐
//! │ Unauthenticated │─────────>│ Authenticated │
//! └─────────────────┘          └───────────────┘
//!          │                           │
//!          │  close(): peer EOF, I/O error, bad length, timeout, hangup
//!          v                           v
//!       ┌──────────────────────────────────┐   teardown done  ┌────────┐
//!       │             Closing              │─────────────────>│ Closed │
//!       └──────────────────────────────────┘                  └────────┘
//! ```
//!
//! # Concurrency
//!
//! - Only one task at a time runs `process_read`/`process_write` for a given
//!   session (the reactor re-arms after the task finishes).
//! - [`Session::send`] may be called from any thread, typically another
//!   session's task routing a CHAT message.
//! - [`Session::close`] may race between a worker, the heartbeat thread and
//!   the reactor. Exactly one caller runs teardown.
//!
//! Lock order: a session never calls into the [`Directory`] or its
//! [`Readiness`] while holding its outbound buffer lock.

use std::{
    fmt,
    io::{self, Write},
    net::{Shutdown, SocketAddr, TcpStream},
    os::fd::{AsRawFd, RawFd},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::Serialize;
use switchboard_proto::{
    Buffer, FrameCodec, MAX_FRAME_SIZE, Message, MessageKind, ProtocolError, UserId,
};

use crate::{
    directory::Directory,
    error::{CloseReason, SessionError},
    readiness::Readiness,
};

/// Default largest frame body a session accepts.
pub const DEFAULT_MAX_FRAME_SIZE: usize = MAX_FRAME_SIZE;

/// Opaque handle for a session, unique for the lifetime of the server.
///
/// Descriptor numbers are reused by the OS after close, so the reactor keys
/// its registry by this id instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-session limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Largest accepted frame body. A header declaring more closes the session.
    pub max_frame_size: usize,
    /// Initial writable capacity of each buffer.
    pub initial_buffer_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            initial_buffer_size: switchboard_proto::buffer::INITIAL_SIZE,
        }
    }
}

/// Observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, no successful LOGIN yet
    Unauthenticated,
    /// LOGIN succeeded; registered in the directory
    Authenticated,
    /// `close` has started; teardown in progress
    Closing,
    /// Teardown complete
    Closed,
}

/// Outcome of one `process_write` pass.
enum Flush {
    Drained,
    Blocked,
    Failed(io::Error),
}

/// One client connection.
pub struct Session {
    id: SessionId,
    me: Weak<Session>,
    stream: TcpStream,
    peer_addr: Option<SocketAddr>,
    codec: FrameCodec,
    user_id: Mutex<Option<UserId>>,
    closed: AtomicBool,
    torn_down: AtomicBool,
    last_active: Mutex<Instant>,
    inbound: Mutex<Buffer>,
    outbound: Mutex<Buffer>,
    directory: Arc<Directory>,
    readiness: Arc<dyn Readiness>,
}

impl Session {
    /// Wrap an accepted stream.
    ///
    /// The stream must already be in non-blocking mode. `last_active` starts
    /// at `now`.
    pub fn new(
        id: SessionId,
        stream: TcpStream,
        directory: Arc<Directory>,
        readiness: Arc<dyn Readiness>,
        config: &SessionConfig,
        now: Instant,
    ) -> Arc<Self> {
        let peer_addr = stream.peer_addr().ok();

        Arc::new_cyclic(|me| Self {
            id,
            me: me.clone(),
            stream,
            peer_addr,
            codec: FrameCodec::new(config.max_frame_size),
            user_id: Mutex::new(None),
            closed: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            last_active: Mutex::new(now),
            inbound: Mutex::new(Buffer::with_capacity(config.initial_buffer_size)),
            outbound: Mutex::new(Buffer::with_capacity(config.initial_buffer_size)),
            directory,
            readiness,
        })
    }

    /// Session handle.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Underlying descriptor, for readiness registration.
    pub fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Remote address captured at accept time.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// User id claimed at LOGIN, if any.
    pub fn user_id(&self) -> Option<UserId> {
        *self.user_id.lock()
    }

    /// Whether a LOGIN has succeeded.
    pub fn is_authenticated(&self) -> bool {
        self.user_id.lock().is_some()
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        if self.torn_down.load(Ordering::Acquire) {
            SessionState::Closed
        } else if self.is_closed() {
            SessionState::Closing
        } else if self.is_authenticated() {
            SessionState::Authenticated
        } else {
            SessionState::Unauthenticated
        }
    }

    /// Time of the last successful read (or of accept).
    pub fn last_active(&self) -> Instant {
        *self.last_active.lock()
    }

    /// Whether queued output is waiting for the socket.
    pub fn has_pending_output(&self) -> bool {
        self.outbound.lock().readable_bytes() > 0
    }

    /// Read everything available and dispatch each complete frame in order.
    ///
    /// Incomplete frames stay buffered for the next call. `WouldBlock` and
    /// `EINTR` are not errors. The session is closed on end-of-stream, on a
    /// socket error, and on a frame header whose length is negative or above
    /// the limit; nothing after a bad header is dispatched.
    pub fn process_read(&self) {
        if self.is_closed() {
            return;
        }

        let mut inbound = self.inbound.lock();
        let bytes = match inbound.read_from(&mut &self.stream) {
            Ok(0) => {
                drop(inbound);
                self.close(CloseReason::PeerClosed);
                return;
            },
            Ok(n) => n,
            Err(e) if is_transient(&e) => return,
            Err(e) => {
                drop(inbound);
                self.close(e.into());
                return;
            },
        };

        *self.last_active.lock() = Instant::now();
        tracing::trace!(session = %self.id, bytes, "Read from socket");

        let violation = loop {
            if self.is_closed() {
                break None;
            }
            match self.codec.decode(&mut inbound) {
                Ok(Some(body)) => self.handle_frame(&body),
                Ok(None) => break None,
                Err(e) => break Some(e),
            }
        };
        drop(inbound);

        if let Some(err) = violation {
            tracing::warn!(session = %self.id, peer = ?self.peer_addr, error = %err, "Framing violation");
            self.close(CloseReason::Protocol(err));
        }
    }

    /// Write as much queued output as the socket accepts.
    ///
    /// Once the outbound buffer is empty the reactor is asked to drop write
    /// interest. A non-retryable write error closes the session.
    pub fn process_write(&self) {
        if self.is_closed() {
            return;
        }

        let mut outbound = self.outbound.lock();
        let flush = loop {
            if outbound.readable_bytes() == 0 {
                break Flush::Drained;
            }
            match (&self.stream).write(outbound.peek()) {
                Ok(0) => break Flush::Blocked,
                Ok(n) => outbound.retrieve(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Flush::Blocked,
                Err(e) => break Flush::Failed(e),
            }
        };
        drop(outbound);

        match flush {
            Flush::Drained => self.readiness.want_read(self.id),
            Flush::Blocked => {},
            Flush::Failed(e) => {
                self.close(e.into());
            },
        }
    }

    /// Frame `message` as JSON and queue it for delivery.
    ///
    /// Callable from any thread. Requests write readiness from the reactor.
    ///
    /// # Errors
    ///
    /// - `SessionError::Closed` if the session is closed
    /// - `SessionError::Protocol` if the message cannot be serialized or
    ///   exceeds the frame limit
    pub fn send<T: Serialize + ?Sized>(&self, message: &T) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed(self.id));
        }

        let body =
            serde_json::to_vec(message).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        self.codec.encode_into(&body, &mut self.outbound.lock())?;

        self.readiness.want_write(self.id);
        Ok(())
    }

    /// Close the session.
    ///
    /// Idempotent and race-safe: returns `true` only for the caller that
    /// performed teardown. Teardown shuts the socket down, removes this
    /// session's directory entry (only if it still maps to this session) and
    /// tells the reactor to forget the descriptor.
    pub fn close(&self, reason: CloseReason) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        let user = self.user_id();
        tracing::info!(session = %self.id, peer = ?self.peer_addr, ?user, %reason, "Closing session");

        if let Err(e) = self.stream.shutdown(Shutdown::Both)
            && e.kind() != io::ErrorKind::NotConnected
        {
            tracing::debug!(session = %self.id, error = %e, "Socket shutdown failed");
        }

        if let Some(user) = user {
            self.directory.release(user, self);
        }
        self.readiness.closed(self.id);

        self.torn_down.store(true, Ordering::Release);
        true
    }

    /// Whether no bytes have arrived for strictly longer than `threshold`.
    pub fn is_idle(&self, now: Instant, threshold: Duration) -> bool {
        now.saturating_duration_since(self.last_active()) > threshold
    }

    /// Close the session if it has been idle for longer than `threshold`.
    ///
    /// Returns whether this call closed it.
    pub fn check_timeout(&self, now: Instant, threshold: Duration) -> bool {
        let idle = now.saturating_duration_since(self.last_active());
        if idle <= threshold {
            return false;
        }
        self.close(CloseReason::TimedOut { idle })
    }

    /// Route a decoded message to its handler.
    ///
    /// Before LOGIN only LOGIN is handled; everything else is dropped.
    /// Unknown types are logged and ignored.
    pub fn dispatch(&self, message: &Message) {
        let Some(type_name) = message.type_name() else {
            tracing::debug!(session = %self.id, "Ignoring message without a type");
            return;
        };

        let kind = MessageKind::from_type(type_name);
        if kind != Some(MessageKind::Login) && !self.is_authenticated() {
            tracing::debug!(session = %self.id, type_name, "Rejecting message before LOGIN");
            return;
        }

        match kind {
            Some(MessageKind::Login) => self.handle_login(message),
            Some(MessageKind::Chat) => self.handle_chat(message),
            Some(MessageKind::Heartbeat) => {
                tracing::trace!(session = %self.id, "Heartbeat");
            },
            None => {
                tracing::warn!(session = %self.id, type_name, "Unknown message type");
            },
        }
    }

    fn handle_frame(&self, body: &[u8]) {
        match Message::decode(body) {
            Ok(message) => self.dispatch(&message),
            Err(e) => {
                tracing::warn!(session = %self.id, error = %e, "Dropping malformed frame");
            },
        }
    }

    fn handle_login(&self, message: &Message) {
        let Some(id) = message.int_field("id") else {
            tracing::debug!(session = %self.id, "LOGIN without an integer id");
            return;
        };
        let Some(me) = self.me.upgrade() else {
            return;
        };

        let previous = self.user_id.lock().replace(id);
        if let Some(previous) = previous
            && previous != id
        {
            self.directory.release(previous, self);
        }

        self.directory.register(id, me);

        // A concurrent close may have released before the entry existed.
        if self.is_closed() {
            self.directory.release(id, self);
            return;
        }

        tracing::info!(session = %self.id, peer = ?self.peer_addr, user = id, "Logged in");
    }

    fn handle_chat(&self, message: &Message) {
        let Some(to) = message.int_field("to") else {
            tracing::debug!(session = %self.id, "CHAT without an integer recipient");
            return;
        };

        let delivered = self.directory.send_to(to, message);
        tracing::debug!(session = %self.id, from = ?self.user_id(), to, delivered, "Routed chat");
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("user_id", &self.user_id())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}
