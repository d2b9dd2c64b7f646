//! Error types for the session layer.
//!
//! [`SessionError`] is returned to callers of session operations.
//! [`CloseReason`] records why a session was torn down; it is logged, never
//! sent to the peer.

use std::{io, time::Duration};

use switchboard_proto::ProtocolError;
use thiserror::Error;

use crate::session::SessionId;

/// Errors returned by session operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The session is closed and no longer accepts output.
    #[error("session {0} is closed")]
    Closed(SessionId),

    /// The message could not be framed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Why a session was closed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer shut down its side of the stream (read returned zero bytes).
    #[error("peer closed the connection")]
    PeerClosed,

    /// A non-retryable socket error.
    #[error("I/O error ({kind:?}): {message}")]
    Io {
        /// Error kind reported by the OS
        kind: io::ErrorKind,
        /// Error message
        message: String,
    },

    /// The peer violated the framing protocol.
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    /// No bytes arrived within the heartbeat timeout.
    #[error("idle for {idle:?}")]
    TimedOut {
        /// How long the session had been idle
        idle: Duration,
    },

    /// The readiness multiplexer reported a hangup or socket error.
    #[error("connection hung up")]
    HangUp,

    /// The server is shutting down.
    #[error("server shutdown")]
    Shutdown,
}

impl From<io::Error> for CloseReason {
    fn from(err: io::Error) -> Self {
        Self::Io { kind: err.kind(), message: err.to_string() }
    }
}
