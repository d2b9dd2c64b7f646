//! Switchboard connection core.
//!
//! Per-connection protocol logic and cross-connection routing, independent of
//! how readiness is detected or which thread runs the I/O.
//!
//! # Components
//!
//! - [`Session`]: protocol state machine over one TCP connection. Decodes
//!   inbound frames, dispatches them to handlers, and queues outbound frames.
//! - [`Directory`]: concurrent `user id → session` map used for routing.
//! - [`Readiness`]: the interface a session uses to ask its reactor for
//!   interest changes. Supplied at construction; there is no global callback.
//!
//! # Ownership
//!
//! Sessions live in an `Arc` shared by the reactor's registry, the directory
//! (once authenticated) and any in-flight worker task. The socket is closed
//! when the last holder drops its reference; [`Session::close`] only shuts the
//! connection down and unhooks it from the directory and reactor.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod directory;
pub mod error;
pub mod readiness;
pub mod session;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod testing;

pub use directory::Directory;
pub use error::{CloseReason, SessionError};
pub use readiness::Readiness;
pub use session::{DEFAULT_MAX_FRAME_SIZE, Session, SessionConfig, SessionId, SessionState};
