//! Server error types.

use std::io;

use thiserror::Error;

/// Errors from the worker pool.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// A pool needs at least one worker thread.
    #[error("worker pool needs at least one thread")]
    NoWorkers,

    /// The OS refused to start a worker thread.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),

    /// The pool no longer accepts tasks.
    #[error("worker pool is shut down")]
    ShutDown,

    /// The task panicked; the payload message is attached.
    #[error("task panicked: {0}")]
    TaskPanicked(String),
}

/// Errors that can occur in the server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid configuration.
    ///
    /// Fatal at startup. Fix configuration and restart.
    #[error("configuration error: {0}")]
    Config(String),

    /// Socket or multiplexer failure (bind address in use, poll failure).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Worker pool failure.
    #[error("worker pool error: {0}")]
    Pool(#[from] PoolError),
}
