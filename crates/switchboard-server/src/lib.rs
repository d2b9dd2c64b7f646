//! Switchboard chat relay server.
//!
//! A multi-threaded TCP server: clients log in with a numeric user id and
//! exchange JSON chat messages routed by the server.
//!
//! # Architecture
//!
//! This crate is the runtime around [`switchboard_core`]: one reactor thread
//! owns the readiness multiplexer (mio), a fixed [`WorkerPool`] runs all
//! session I/O and protocol work, and a heartbeat thread closes idle
//! connections.
//!
//! # Components
//!
//! - [`Server`]: binds the listener and runs the event loop until shut down
//! - [`ServerHandle`]: stops a running server from another thread
//! - [`ServerConfig`]: limits and timings
//! - [`WorkerPool`]: fixed-size FIFO thread pool
//!
//! # Example
//!
//! ```no_run
//! use switchboard_server::{Server, ServerConfig};
//!
//! # fn main() -> Result<(), switchboard_server::ServerError> {
//! let server = Server::bind(ServerConfig::default())?;
//! let handle = server.handle();
//! std::thread::spawn(move || {
//!     std::thread::sleep(std::time::Duration::from_secs(60));
//!     handle.shutdown();
//! });
//! server.run()?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod heartbeat;
pub mod pool;
mod reactor;
mod registry;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod testing;

use std::{
    net::{SocketAddr, TcpListener},
    sync::Arc,
    time::Duration,
};

pub use error::{PoolError, ServerError};
use parking_lot::Mutex;
pub use pool::{TaskHandle, WorkerPool};
pub use switchboard_core::{Directory, SessionConfig};
use switchboard_core::CloseReason;

use crate::{
    heartbeat::Heartbeat,
    reactor::{Command, Notifier, Reactor},
    registry::SessionRegistry,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to (e.g., "0.0.0.0:9006")
    pub bind_address: String,
    /// Worker pool size
    pub worker_threads: usize,
    /// Close a connection after this long without inbound bytes
    pub heartbeat_timeout: Duration,
    /// How often the heartbeat thread sweeps for idle connections
    pub sweep_interval: Duration,
    /// Readiness events fetched per poll
    pub max_events: usize,
    /// Connections beyond this are closed at accept
    pub max_connections: usize,
    /// Per-session limits
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:9006".to_string(),
            worker_threads: 8,
            heartbeat_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
            max_events: 1024,
            max_connections: 10_000,
            session: SessionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Check limits before anything is bound or spawned.
    ///
    /// # Errors
    ///
    /// - `ServerError::Config` naming the first invalid field
    pub fn validate(&self) -> Result<(), ServerError> {
        let invalid = |msg: &str| Err(ServerError::Config(msg.to_string()));

        if self.worker_threads == 0 {
            return invalid("worker_threads must be at least 1");
        }
        if self.max_events == 0 {
            return invalid("max_events must be at least 1");
        }
        if self.max_connections == 0 {
            return invalid("max_connections must be at least 1");
        }
        if self.sweep_interval.is_zero() {
            return invalid("sweep_interval must be non-zero");
        }
        if self.session.max_frame_size == 0 || self.session.max_frame_size > i32::MAX as usize {
            return invalid("max_frame_size must be in 1..=i32::MAX");
        }
        Ok(())
    }
}

/// Stops a running [`Server`] from any thread.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    notifier: Notifier,
}

impl ServerHandle {
    /// Ask the reactor to leave its loop. [`Server::run`] then stops the
    /// heartbeat, drains the worker pool and closes all connections.
    pub fn shutdown(&self) {
        self.notifier.post(Command::Shutdown);
    }
}

/// Chat relay server.
pub struct Server {
    config: ServerConfig,
    local_addr: SocketAddr,
    reactor: Reactor,
    registry: Arc<Mutex<SessionRegistry>>,
    directory: Arc<Directory>,
    pool: Arc<WorkerPool>,
}

impl Server {
    /// Validate `config`, bind the listener and start the worker pool.
    ///
    /// # Errors
    ///
    /// - `ServerError::Config` for invalid limits
    /// - `ServerError::Io` if the address cannot be bound or the multiplexer
    ///   cannot be created
    /// - `ServerError::Pool` if worker threads cannot be spawned
    pub fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;

        let listener = TcpListener::bind(&config.bind_address)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let pool = Arc::new(WorkerPool::new(config.worker_threads)?);
        let registry = Arc::new(Mutex::new(SessionRegistry::new()));
        let directory = Arc::new(Directory::new());

        let reactor = Reactor::new(
            listener,
            Arc::clone(&registry),
            Arc::clone(&directory),
            Arc::clone(&pool),
            config.clone(),
        )?;

        tracing::info!(%local_addr, workers = config.worker_threads, "Server bound");
        Ok(Self { config, local_addr, reactor, registry, directory, pool })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The user directory, shared with every session.
    pub fn directory(&self) -> Arc<Directory> {
        Arc::clone(&self.directory)
    }

    /// A handle that stops this server once it is running.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle { notifier: self.reactor.notifier() }
    }

    /// Run the event loop on the calling thread until shut down.
    ///
    /// # Errors
    ///
    /// - `ServerError::Io` if the heartbeat thread cannot start or polling
    ///   fails; connections are still closed before returning
    pub fn run(self) -> Result<(), ServerError> {
        let Self { config, local_addr, mut reactor, registry, directory, pool } = self;

        let heartbeat = Heartbeat::spawn(
            Arc::clone(&registry),
            config.heartbeat_timeout,
            config.sweep_interval,
        )?;
        tracing::info!(%local_addr, "Server running");

        let result = reactor.run();

        heartbeat.stop();
        pool.shutdown();

        let remaining = registry.lock().drain();
        let closed = remaining.len();
        for session in remaining {
            session.close(CloseReason::Shutdown);
        }
        tracing::info!(closed, users = directory.count(), "Server stopped");

        result.map_err(ServerError::from)
    }
}
