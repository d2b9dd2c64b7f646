//! Switchboard server binary.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: 0.0.0.0:9006, 8 workers, 30 s heartbeat timeout
//! switchboard-server
//!
//! # Custom port and pool size
//! switchboard-server --bind 127.0.0.1:7000 --threads 16
//! ```

use std::time::Duration;

use clap::Parser;
use switchboard_server::{Server, ServerConfig, SessionConfig};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Switchboard chat relay server
#[derive(Parser, Debug)]
#[command(name = "switchboard-server")]
#[command(about = "Multi-threaded TCP chat relay server")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:9006")]
    bind: String,

    /// Worker threads
    #[arg(short, long, default_value = "8")]
    threads: usize,

    /// Seconds without inbound bytes before a connection is closed
    #[arg(long, default_value = "30")]
    heartbeat_timeout: u64,

    /// Milliseconds between idle-connection sweeps
    #[arg(long, default_value = "1000")]
    sweep_interval: u64,

    /// Maximum concurrent connections
    #[arg(long, default_value = "10000")]
    max_connections: usize,

    /// Largest accepted frame body in bytes
    #[arg(long, default_value = "2097152")]
    max_frame_size: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("Switchboard server starting");

    let config = ServerConfig {
        bind_address: args.bind,
        worker_threads: args.threads,
        heartbeat_timeout: Duration::from_secs(args.heartbeat_timeout),
        sweep_interval: Duration::from_millis(args.sweep_interval),
        max_connections: args.max_connections,
        session: SessionConfig { max_frame_size: args.max_frame_size, ..SessionConfig::default() },
        ..ServerConfig::default()
    };

    let server = Server::bind(config)?;

    tracing::info!("Server listening on {}", server.local_addr());

    server.run()?;

    Ok(())
}
