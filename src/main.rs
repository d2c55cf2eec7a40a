//! Network Protector
//!
//! Inbound access control in front of an Axum application.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request
//!     ──────────────▶ request id ─▶ trace ─▶ timeout ─▶ protection gate ─┬─▶ admin routes
//!                                                          │              └─▶ application
//!                                                          ▼
//!                                   access ─▶ rate ─▶ threat ─▶ auth
//!                                     │                 │
//!                                     ▼                 ▼
//!                               access registry ◀── auto-block
//!                                     │
//!                                     ▼
//!                          persistence queue ─▶ writer thread ─▶ document store
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;

use network_protector::config::watcher::ConfigWatcher;
use network_protector::config::{load_config, ProtectorConfig};
use network_protector::observability::{logging, metrics};
use network_protector::{bootstrap, HttpServer, Protector, Shutdown};

#[derive(Parser)]
#[command(name = "network-protector", version, about = "Inbound request access control")]
struct Args {
    /// Path to the TOML configuration; defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Reload static lists and patterns when the file changes.
    #[arg(long, requires = "config")]
    watch: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => ProtectorConfig::default(),
    };

    logging::init(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "network-protector starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    // hydration completes before the listener exists
    let Protector { gate, worker } = bootstrap(&config).await?;

    let listener = TcpListener::bind(&config.bind_identity).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Shutdown::new();
    shutdown.trigger_on_signal();

    let (_watcher, updates) = match (&args.config, args.watch) {
        (Some(path), true) => {
            let (watcher, updates) = ConfigWatcher::new(path);
            (Some(watcher.run()?), Some(updates))
        }
        _ => (None, None),
    };

    let server = HttpServer::new(config, gate);
    server.run(listener, updates, shutdown.subscribe()).await?;

    if let Some(worker) = worker {
        tracing::info!("Flushing persistence queue");
        tokio::task::spawn_blocking(move || worker.join()).await?;
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
