//! matchdb - A Sharded, Replicated In-Memory Key-Value Store
//!
//! Main entry point: parses the configuration, binds the store port, starts
//! the cluster coordinator and serves connections until Ctrl+C.

use anyhow::Context;
use matchdb::config::Config;
use matchdb::server::Server;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn print_banner(config: &Config) {
    println!(
        r#"
matchdb v{} - Sharded In-Memory Key-Value Store
──────────────────────────────────────────────────────────────
Store port:   {}
Alloc limit:  {} KB
Mode:         {}

Use Ctrl+C to shutdown gracefully.
"#,
        matchdb::VERSION,
        config.bind_addr(),
        config.alloc_limit_bytes / 1024,
        if config.is_distributed() {
            "distributed"
        } else {
            "single node"
        }
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = Config::load().context("invalid configuration")?;
    print_banner(&config);

    let server = Server::bind(&config)
        .await
        .context("failed to start node")?;
    let db = Arc::clone(server.db());
    let stats = Arc::clone(server.stats());
    info!(node = %server.node_id(), "Node identity assigned");

    let shutdown = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received, stopping node..."),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl+C"),
        }
    };

    let result = tokio::select! {
        result = server.run() => result.context("listener failed"),
        _ = shutdown => Ok(()),
    };

    let storage = db.stats();
    info!(
        connections = stats.connections_accepted.load(Ordering::Relaxed),
        handshake_failures = stats.handshake_failures.load(Ordering::Relaxed),
        commands = stats.commands_processed.load(Ordering::Relaxed),
        bytes_read = stats.bytes_read.load(Ordering::Relaxed),
        bytes_written = stats.bytes_written.load(Ordering::Relaxed),
        entries = storage.entries,
        alloc_used = storage.alloc_used,
        rejected_writes = storage.rejected_writes,
        "Node shutdown complete"
    );

    result
}
