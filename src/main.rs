//! portshare binary.
//!
//! Binds every configured listener with its configured number of logical
//! handles on one shared registry, serves until SIGINT/SIGTERM, then closes
//! every handle. TLS options and certificates are reloaded when the config
//! file or a referenced PEM file changes.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use portshare::config::{load_config, ConfigWatcher, PortshareConfig};
use portshare::lifecycle::{apply_tls_updates, shutdown_signal, start_listeners, Shutdown};
use portshare::net::ServerRegistry;
use portshare::observability::{logging, metrics};

#[derive(Debug, Parser)]
#[command(name = "portshare", version, about = "Shared server sockets with hot TLS reload")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "PORTSHARE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level, overriding the configured one (RUST_LOG wins over both).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => PortshareConfig::default(),
    };

    let level = cli.log_level.as_deref().unwrap_or(&config.observability.log_level);
    logging::init(level);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "portshare starting");
    tracing::info!(
        listeners = config.listeners.len(),
        max_pool_size = config.client.max_pool_size,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr)?,
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let registry = Arc::new(ServerRegistry::new());
    let shutdown = Shutdown::new();
    let listeners = start_listeners(&config, &registry, &shutdown).await?;
    if listeners.is_empty() {
        tracing::warn!("No listeners configured");
    }

    let (_watcher, mut updates) = match &cli.config {
        Some(path) => {
            let (watcher, updates) = ConfigWatcher::new(path, &config);
            match watcher.run() {
                Ok(watcher) => (Some(watcher), Some(updates)),
                Err(e) => {
                    tracing::warn!(error = %e, "Config watcher unavailable, hot reload disabled");
                    (None, None)
                }
            }
        }
        None => (None, None),
    };

    let signal = shutdown_signal();
    tokio::pin!(signal);
    loop {
        tokio::select! {
            _ = &mut signal => break,
            Some(next) = async {
                match updates.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                let updated = apply_tls_updates(&listeners, &next).await;
                tracing::info!(updated, "Config reload applied");
            }
        }
    }

    tracing::info!(handles = shutdown.hook_count(), "Shutting down");
    shutdown.close_all().await;
    tracing::info!("Shutdown complete");
    Ok(())
}
