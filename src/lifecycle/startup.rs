//! Startup orchestration.
//!
//! # Responsibilities
//! - Bind every configured listener with its configured number of handles
//! - Pick the protocol handler per listener (HTTP router or TCP echo)
//! - Register every bound handle as a close hook
//! - Apply reloaded TLS options to running listeners
//!
//! # Design Decisions
//! - Fail fast: any bind error closes what was already bound and is fatal
//! - The handles of one listener bind concurrently and share one socket
//! - Listeners start last (traffic only when ready)

use std::sync::Arc;

use futures_util::future::join_all;
use thiserror::Error;

use crate::config::{ListenerConfig, PortshareConfig, Protocol};
use crate::http::{status_router, HttpHandler};
use crate::lifecycle::shutdown::Shutdown;
use crate::net::{LocalAddress, ServerError, ServerRegistry, StreamHandler, TcpServer};

#[derive(Debug, Error)]
#[error("listener '{listener}' failed to start: {source}")]
pub struct StartupError {
    pub listener: String,
    #[source]
    pub source: ServerError,
}

/// The handles bound for one configured listener.
#[derive(Debug)]
pub struct BoundListener {
    pub name: String,
    pub address: LocalAddress,
    pub handles: Vec<TcpServer>,
}

impl BoundListener {
    pub async fn close(&self) {
        join_all(self.handles.iter().map(TcpServer::close)).await;
    }
}

fn build_handle(registry: &Arc<ServerRegistry>, listener: &ListenerConfig, shutdown: &Shutdown) -> TcpServer {
    let builder = match listener.protocol {
        Protocol::Http => TcpServer::builder(Arc::clone(registry), HttpHandler::new(status_router(&listener.name))),
        Protocol::Tcp => TcpServer::builder(Arc::clone(registry), StreamHandler::echo()),
    };
    builder
        .options(listener.options.clone())
        .shutdown(shutdown.clone())
        .build()
}

/// Bind `listener.instances` handles on the listener's address.
pub async fn start_listener(
    registry: &Arc<ServerRegistry>,
    listener: &ListenerConfig,
    shutdown: &Shutdown,
) -> Result<BoundListener, StartupError> {
    let handles: Vec<TcpServer> = (0..listener.instances.max(1))
        .map(|_| build_handle(registry, listener, shutdown))
        .collect();

    let results = join_all(handles.iter().map(|h| h.bind(&listener.address))).await;
    let mut address = None;
    let mut failure = None;
    for result in results {
        match result {
            Ok(bound) => {
                address.get_or_insert(bound);
            }
            Err(e) => {
                failure.get_or_insert(e);
            }
        }
    }

    match (address, failure) {
        (Some(address), None) => {
            tracing::info!(
                listener = %listener.name,
                address = %address,
                protocol = ?listener.protocol,
                instances = handles.len(),
                ssl = listener.options.ssl,
                "Listener started"
            );
            Ok(BoundListener {
                name: listener.name.clone(),
                address,
                handles,
            })
        }
        (_, failure) => {
            join_all(handles.iter().map(TcpServer::close)).await;
            Err(StartupError {
                listener: listener.name.clone(),
                source: failure.unwrap_or(ServerError::NotListening),
            })
        }
    }
}

/// Bind every configured listener, in order.
pub async fn start_listeners(
    config: &PortshareConfig,
    registry: &Arc<ServerRegistry>,
    shutdown: &Shutdown,
) -> Result<Vec<BoundListener>, StartupError> {
    let mut bound = Vec::with_capacity(config.listeners.len());
    for listener in &config.listeners {
        match start_listener(registry, listener, shutdown).await {
            Ok(started) => bound.push(started),
            Err(e) => {
                tracing::error!(error = %e, "Startup failed, closing started listeners");
                join_all(bound.iter().map(BoundListener::close)).await;
                return Err(e);
            }
        }
    }
    Ok(bound)
}

/// Push the TLS options of `config` to the matching running listeners.
///
/// Every TLS listener is updated, even with identical options, because the
/// referenced PEM files may have changed. Returns the number of listeners
/// updated; failures keep the previous TLS context.
pub async fn apply_tls_updates(bound: &[BoundListener], config: &PortshareConfig) -> usize {
    let mut updated = 0;
    for listener in bound {
        let Some(next) = config.listener(&listener.name) else {
            tracing::warn!(listener = %listener.name, "Listener missing from reloaded config, restart required");
            continue;
        };
        if !next.options.ssl {
            continue;
        }
        let Some(handle) = listener.handles.first() else {
            continue;
        };
        match handle.update_tls_options(next.options.tls.clone()).await {
            Ok(()) => updated += 1,
            Err(e) => {
                tracing::error!(listener = %listener.name, error = %e, "TLS update failed, keeping current context");
            }
        }
    }
    updated
}
