//! Endpoint-keyed outbound connection pooling.
//!
//! # Data Flow
//! ```text
//! EndpointKey
//!     → EndpointPool::lookup (endpoint created on first use)
//!     → Endpoint::lease (idle, new connect, or FIFO wait)
//!     → ConnectionLookup (observer hooks around one request)
//!     → lease dropped: connection back to idle or to the next waiter
//! ```
//!
//! # Design Decisions
//! - Endpoints are reference counted while looked up, so the idle cleaner
//!   never removes an endpoint someone is about to lease from
//! - Pool errors are `Clone` so a failed connect can be reported to waiters

pub mod connector;
pub mod endpoint;
pub mod key;
pub mod lookup;

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::PoolOptions;

pub use connector::{Connector, TcpConnector};
pub use endpoint::{Endpoint, Lease};
pub use key::{EndpointKey, EndpointKeyBuilder, KeyError, ProxyOptions, ProxyType};
pub use lookup::{ConnectionLookup, EndpointObserver, NoopObserver, ObserverError, Phase, PhaseError, RequestToken};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("connect timed out")]
    Timeout,

    #[error("wait queue is full")]
    WaitQueueFull,

    #[error("endpoint closed")]
    Closed,
}

/// Keeps an endpoint registered while held.
pub struct EndpointRef<C: Send + 'static> {
    endpoint: Arc<Endpoint<C>>,
}

impl<C: Send + 'static> Deref for EndpointRef<C> {
    type Target = Arc<Endpoint<C>>;

    fn deref(&self) -> &Self::Target {
        &self.endpoint
    }
}

impl<C: Send + 'static> Drop for EndpointRef<C> {
    fn drop(&mut self) {
        self.endpoint.drop_ref();
    }
}

/// Pooled connections grouped by endpoint key.
pub struct EndpointPool<C: Send + 'static> {
    endpoints: DashMap<EndpointKey, Arc<Endpoint<C>>>,
    connector: Arc<dyn Connector<C>>,
    observer: Arc<dyn EndpointObserver>,
    options: PoolOptions,
}

impl<C: Send + 'static> EndpointPool<C> {
    pub fn new(options: PoolOptions, connector: Arc<dyn Connector<C>>) -> Self {
        Self {
            endpoints: DashMap::new(),
            connector,
            observer: Arc::new(NoopObserver),
            options,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn EndpointObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    /// Endpoint for `key`, created on first use.
    pub fn lookup(&self, key: &EndpointKey) -> EndpointRef<C> {
        let entry = self.endpoints.entry(key.clone()).or_insert_with(|| {
            tracing::debug!(endpoint = %key, "Creating endpoint");
            Arc::new(Endpoint::new(
                key.clone(),
                self.options.clone(),
                Arc::clone(&self.connector),
            ))
        });
        entry.retain_ref();
        EndpointRef {
            endpoint: Arc::clone(entry.value()),
        }
    }

    pub async fn lease(&self, key: &EndpointKey) -> Result<Lease<C>, PoolError> {
        let endpoint = self.lookup(key);
        endpoint.lease().await
    }

    /// Lease a connection wrapped for one observed request.
    pub async fn acquire(&self, key: &EndpointKey) -> Result<ConnectionLookup<C>, PoolError> {
        let lease = self.lease(key).await?;
        Ok(ConnectionLookup::new(lease, key.clone(), Arc::clone(&self.observer)))
    }

    /// Close and forget the endpoint for `key`.
    pub fn close(&self, key: &EndpointKey) -> bool {
        match self.endpoints.remove(key) {
            Some((_, endpoint)) => {
                endpoint.close();
                true
            }
            None => false,
        }
    }

    /// Close every endpoint.
    pub fn close_all(&self) {
        self.endpoints.retain(|_, endpoint| {
            endpoint.close();
            false
        });
    }

    /// Expire idle connections and drop endpoints nobody uses.
    /// Returns the number of endpoints removed.
    pub fn remove_idle(&self) -> usize {
        let before = self.endpoints.len();
        self.endpoints.retain(|_, endpoint| !endpoint.sweep());
        before.saturating_sub(self.endpoints.len())
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Run `remove_idle` every `period` until shutdown.
    pub fn spawn_cleaner(self: &Arc<Self>, period: Duration, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let pool = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        let Some(pool) = pool.upgrade() else { break };
                        let removed = pool.remove_idle();
                        if removed > 0 {
                            tracing::debug!(removed, remaining = pool.len(), "Pool cleaner removed endpoints");
                        }
                    }
                }
            }
            tracing::debug!("Pool cleaner stopped");
        })
    }
}
