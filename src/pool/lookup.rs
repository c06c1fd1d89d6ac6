//! Per-request view over a leased connection.
//!
//! # Phases
//! ```text
//! Leased → RequestBegun → RequestEnded → ResponseBegun → ResponseEnded
//! ```
//! Each transition runs at most once and only from the previous phase.
//! Aborting (or dropping) finalizes whatever phase was begun but not
//! finished and evicts the connection.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

use crate::pool::endpoint::Lease;
use crate::pool::key::EndpointKey;

/// Error reported by an observer hook. Logged, never propagated.
#[derive(Debug, Clone, Error)]
#[error("endpoint observer failed: {0}")]
pub struct ObserverError(pub String);

/// Identifies one request to the observer.
#[derive(Debug, Clone)]
pub struct RequestToken {
    pub id: Uuid,
    pub started: Instant,
    pub endpoint: String,
}

impl RequestToken {
    pub fn new(key: &EndpointKey) -> Self {
        Self {
            id: Uuid::new_v4(),
            started: Instant::now(),
            endpoint: key.to_string(),
        }
    }
}

/// Hooks around each request sent through a pooled connection.
pub trait EndpointObserver: Send + Sync + 'static {
    fn request_begin(&self, _token: &RequestToken) -> Result<(), ObserverError> {
        Ok(())
    }

    fn request_end(&self, _token: &RequestToken) -> Result<(), ObserverError> {
        Ok(())
    }

    fn response_begin(&self, _token: &RequestToken) -> Result<(), ObserverError> {
        Ok(())
    }

    fn response_end(&self, _token: &RequestToken) -> Result<(), ObserverError> {
        Ok(())
    }
}

/// Observer that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl EndpointObserver for NoopObserver {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Leased,
    RequestBegun,
    RequestEnded,
    ResponseBegun,
    ResponseEnded,
    Aborted,
}

/// A phase transition called out of order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot {attempted} in phase {current:?}")]
pub struct PhaseError {
    pub attempted: &'static str,
    pub current: Phase,
}

pub struct ConnectionLookup<C: Send + 'static> {
    lease: Option<Lease<C>>,
    key: EndpointKey,
    observer: Arc<dyn EndpointObserver>,
    token: RequestToken,
    phase: Phase,
}

impl<C: Send + 'static> ConnectionLookup<C> {
    pub fn new(lease: Lease<C>, key: EndpointKey, observer: Arc<dyn EndpointObserver>) -> Self {
        let token = RequestToken::new(&key);
        Self {
            lease: Some(lease),
            key,
            observer,
            token,
            phase: Phase::Leased,
        }
    }

    pub fn connection(&self) -> Option<&C> {
        self.lease.as_deref()
    }

    pub fn connection_mut(&mut self) -> Option<&mut C> {
        self.lease.as_deref_mut()
    }

    pub fn key(&self) -> &EndpointKey {
        &self.key
    }

    pub fn token(&self) -> &RequestToken {
        &self.token
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn begin_request(&mut self) -> Result<(), PhaseError> {
        self.advance("begin request", Phase::Leased, Phase::RequestBegun)?;
        self.notify("request_begin", |o, t| o.request_begin(t));
        Ok(())
    }

    pub fn end_request(&mut self) -> Result<(), PhaseError> {
        self.advance("end request", Phase::RequestBegun, Phase::RequestEnded)?;
        self.notify("request_end", |o, t| o.request_end(t));
        Ok(())
    }

    pub fn begin_response(&mut self) -> Result<(), PhaseError> {
        self.advance("begin response", Phase::RequestEnded, Phase::ResponseBegun)?;
        self.notify("response_begin", |o, t| o.response_begin(t));
        Ok(())
    }

    /// Finish the exchange; the connection goes back to its pool.
    pub fn end_response(&mut self) -> Result<(), PhaseError> {
        self.advance("end response", Phase::ResponseBegun, Phase::ResponseEnded)?;
        self.notify("response_end", |o, t| o.response_end(t));
        self.lease.take();
        Ok(())
    }

    /// Give up on the exchange: close begun phases and evict the connection.
    pub fn abort(&mut self) {
        match self.phase {
            Phase::RequestBegun => self.notify("request_end", |o, t| o.request_end(t)),
            Phase::ResponseBegun => self.notify("response_end", |o, t| o.response_end(t)),
            Phase::ResponseEnded | Phase::Aborted => return,
            Phase::Leased | Phase::RequestEnded => {}
        }
        self.phase = Phase::Aborted;
        if let Some(lease) = self.lease.take() {
            let endpoint = Arc::clone(lease.endpoint());
            endpoint.evict(lease);
        }
        tracing::debug!(request_id = %self.token.id, endpoint = %self.key, "Request aborted");
    }

    fn advance(&mut self, attempted: &'static str, from: Phase, to: Phase) -> Result<(), PhaseError> {
        if self.phase != from {
            return Err(PhaseError {
                attempted,
                current: self.phase,
            });
        }
        self.phase = to;
        Ok(())
    }

    fn notify(&self, hook: &'static str, call: impl FnOnce(&dyn EndpointObserver, &RequestToken) -> Result<(), ObserverError>) {
        if let Err(e) = call(self.observer.as_ref(), &self.token) {
            tracing::warn!(hook, request_id = %self.token.id, endpoint = %self.key, error = %e, "Endpoint observer failed");
        }
    }
}

impl<C: Send + 'static> Drop for ConnectionLookup<C> {
    fn drop(&mut self) {
        if self.phase != Phase::Leased {
            self.abort();
        }
    }
}

impl<C: Send + 'static> fmt::Debug for ConnectionLookup<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLookup")
            .field("endpoint", &self.key.to_string())
            .field("request_id", &self.token.id)
            .field("phase", &self.phase)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolOptions;
    use crate::net::address::{HostAndPort, SocketAddress};
    use crate::pool::connector::Connector;
    use crate::pool::endpoint::Endpoint;
    use crate::pool::PoolError;
    use futures_util::future::BoxFuture;
    use parking_lot::Mutex;

    struct One;

    impl Connector<u8> for One {
        fn connect(&self, _key: &EndpointKey) -> BoxFuture<'static, Result<u8, PoolError>> {
            Box::pin(async { Ok(1) })
        }
    }

    #[derive(Default)]
    struct Recording {
        calls: Mutex<Vec<&'static str>>,
        fail_begin: bool,
    }

    impl EndpointObserver for Recording {
        fn request_begin(&self, _token: &RequestToken) -> Result<(), ObserverError> {
            self.calls.lock().push("request_begin");
            if self.fail_begin {
                return Err(ObserverError("boom".into()));
            }
            Ok(())
        }

        fn request_end(&self, _token: &RequestToken) -> Result<(), ObserverError> {
            self.calls.lock().push("request_end");
            Ok(())
        }

        fn response_begin(&self, _token: &RequestToken) -> Result<(), ObserverError> {
            self.calls.lock().push("response_begin");
            Ok(())
        }

        fn response_end(&self, _token: &RequestToken) -> Result<(), ObserverError> {
            self.calls.lock().push("response_end");
            Ok(())
        }
    }

    async fn lookup(observer: Arc<Recording>) -> (Arc<Endpoint<u8>>, ConnectionLookup<u8>) {
        let key = EndpointKey::new(false, SocketAddress::inet("h", 1), HostAndPort::host_only("h"), None);
        let endpoint = Arc::new(Endpoint::new(key.clone(), PoolOptions::default(), Arc::new(One)));
        let lease = endpoint.lease().await.unwrap();
        (endpoint, ConnectionLookup::new(lease, key, observer))
    }

    #[tokio::test]
    async fn full_exchange_returns_connection() {
        let observer = Arc::new(Recording::default());
        let (endpoint, mut lookup) = lookup(Arc::clone(&observer)).await;
        assert_eq!(lookup.connection(), Some(&1));

        lookup.begin_request().unwrap();
        lookup.end_request().unwrap();
        lookup.begin_response().unwrap();
        lookup.end_response().unwrap();
        assert_eq!(
            *observer.calls.lock(),
            vec!["request_begin", "request_end", "response_begin", "response_end"]
        );
        assert_eq!(endpoint.idle_count(), 1);

        drop(lookup);
        assert_eq!(observer.calls.lock().len(), 4);
    }

    #[tokio::test]
    async fn out_of_order_transitions_are_rejected() {
        let observer = Arc::new(Recording::default());
        let (_endpoint, mut lookup) = lookup(Arc::clone(&observer)).await;
        let err = lookup.end_request().unwrap_err();
        assert_eq!(err.current, Phase::Leased);

        lookup.begin_request().unwrap();
        assert!(lookup.begin_request().is_err());
        assert!(lookup.begin_response().is_err());
        assert_eq!(*observer.calls.lock(), vec!["request_begin"]);
    }

    #[tokio::test]
    async fn abort_finalizes_begun_phase_and_evicts() {
        let observer = Arc::new(Recording::default());
        let (endpoint, mut lookup) = lookup(Arc::clone(&observer)).await;
        lookup.begin_request().unwrap();
        lookup.abort();
        lookup.abort();
        assert_eq!(*observer.calls.lock(), vec!["request_begin", "request_end"]);
        assert_eq!(lookup.phase(), Phase::Aborted);
        assert_eq!(endpoint.idle_count(), 0);
        assert_eq!(endpoint.leased_count(), 0);
    }

    #[tokio::test]
    async fn drop_mid_response_finalizes() {
        let observer = Arc::new(Recording::default());
        let (_endpoint, mut lookup) = lookup(Arc::clone(&observer)).await;
        lookup.begin_request().unwrap();
        lookup.end_request().unwrap();
        lookup.begin_response().unwrap();
        drop(lookup);
        assert_eq!(observer.calls.lock().last(), Some(&"response_end"));
    }

    #[tokio::test]
    async fn observer_failure_is_not_propagated() {
        let observer = Arc::new(Recording {
            fail_begin: true,
            ..Default::default()
        });
        let (_endpoint, mut lookup) = lookup(Arc::clone(&observer)).await;
        assert!(lookup.begin_request().is_ok());
        assert_eq!(lookup.phase(), Phase::RequestBegun);
    }
}
