//! One pooled destination.
//!
//! # Responsibilities
//! - Hand out leases on idle or freshly connected connections
//! - Queue lease requests FIFO once `max_pool_size` is reached
//! - Expire idle connections after `keep_alive_timeout`
//!
//! # Capacity
//! ```text
//! leased + connecting + idle <= max_pool_size
//! ```
//!
//! # Design Decisions
//! - Connects run in their own task and deliver through a oneshot; a
//!   connection nobody is waiting for anymore goes back to the pool
//! - A released connection goes straight to the oldest live waiter

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::config::PoolOptions;
use crate::observability::metrics;
use crate::pool::connector::Connector;
use crate::pool::key::EndpointKey;
use crate::pool::PoolError;

type Delivery<C> = oneshot::Sender<Result<C, PoolError>>;

struct Idle<C> {
    conn: C,
    since: Instant,
}

struct EndpointState<C> {
    idle: VecDeque<Idle<C>>,
    leased: usize,
    connecting: usize,
    waiters: VecDeque<Delivery<C>>,
    closed: bool,
}

impl<C> EndpointState<C> {
    fn total(&self) -> usize {
        self.leased + self.connecting + self.idle.len()
    }
}

enum Next<C> {
    Ready(C),
    Connect(oneshot::Receiver<Result<C, PoolError>>, Delivery<C>),
    Wait(oneshot::Receiver<Result<C, PoolError>>),
}

/// Connections to one endpoint key.
pub struct Endpoint<C: Send + 'static> {
    key: EndpointKey,
    options: PoolOptions,
    connector: Arc<dyn Connector<C>>,
    state: Mutex<EndpointState<C>>,
    refs: AtomicUsize,
}

impl<C: Send + 'static> Endpoint<C> {
    pub fn new(key: EndpointKey, options: PoolOptions, connector: Arc<dyn Connector<C>>) -> Self {
        Self {
            key,
            options,
            connector,
            state: Mutex::new(EndpointState {
                idle: VecDeque::new(),
                leased: 0,
                connecting: 0,
                waiters: VecDeque::new(),
                closed: false,
            }),
            refs: AtomicUsize::new(0),
        }
    }

    pub fn key(&self) -> &EndpointKey {
        &self.key
    }

    /// Lease a connection, connecting or queueing as needed.
    pub async fn lease(self: &Arc<Self>) -> Result<Lease<C>, PoolError> {
        let next = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(PoolError::Closed);
            }
            self.expire_locked(&mut state);

            if let Some(idle) = state.idle.pop_back() {
                state.leased += 1;
                Next::Ready(idle.conn)
            } else if state.total() < self.options.max_pool_size {
                state.connecting += 1;
                let (tx, rx) = oneshot::channel();
                Next::Connect(rx, tx)
            } else {
                state.waiters.retain(|w| !w.is_closed());
                if self
                    .options
                    .max_wait_queue_size
                    .is_some_and(|max| state.waiters.len() >= max)
                {
                    return Err(PoolError::WaitQueueFull);
                }
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Next::Wait(rx)
            }
        };

        let conn = match next {
            Next::Ready(conn) => conn,
            Next::Connect(rx, tx) => {
                self.spawn_connect(tx);
                rx.await.map_err(|_| PoolError::Closed)??
            }
            Next::Wait(rx) => {
                tracing::trace!(endpoint = %self.key, "Waiting for a pooled connection");
                rx.await.map_err(|_| PoolError::Closed)??
            }
        };

        Ok(Lease {
            conn: Some(conn),
            endpoint: Arc::clone(self),
        })
    }

    /// Return a connection to the pool.
    pub fn release(&self, lease: Lease<C>) {
        drop(lease);
    }

    /// Close the leased connection instead of pooling it.
    pub fn evict(&self, mut lease: Lease<C>) {
        if lease.conn.take().is_some() {
            lease.endpoint.discard();
        }
    }

    /// Refuse further leases and drop idle connections. Leased connections
    /// are closed when released.
    pub fn close(&self) {
        let waiters = {
            let mut state = self.state.lock();
            state.closed = true;
            state.idle.clear();
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(Err(PoolError::Closed));
        }
        tracing::debug!(endpoint = %self.key, "Endpoint closed");
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    pub fn leased_count(&self) -> usize {
        self.state.lock().leased
    }

    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.iter().filter(|w| !w.is_closed()).count()
    }

    /// Expire idle connections and tell whether nothing else uses the endpoint.
    pub(crate) fn sweep(&self) -> bool {
        let mut state = self.state.lock();
        self.expire_locked(&mut state);
        state.waiters.retain(|w| !w.is_closed());
        state.total() == 0 && state.waiters.is_empty() && self.refs.load(Ordering::SeqCst) == 0
    }

    pub(crate) fn retain_ref(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn drop_ref(&self) {
        self.refs.fetch_sub(1, Ordering::SeqCst);
    }

    fn expire_locked(&self, state: &mut EndpointState<C>) {
        let keep_alive = self.options.keep_alive_timeout();
        let before = state.idle.len();
        state.idle.retain(|idle| idle.since.elapsed() < keep_alive);
        let expired = before - state.idle.len();
        if expired > 0 {
            metrics::record_pool_expired(&self.key.to_string(), expired);
            tracing::debug!(endpoint = %self.key, expired, "Expired idle connections");
        }
    }

    fn spawn_connect(self: &Arc<Self>, delivery: Delivery<C>) {
        let endpoint = Arc::clone(self);
        tokio::spawn(async move {
            let connect = endpoint.connector.connect(&endpoint.key);
            let result = match tokio::time::timeout(endpoint.options.connect_timeout(), connect).await {
                Ok(result) => result,
                Err(_) => Err(PoolError::Timeout),
            };
            endpoint.connected(result, delivery);
        });
    }

    fn connected(self: &Arc<Self>, result: Result<C, PoolError>, delivery: Delivery<C>) {
        let label = self.key.to_string();
        let mut state = self.state.lock();
        state.connecting -= 1;
        match result {
            Ok(conn) => {
                metrics::record_pool_connect(&label, true);
                state.leased += 1;
                if let Err(Ok(conn)) = delivery.send(Ok(conn)) {
                    state.leased -= 1;
                    self.recycle_locked(&mut state, conn);
                }
            }
            Err(e) => {
                metrics::record_pool_connect(&label, false);
                tracing::warn!(endpoint = %self.key, error = %e, "Connect failed");
                let _ = delivery.send(Err(e));
                self.serve_waiters_locked(&mut state);
            }
        }
    }

    /// A leased connection came back.
    fn put_back(self: &Arc<Self>, conn: C) {
        let mut state = self.state.lock();
        state.leased -= 1;
        self.recycle_locked(&mut state, conn);
    }

    /// A leased connection is gone for good; its slot is free.
    fn discard(self: &Arc<Self>) {
        let mut state = self.state.lock();
        state.leased -= 1;
        self.serve_waiters_locked(&mut state);
    }

    fn recycle_locked(self: &Arc<Self>, state: &mut EndpointState<C>, mut conn: C) {
        if state.closed {
            return;
        }
        while let Some(waiter) = state.waiters.pop_front() {
            state.leased += 1;
            match waiter.send(Ok(conn)) {
                Ok(()) => return,
                Err(Ok(back)) => {
                    state.leased -= 1;
                    conn = back;
                }
                Err(Err(_)) => {
                    state.leased -= 1;
                    return;
                }
            }
        }
        state.idle.push_back(Idle {
            conn,
            since: Instant::now(),
        });
    }

    fn serve_waiters_locked(self: &Arc<Self>, state: &mut EndpointState<C>) {
        if state.closed {
            return;
        }
        while state.total() < self.options.max_pool_size {
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };
            if waiter.is_closed() {
                continue;
            }
            state.connecting += 1;
            self.spawn_connect(waiter);
        }
    }
}

impl<C: Send + 'static> fmt::Debug for Endpoint<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Endpoint")
            .field("key", &self.key.to_string())
            .field("idle", &state.idle.len())
            .field("leased", &state.leased)
            .field("connecting", &state.connecting)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

/// A connection borrowed from an endpoint. Returns to the pool on drop.
pub struct Lease<C: Send + 'static> {
    conn: Option<C>,
    endpoint: Arc<Endpoint<C>>,
}

impl<C: Send + 'static> Lease<C> {
    pub fn endpoint(&self) -> &Arc<Endpoint<C>> {
        &self.endpoint
    }

    /// Take the connection out of the pool for good.
    pub fn detach(mut self) -> Option<C> {
        let conn = self.conn.take();
        if conn.is_some() {
            self.endpoint.discard();
        }
        conn
    }
}

impl<C: Send + 'static> Deref for Lease<C> {
    type Target = C;

    fn deref(&self) -> &Self::Target {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("lease accessed after its connection was taken"),
        }
    }
}

impl<C: Send + 'static> DerefMut for Lease<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("lease accessed after its connection was taken"),
        }
    }
}

impl<C: Send + 'static> Drop for Lease<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.endpoint.put_back(conn);
        }
    }
}

impl<C: Send + 'static> fmt::Debug for Lease<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("endpoint", &self.endpoint.key().to_string())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::address::{HostAndPort, SocketAddress};
    use futures_util::future::BoxFuture;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    /// Hands out increasing ids; fails while `fail` is set.
    struct Counter {
        next: AtomicU32,
        fail: std::sync::atomic::AtomicBool,
        delay: Duration,
    }

    impl Counter {
        fn new() -> Arc<Self> {
            Self::with_delay(Duration::ZERO)
        }

        fn with_delay(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                next: AtomicU32::new(1),
                fail: std::sync::atomic::AtomicBool::new(false),
                delay,
            })
        }
    }

    impl Connector<u32> for Counter {
        fn connect(&self, _key: &EndpointKey) -> BoxFuture<'static, Result<u32, PoolError>> {
            let id = self.next.fetch_add(1, Ordering::SeqCst);
            let fail = self.fail.load(Ordering::SeqCst);
            let delay = self.delay;
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                if fail {
                    Err(PoolError::Connect("refused".into()))
                } else {
                    Ok(id)
                }
            })
        }
    }

    fn endpoint(max: usize, queue: Option<usize>, connector: Arc<Counter>) -> Arc<Endpoint<u32>> {
        let key = EndpointKey::new(
            false,
            SocketAddress::inet("127.0.0.1", 80),
            HostAndPort::host_only("localhost"),
            None,
        );
        let options = PoolOptions {
            max_pool_size: max,
            max_wait_queue_size: queue,
            ..Default::default()
        };
        Arc::new(Endpoint::new(key, options, connector))
    }

    #[tokio::test]
    async fn released_connection_is_reused() {
        let ep = endpoint(2, None, Counter::new());
        let lease = ep.lease().await.unwrap();
        assert_eq!(*lease, 1);
        ep.release(lease);
        assert_eq!(ep.idle_count(), 1);

        let again = ep.lease().await.unwrap();
        assert_eq!(*again, 1);
        assert_eq!(ep.leased_count(), 1);
    }

    #[tokio::test]
    async fn waiters_are_served_fifo() {
        let ep = endpoint(1, None, Counter::new());
        let held = ep.lease().await.unwrap();

        let first = tokio::spawn({
            let ep = Arc::clone(&ep);
            async move { *ep.lease().await.unwrap() }
        });
        while ep.waiter_count() < 1 {
            tokio::task::yield_now().await;
        }
        let second = tokio::spawn({
            let ep = Arc::clone(&ep);
            async move {
                let lease = ep.lease().await.unwrap();
                *lease + 100
            }
        });
        while ep.waiter_count() < 2 {
            tokio::task::yield_now().await;
        }

        drop(held);
        assert_eq!(first.await.unwrap(), 1);
        assert_eq!(second.await.unwrap(), 101);
    }

    #[tokio::test]
    async fn full_wait_queue_is_rejected() {
        let ep = endpoint(1, Some(1), Counter::new());
        let _held = ep.lease().await.unwrap();
        let waiter = tokio::spawn({
            let ep = Arc::clone(&ep);
            async move { ep.lease().await.map(|l| *l) }
        });
        while ep.waiter_count() < 1 {
            tokio::task::yield_now().await;
        }
        assert_eq!(ep.lease().await.unwrap_err(), PoolError::WaitQueueFull);
        waiter.abort();
    }

    #[tokio::test]
    async fn connect_failure_frees_capacity() {
        let connector = Counter::new();
        let ep = endpoint(1, None, Arc::clone(&connector));
        connector.fail.store(true, Ordering::SeqCst);
        assert!(matches!(ep.lease().await.unwrap_err(), PoolError::Connect(_)));

        connector.fail.store(false, Ordering::SeqCst);
        assert_eq!(*ep.lease().await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_connect_times_out() {
        let ep = endpoint(1, None, Counter::with_delay(Duration::from_secs(120)));
        assert_eq!(ep.lease().await.unwrap_err(), PoolError::Timeout);
        assert_eq!(ep.leased_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connections_expire() {
        let ep = endpoint(2, None, Counter::new());
        drop(ep.lease().await.unwrap());
        assert_eq!(ep.idle_count(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(ep.sweep());
        assert_eq!(ep.idle_count(), 0);
        assert_eq!(*ep.lease().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn evict_and_detach_free_the_slot() {
        let ep = endpoint(1, None, Counter::new());
        let lease = ep.lease().await.unwrap();
        ep.evict(lease);
        assert_eq!(ep.leased_count(), 0);
        assert_eq!(ep.idle_count(), 0);

        let lease = ep.lease().await.unwrap();
        assert_eq!(lease.detach(), Some(2));
        assert_eq!(*ep.lease().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn abandoned_connect_returns_to_pool() {
        let ep = endpoint(1, None, Counter::with_delay(Duration::from_millis(20)));
        let abandoned = tokio::time::timeout(Duration::from_millis(1), ep.lease()).await;
        assert!(abandoned.is_err());

        let lease = ep.lease().await.unwrap();
        assert_eq!(*lease, 1);
    }

    #[tokio::test]
    async fn closed_endpoint_refuses_and_fails_waiters() {
        let ep = endpoint(1, None, Counter::new());
        let held = ep.lease().await.unwrap();
        let waiter = tokio::spawn({
            let ep = Arc::clone(&ep);
            async move { ep.lease().await.map(|l| *l) }
        });
        while ep.waiter_count() < 1 {
            tokio::task::yield_now().await;
        }
        ep.close();
        assert_eq!(waiter.await.unwrap(), Err(PoolError::Closed));
        assert_eq!(ep.lease().await.unwrap_err(), PoolError::Closed);
        drop(held);
        assert_eq!(ep.idle_count(), 0);
    }
}
