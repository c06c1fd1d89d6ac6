//! Accept-side channel balancer.
//!
//! # Responsibilities
//! - Hold the workers attached to one physical listener
//! - Pick the worker that receives each accepted connection
//! - Spawn the connection onto the chosen worker's event loop
//!
//! # Selection
//! ```text
//! origin loop has workers?  → round-robin among that loop's workers
//! otherwise                 → round-robin over loops, then within the loop
//! ```
//!
//! The shared accept loop dispatches with no origin. An origin is only
//! given by callers that accept on a worker's own loop.
//!
//! # Design Decisions
//! - Writers serialize on a mutex and publish an immutable snapshot
//! - Dispatch only loads the snapshot (no lock on the accept path)
//! - Per-loop cursors survive snapshot rebuilds so rotation stays fair

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;

use crate::load_balancer::round_robin::RoundRobin;
use crate::net::connection::RawConnection;
use crate::net::event_loop::{EventLoop, LoopId};

static WORKER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// A per-event-loop acceptor.
pub trait Worker: Send + Sync + 'static {
    /// Take ownership of an accepted connection. The returned future runs on
    /// the worker's event loop.
    fn accept(&self, conn: RawConnection) -> BoxFuture<'static, ()>;
}

/// Handle returned by `add_worker`, used to remove the worker again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(u64);

impl WorkerId {
    fn next() -> Self {
        Self(WORKER_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

#[derive(Clone)]
struct WorkerEntry {
    id: WorkerId,
    worker: Arc<dyn Worker>,
}

#[derive(Clone)]
struct LoopGroup {
    event_loop: EventLoop,
    workers: Vec<WorkerEntry>,
    cursor: Arc<RoundRobin>,
}

/// The worker chosen for one connection.
#[derive(Clone)]
pub struct Selected {
    pub id: WorkerId,
    pub event_loop: EventLoop,
    pub worker: Arc<dyn Worker>,
}

/// Distributes accepted connections across registered workers.
pub struct ChannelBalancer {
    snapshot: ArcSwap<Vec<Arc<LoopGroup>>>,
    loops: RoundRobin,
    writer: Mutex<()>,
    closed: AtomicBool,
}

impl ChannelBalancer {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Vec::new()),
            loops: RoundRobin::new(),
            writer: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Register a worker bound to `event_loop`.
    pub fn add_worker(&self, event_loop: &EventLoop, worker: Arc<dyn Worker>) -> WorkerId {
        let _writer = self.writer.lock();
        let id = WorkerId::next();
        let entry = WorkerEntry { id, worker };

        let mut groups: Vec<Arc<LoopGroup>> = self.snapshot.load().iter().cloned().collect();
        match groups.iter().position(|g| g.event_loop.id() == event_loop.id()) {
            Some(i) => {
                let mut group = LoopGroup::clone(&groups[i]);
                group.workers.push(entry);
                groups[i] = Arc::new(group);
            }
            None => groups.push(Arc::new(LoopGroup {
                event_loop: event_loop.clone(),
                workers: vec![entry],
                cursor: Arc::new(RoundRobin::new()),
            })),
        }
        self.snapshot.store(Arc::new(groups));

        tracing::debug!(worker_id = %id, event_loop = %event_loop.id(), "Worker added");
        id
    }

    /// Unregister a worker. Removing an unknown worker is a no-op.
    pub fn remove_worker(&self, loop_id: LoopId, id: WorkerId) -> bool {
        let _writer = self.writer.lock();
        let current = self.snapshot.load();
        let Some(i) = current.iter().position(|g| g.event_loop.id() == loop_id) else {
            return false;
        };
        if !current[i].workers.iter().any(|w| w.id == id) {
            return false;
        }

        let mut groups: Vec<Arc<LoopGroup>> = current.iter().cloned().collect();
        let mut group = LoopGroup::clone(&groups[i]);
        group.workers.retain(|w| w.id != id);
        if group.workers.is_empty() {
            groups.remove(i);
        } else {
            groups[i] = Arc::new(group);
        }
        self.snapshot.store(Arc::new(groups));

        tracing::debug!(worker_id = %id, event_loop = %loop_id, "Worker removed");
        true
    }

    pub fn has_workers(&self) -> bool {
        !self.snapshot.load().is_empty()
    }

    pub fn worker_count(&self) -> usize {
        self.snapshot.load().iter().map(|g| g.workers.len()).sum()
    }

    /// Choose the worker for a connection that arrived on `origin`.
    pub fn select(&self, origin: Option<LoopId>) -> Option<Selected> {
        let groups = self.snapshot.load();
        let group = origin
            .and_then(|o| groups.iter().find(|g| g.event_loop.id() == o))
            .or_else(|| self.loops.pick(groups.as_slice()))?;
        let entry = group.cursor.pick(&group.workers)?;
        Some(Selected {
            id: entry.id,
            event_loop: group.event_loop.clone(),
            worker: Arc::clone(&entry.worker),
        })
    }

    /// Hand `conn` to a worker, or give it back when there is none.
    pub fn dispatch(&self, conn: RawConnection, origin: Option<LoopId>) -> Result<(), RawConnection> {
        if self.closed.load(Ordering::Acquire) {
            return Err(conn);
        }
        let Some(selected) = self.select(origin) else {
            return Err(conn);
        };
        tracing::trace!(
            connection_id = %conn.id(),
            worker_id = %selected.id,
            event_loop = %selected.event_loop.id(),
            "Dispatching connection"
        );
        selected.event_loop.spawn(selected.worker.accept(conn));
        Ok(())
    }

    /// Drop every worker and refuse further dispatch.
    pub fn close(&self) {
        let _writer = self.writer.lock();
        self.closed.store(true, Ordering::Release);
        self.snapshot.store(Arc::new(Vec::new()));
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for ChannelBalancer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::address::SocketAddress;
    use tokio::sync::mpsc;

    struct Recording {
        name: &'static str,
        tx: mpsc::UnboundedSender<&'static str>,
    }

    impl Worker for Recording {
        fn accept(&self, _conn: RawConnection) -> BoxFuture<'static, ()> {
            let tx = self.tx.clone();
            let name = self.name;
            Box::pin(async move {
                let _ = tx.send(name);
            })
        }
    }

    fn recording(name: &'static str, tx: &mpsc::UnboundedSender<&'static str>) -> Arc<dyn Worker> {
        Arc::new(Recording { name, tx: tx.clone() })
    }

    fn conn() -> RawConnection {
        let (stream, _peer) = tokio::io::duplex(16);
        RawConnection::new(stream, SocketAddress::inet("127.0.0.1", 1))
    }

    #[tokio::test]
    async fn round_robins_across_loops() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let balancer = ChannelBalancer::new();
        let a = EventLoop::try_current().unwrap();
        let b = EventLoop::try_current().unwrap();
        balancer.add_worker(&a, recording("a", &tx));
        balancer.add_worker(&b, recording("b", &tx));

        for _ in 0..4 {
            balancer.dispatch(conn(), None).unwrap();
        }
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(rx.recv().await.unwrap());
        }
        seen.sort();
        assert_eq!(seen, vec!["a", "a", "b", "b"]);
    }

    #[tokio::test]
    async fn prefers_workers_on_origin_loop() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let balancer = ChannelBalancer::new();
        let a = EventLoop::try_current().unwrap();
        let b = EventLoop::try_current().unwrap();
        let a1 = balancer.add_worker(&a, recording("a1", &tx));
        let a2 = balancer.add_worker(&a, recording("a2", &tx));
        let b1 = balancer.add_worker(&b, recording("b1", &tx));

        let picks: Vec<WorkerId> = (0..4).map(|_| balancer.select(Some(a.id())).unwrap().id).collect();
        assert_eq!(picks, vec![a1, a2, a1, a2]);
        assert_eq!(balancer.select(Some(b.id())).unwrap().id, b1);

        // Unknown origin falls back to rotating over loops.
        let other = EventLoop::try_current().unwrap();
        assert!(balancer.select(Some(other.id())).is_some());
    }

    #[tokio::test]
    async fn removal_is_visible_immediately() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let balancer = ChannelBalancer::new();
        let a = EventLoop::try_current().unwrap();
        let w1 = balancer.add_worker(&a, recording("a1", &tx));
        let w2 = balancer.add_worker(&a, recording("a2", &tx));
        assert_eq!(balancer.worker_count(), 2);

        assert!(balancer.remove_worker(a.id(), w1));
        assert!(balancer.has_workers());
        assert!(!balancer.remove_worker(a.id(), w1));
        assert!(balancer.remove_worker(a.id(), w2));
        assert!(!balancer.has_workers());
        assert!(balancer.dispatch(conn(), None).is_err());
    }

    #[tokio::test]
    async fn closed_balancer_refuses_dispatch() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let balancer = ChannelBalancer::new();
        let a = EventLoop::try_current().unwrap();
        balancer.add_worker(&a, recording("a", &tx));
        balancer.close();
        assert!(balancer.is_closed());
        assert!(!balancer.has_workers());
        assert!(balancer.dispatch(conn(), None).is_err());
    }
}
