//! Shutdown coordination.
//!
//! Provides a broadcast channel that long-running tasks subscribe to, plus a
//! set of close hooks (bound server handles) run by `close_all`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use tokio::sync::broadcast;

/// Something that can be closed during shutdown.
pub trait Closeable: Send + Sync + 'static {
    fn name(&self) -> String;

    fn close(&self) -> BoxFuture<'static, ()>;
}

/// Identifier returned by `add_hook`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HookId(u64);

impl fmt::Display for HookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hook-{}", self.0)
    }
}

struct Inner {
    tx: broadcast::Sender<()>,
    hooks: Mutex<BTreeMap<HookId, Arc<dyn Closeable>>>,
    next_hook: AtomicU64,
}

/// Coordinator for graceful shutdown. Cheap to clone.
#[derive(Clone)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

impl Shutdown {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(Inner {
                tx,
                hooks: Mutex::new(BTreeMap::new()),
                next_hook: AtomicU64::new(1),
            }),
        }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.inner.tx.subscribe()
    }

    /// Trigger the shutdown signal.
    pub fn trigger(&self) {
        let _ = self.inner.tx.send(());
    }

    /// Get the number of active subscribers (tasks still running).
    pub fn receiver_count(&self) -> usize {
        self.inner.tx.receiver_count()
    }

    pub fn add_hook(&self, hook: Arc<dyn Closeable>) -> HookId {
        let id = HookId(self.inner.next_hook.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(hook_id = %id, name = %hook.name(), "Close hook registered");
        self.inner.hooks.lock().insert(id, hook);
        id
    }

    /// Deregister a hook. Unknown ids are ignored.
    pub fn remove_hook(&self, id: HookId) -> bool {
        self.inner.hooks.lock().remove(&id).is_some()
    }

    pub fn hook_count(&self) -> usize {
        self.inner.hooks.lock().len()
    }

    /// Trigger the signal and close every registered hook concurrently.
    pub async fn close_all(&self) {
        self.trigger();
        let hooks: Vec<Arc<dyn Closeable>> = std::mem::take(&mut *self.inner.hooks.lock()).into_values().collect();
        tracing::info!(hooks = hooks.len(), "Running close hooks");
        join_all(hooks.iter().map(|hook| hook.close())).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
