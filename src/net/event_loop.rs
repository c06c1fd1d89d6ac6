//! Worker event loops.
//!
//! An `EventLoop` pairs a Tokio runtime handle with a stable `LoopId`. Every
//! connection dispatched to a worker is spawned on that worker's loop and
//! stays there for its whole life. Clone an `EventLoop` to give several
//! logical handles the same affinity.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

static LOOP_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identifier used for affinity decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoopId(u64);

impl LoopId {
    fn next() -> Self {
        Self(LOOP_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loop-{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct EventLoop {
    id: LoopId,
    handle: Handle,
}

impl EventLoop {
    /// A new loop identity running on the given runtime.
    pub fn new(handle: Handle) -> Self {
        Self {
            id: LoopId::next(),
            handle,
        }
    }

    /// A new loop identity on the runtime of the calling task, if any.
    pub fn try_current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }

    pub fn id(&self) -> LoopId {
        self.id
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn each_loop_gets_a_distinct_id() {
        let a = EventLoop::try_current().unwrap();
        let b = EventLoop::try_current().unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
    }

    #[test]
    fn no_loop_outside_runtime() {
        assert!(EventLoop::try_current().is_none());
    }
}
