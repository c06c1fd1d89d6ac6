//! Round-robin selection.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Round-robin cursor.
/// Stores an internal counter to rotate through a slice of candidates.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next index in `0..len`, or `None` for an empty set.
    pub fn next_index(&self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        Some(self.counter.fetch_add(1, Ordering::Relaxed) % len)
    }

    pub fn pick<'a, T>(&self, items: &'a [T]) -> Option<&'a T> {
        self.next_index(items.len()).map(|i| &items[i])
    }
}
