//! Accepted connections and lifecycle tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Erase the concrete stream type (TCP, domain socket, TLS)
//! - Count live connections per physical listener

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::net::address::SocketAddress;
use crate::net::listener::ConnectionPermit;

/// Global atomic counter for connection IDs.
/// Relaxed ordering is enough: only uniqueness matters.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Any byte stream a connection can run over.
pub trait NetStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> NetStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxStream = Box<dyn NetStream>;

/// Counts the live connections of one physical listener.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    active_count: Arc<AtomicU64>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new active connection. Returns a guard that decrements on drop.
    pub fn track(&self) -> ConnectionGuard {
        self.active_count.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            active_count: Arc::clone(&self.active_count),
            id: ConnectionId::new(),
        }
    }

    /// Get current active connection count.
    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }
}

/// Guard that tracks a connection's lifetime.
#[derive(Debug)]
pub struct ConnectionGuard {
    active_count: Arc<AtomicU64>,
    id: ConnectionId,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active_count.fetch_sub(1, Ordering::SeqCst);
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}

/// A freshly accepted connection before any protocol handling.
///
/// Holds the listener's connection slot and tracker guard; both are released
/// when the connection (or the stream taken out of it) is dropped.
pub struct RawConnection {
    id: ConnectionId,
    stream: BoxStream,
    peer: SocketAddress,
    lease: ConnectionLease,
}

/// Listener resources bound to the lifetime of one connection.
#[derive(Debug, Default)]
pub struct ConnectionLease {
    _permit: Option<ConnectionPermit>,
    _guard: Option<ConnectionGuard>,
}

impl RawConnection {
    pub fn new(stream: impl NetStream, peer: SocketAddress) -> Self {
        Self {
            id: ConnectionId::new(),
            stream: Box::new(stream),
            peer,
            lease: ConnectionLease::default(),
        }
    }

    pub(crate) fn accepted(
        stream: BoxStream,
        peer: SocketAddress,
        permit: ConnectionPermit,
        guard: ConnectionGuard,
    ) -> Self {
        Self {
            id: guard.id(),
            stream,
            peer,
            lease: ConnectionLease {
                _permit: Some(permit),
                _guard: Some(guard),
            },
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &SocketAddress {
        &self.peer
    }

    /// Splits the connection into its stream and the lease that must be kept
    /// alive as long as the stream is in use.
    pub fn into_parts(self) -> (BoxStream, ConnectionLease) {
        (self.stream, self.lease)
    }
}

impl fmt::Debug for RawConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawConnection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}
