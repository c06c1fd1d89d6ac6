//! Physical listening socket with backpressure.
//!
//! # Responsibilities
//! - Bind TCP or domain socket addresses
//! - Accept incoming connections
//! - Enforce max_connections limit via semaphore
//! - Feed accepted connections to the channel balancer until stopped

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::sync::{watch, Semaphore};

use crate::load_balancer::ChannelBalancer;
use crate::net::address::{LocalAddress, SocketAddress};
use crate::net::connection::{BoxStream, ConnectionTracker, RawConnection};
use crate::net::error::ServerError;
use crate::observability::metrics;

/// Pause after a failed accept so a persistent error (e.g. fd exhaustion)
/// does not spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

enum Acceptor {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

/// A bound socket that limits concurrent connections.
///
/// Uses a semaphore to enforce `max_connections`. When the limit is reached,
/// accepting waits until a slot becomes available.
pub struct Listener {
    inner: Acceptor,
    connection_limit: Arc<Semaphore>,
    max_connections: usize,
    local_addr: LocalAddress,
}

impl Listener {
    /// Bind to `address`, resolving hostnames through the system resolver.
    pub async fn bind(address: &SocketAddress, max_connections: usize) -> Result<Self, ServerError> {
        let fail = |e| ServerError::bind_failed(address, e);

        let (inner, local_addr) = match address {
            SocketAddress::Inet { host, port } => {
                let port = u16::try_from(*port)
                    .map_err(|_| fail(io::Error::new(io::ErrorKind::InvalidInput, "port out of range")))?;
                let listener = TcpListener::bind((host.as_str(), port)).await.map_err(fail)?;
                let local = listener.local_addr().map_err(fail)?;
                (Acceptor::Tcp(listener), LocalAddress::Inet(local))
            }
            #[cfg(unix)]
            SocketAddress::DomainSocket { path } => {
                let listener = UnixListener::bind(path).map_err(fail)?;
                (Acceptor::Unix(listener), LocalAddress::DomainSocket(path.clone()))
            }
            #[cfg(not(unix))]
            SocketAddress::DomainSocket { .. } => {
                return Err(fail(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "domain sockets are not supported on this platform",
                )));
            }
        };

        tracing::info!(
            address = %local_addr,
            max_connections,
            "Listener bound"
        );

        Ok(Self {
            inner,
            connection_limit: Arc::new(Semaphore::new(max_connections)),
            max_connections,
            local_addr,
        })
    }

    /// Accept a new connection, respecting the connection limit.
    ///
    /// Returns the stream and a permit that must be held for the connection's lifetime.
    pub async fn accept(&self) -> io::Result<(BoxStream, SocketAddress, ConnectionPermit)> {
        // Acquire permit first (backpressure)
        let permit = self
            .connection_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| io::Error::other("connection limit semaphore closed"))?;

        let (stream, peer): (BoxStream, SocketAddress) = match &self.inner {
            Acceptor::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                (Box::new(stream), SocketAddress::from(addr))
            }
            #[cfg(unix)]
            Acceptor::Unix(listener) => {
                let (stream, addr) = listener.accept().await?;
                let path = addr.as_pathname().map(|p| p.to_path_buf()).unwrap_or_default();
                (Box::new(stream), SocketAddress::domain_socket(path))
            }
        };

        tracing::debug!(
            peer_addr = %peer,
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );

        Ok((stream, peer, ConnectionPermit { _permit: permit }))
    }

    pub fn local_addr(&self) -> &LocalAddress {
        &self.local_addr
    }

    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Accept until `stop` flips to `true`, then close the socket.
    ///
    /// Dispatch passes no origin loop; connections rotate across every
    /// attached handle.
    pub(crate) async fn run(
        self,
        balancer: Arc<ChannelBalancer>,
        tracker: ConnectionTracker,
        mut stop: watch::Receiver<bool>,
    ) {
        let label = self.local_addr.to_string();
        loop {
            tokio::select! {
                _ = Self::stopped(&mut stop) => break,
                accepted = self.accept() => match accepted {
                    Ok((stream, peer, permit)) => {
                        let conn = RawConnection::accepted(stream, peer, permit, tracker.track());
                        metrics::record_connection_accepted(&label);
                        if let Err(conn) = balancer.dispatch(conn, None) {
                            tracing::warn!(
                                address = %label,
                                connection_id = %conn.id(),
                                "No worker available, dropping connection"
                            );
                        }
                    }
                    Err(e) => {
                        tracing::warn!(address = %label, error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                }
            }
        }
        self.close();
    }

    /// Resolves once `stop` is `true` or its sender is gone.
    async fn stopped(stop: &mut watch::Receiver<bool>) {
        // The borrow guard must not outlive this future.
        let _ = stop.wait_for(|stopped| *stopped).await;
    }

    fn close(self) {
        let local_addr = self.local_addr.clone();
        drop(self.inner);
        if let LocalAddress::DomainSocket(path) = &local_addr {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::debug!(path = %path.display(), error = %e, "Failed to unlink domain socket");
            }
        }
        tracing::info!(address = %local_addr, "Listener closed");
    }
}

/// A permit representing a connection slot.
///
/// When dropped, the connection slot is released back to the listener.
/// This keeps backpressure intact even if a connection handler panics.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_ephemeral_port() {
        let listener = Listener::bind(&SocketAddress::inet("127.0.0.1", 0), 4).await.unwrap();
        assert_ne!(listener.local_addr().port(), 0);
        assert_eq!(listener.max_connections(), 4);
        assert_eq!(listener.available_permits(), 4);
    }

    #[tokio::test]
    async fn bind_failure_carries_address() {
        let first = Listener::bind(&SocketAddress::inet("127.0.0.1", 0), 1).await.unwrap();
        let port = i32::from(first.local_addr().port());
        let err = Listener::bind(&SocketAddress::inet("127.0.0.1", port), 1).await.err().unwrap();
        match err {
            ServerError::BindFailed { address, .. } => assert_eq!(address.port(), port),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn accept_holds_a_permit() {
        let listener = Listener::bind(&SocketAddress::inet("127.0.0.1", 0), 2).await.unwrap();
        let addr = listener.local_addr().as_inet().unwrap();
        let _client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (_stream, peer, permit) = listener.accept().await.unwrap();
        assert_eq!(peer.host(), Some("127.0.0.1"));
        assert_eq!(listener.available_permits(), 1);
        drop(permit);
        assert_eq!(listener.available_permits(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn accept_loop_runs_on_spawned_task_until_stopped() {
        let listener = Listener::bind(&SocketAddress::inet("127.0.0.1", 0), 2).await.unwrap();
        let addr = listener.local_addr().as_inet().unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = tokio::spawn(listener.run(Arc::new(ChannelBalancer::new()), ConnectionTracker::new(), stop_rx));
        tokio::net::TcpStream::connect(addr).await.unwrap();

        stop_tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }
}
