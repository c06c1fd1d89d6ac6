//! Protocol handlers for accepted connections.
//!
//! # Responsibilities
//! - Define the capability a server handle is created with
//!   (`ConnectionHandler`)
//! - Apply traffic shaping and the TLS handshake to a raw connection
//! - Provide the raw TCP variant (`StreamHandler`)
//!
//! # Data Flow
//! ```text
//! RawConnection + ConnectionContext
//!     → ShapedStream (when the listener has a traffic shaper)
//!     → TLS handshake (when ssl, bounded by handshake_timeout)
//!     → NetSocket
//!     → user callback / protocol server
//! ```

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::net::address::{LocalAddress, SocketAddress};
use crate::net::connection::{BoxStream, ConnectionId, ConnectionLease, RawConnection};
use crate::net::traffic::{ShapedStream, TrafficShaper};
use crate::observability::metrics;
use crate::tls::{TlsContext, TlsError};

/// Per-listener state handed to a handler with every connection.
#[derive(Clone)]
pub struct ConnectionContext {
    /// TLS context at accept time, `None` when the listener is plain.
    pub tls: Option<Arc<TlsContext>>,
    pub traffic: Option<Arc<TrafficShaper>>,
    pub local: LocalAddress,
    pub handshake_timeout: Duration,
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("tls", &self.tls.is_some())
            .field("traffic", &self.traffic.is_some())
            .field("local", &self.local)
            .finish()
    }
}

/// Protocol-specific connection handling for a server handle.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Registry namespace: handles of different protocols never share a
    /// physical listener.
    fn protocol(&self) -> &'static str {
        "tcp"
    }

    fn accept(&self, conn: RawConnection, ctx: ConnectionContext) -> BoxFuture<'static, ()>;
}

/// An established connection, after shaping and TLS.
pub struct NetSocket {
    id: ConnectionId,
    stream: BoxStream,
    peer: SocketAddress,
    local: LocalAddress,
    tls: bool,
    alpn: Option<Vec<u8>>,
    server_name: Option<String>,
    traffic: Option<Arc<TrafficShaper>>,
    _lease: ConnectionLease,
}

impl NetSocket {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &SocketAddress {
        &self.peer
    }

    pub fn local(&self) -> &LocalAddress {
        &self.local
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// Negotiated ALPN protocol.
    pub fn alpn(&self) -> Option<&[u8]> {
        self.alpn.as_deref()
    }

    /// SNI name sent by the client.
    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    pub fn traffic(&self) -> Option<&Arc<TrafficShaper>> {
        self.traffic.as_ref()
    }
}

impl fmt::Debug for NetSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetSocket")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("alpn", &self.alpn)
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for NetSocket {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for NetSocket {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

/// Run shaping and the TLS handshake for one accepted connection.
pub async fn establish(conn: RawConnection, ctx: &ConnectionContext) -> Result<NetSocket, TlsError> {
    let id = conn.id();
    let peer = conn.peer().clone();
    let (stream, lease) = conn.into_parts();

    let stream: BoxStream = match &ctx.traffic {
        Some(shaper) => Box::new(ShapedStream::new(stream, Arc::clone(shaper))),
        None => stream,
    };

    let (stream, alpn, server_name): (BoxStream, _, _) = match &ctx.tls {
        None => (stream, None, None),
        Some(tls) => {
            let accepted = tokio::time::timeout(ctx.handshake_timeout, tls.acceptor().accept(stream))
                .await
                .map_err(|_| TlsError::Handshake("handshake timed out".into()))?
                .map_err(|e| TlsError::Handshake(e.to_string()))?;
            let (_, session) = accepted.get_ref();
            let alpn = session.alpn_protocol().map(<[u8]>::to_vec);
            let server_name = session.server_name().map(str::to_string);
            (Box::new(accepted) as BoxStream, alpn, server_name)
        }
    };

    Ok(NetSocket {
        id,
        stream,
        peer,
        local: ctx.local.clone(),
        tls: ctx.tls.is_some(),
        alpn,
        server_name,
        traffic: ctx.traffic.clone(),
        _lease: lease,
    })
}

type SocketCallback = dyn Fn(NetSocket) -> BoxFuture<'static, ()> + Send + Sync;

/// Raw TCP handler: establishes the socket and hands it to a callback.
#[derive(Clone)]
pub struct StreamHandler {
    on_socket: Arc<SocketCallback>,
}

impl StreamHandler {
    pub fn new<F, Fut>(on_socket: F) -> Self
    where
        F: Fn(NetSocket) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            on_socket: Arc::new(move |socket| Box::pin(on_socket(socket))),
        }
    }

    /// Writes back everything it reads.
    pub fn echo() -> Self {
        Self::new(|socket| async move {
            let id = socket.id();
            let (mut reader, mut writer) = tokio::io::split(socket);
            match tokio::io::copy(&mut reader, &mut writer).await {
                Ok(bytes) => tracing::debug!(connection_id = %id, bytes, "Echo finished"),
                Err(e) => tracing::debug!(connection_id = %id, error = %e, "Echo aborted"),
            }
        })
    }
}

impl ConnectionHandler for StreamHandler {
    fn accept(&self, conn: RawConnection, ctx: ConnectionContext) -> BoxFuture<'static, ()> {
        let on_socket = Arc::clone(&self.on_socket);
        Box::pin(async move {
            let id = conn.id();
            match establish(conn, &ctx).await {
                Ok(socket) => on_socket(socket).await,
                Err(e) => {
                    metrics::record_handshake_failure(&ctx.local.to_string());
                    tracing::warn!(connection_id = %id, error = %e, "Connection setup failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;

    fn plain_context() -> ConnectionContext {
        ConnectionContext {
            tls: None,
            traffic: None,
            local: LocalAddress::Inet("127.0.0.1:9000".parse().unwrap()),
            handshake_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn plain_connection_reaches_callback() {
        let (tx, rx) = oneshot::channel();
        let tx = parking_lot::Mutex::new(Some(tx));
        let handler = StreamHandler::new(move |socket| {
            let tx = tx.lock().take();
            async move {
                if let Some(tx) = tx {
                    let _ = tx.send((socket.peer().clone(), socket.is_tls()));
                }
            }
        });

        let (server, _client) = tokio::io::duplex(64);
        let conn = RawConnection::new(server, SocketAddress::inet("10.0.0.1", 5000));
        handler.accept(conn, plain_context()).await;

        let (peer, tls) = rx.await.unwrap();
        assert_eq!(peer, SocketAddress::inet("10.0.0.1", 5000));
        assert!(!tls);
    }

    #[tokio::test]
    async fn echo_handler_writes_back() {
        let (server, mut client) = tokio::io::duplex(64);
        let conn = RawConnection::new(server, SocketAddress::inet("10.0.0.1", 5000));
        let task = tokio::spawn(StreamHandler::echo().accept(conn, plain_context()));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        drop(client);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_handshake_times_out() {
        let dir = env!("CARGO_MANIFEST_DIR");
        let options = crate::config::TlsOptions {
            key_certs: vec![crate::config::KeyCertOptions {
                cert: crate::config::PemSource::Path(format!("{dir}/tests/fixtures/server.crt").into()),
                key: crate::config::PemSource::Path(format!("{dir}/tests/fixtures/server.key").into()),
                server_name: None,
            }],
            ..Default::default()
        };
        let tls = crate::tls::TlsResolver::resolve(&crate::tls::RustlsResolver::new(), options)
            .await
            .unwrap();
        let ctx = ConnectionContext {
            tls: Some(Arc::new(tls)),
            ..plain_context()
        };

        let (server, _client) = tokio::io::duplex(64);
        let conn = RawConnection::new(server, SocketAddress::inet("10.0.0.1", 5000));
        let err = establish(conn, &ctx).await.unwrap_err();
        assert_eq!(err, TlsError::Handshake("handshake timed out".into()));
    }
}
