//! HTTP variant of a shared server handle.
//!
//! # Responsibilities
//! - Establish the connection (traffic shaping, TLS) like the TCP variant
//! - Serve an axum `Router` over HTTP/1.1 or HTTP/2 on the established socket
//! - Expose the peer address to handlers as `ConnectInfo<SocketAddress>`
//!
//! # Design Decisions
//! - `hyper-util`'s auto builder picks HTTP/1.1 or HTTP/2 from the connection
//!   preface, so ALPN `h2` and prior-knowledge HTTP/2 both work
//! - The router is cloned per connection; handler state lives in the router

use std::sync::Arc;

use axum::{extract::ConnectInfo, http::Request, routing::get, Router};
use futures_util::future::BoxFuture;
use hyper::body::Incoming;
use hyper::service::Service as _;
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder,
    service::TowerToHyperService,
};
use tower_http::trace::TraceLayer;

use crate::net::address::SocketAddress;
use crate::net::connection::RawConnection;
use crate::net::handler::{establish, ConnectionContext, ConnectionHandler};
use crate::observability::metrics;

/// Serves a router on every connection a handle accepts.
#[derive(Clone)]
pub struct HttpHandler {
    router: Router,
    builder: Arc<Builder<TokioExecutor>>,
}

impl HttpHandler {
    pub fn new(router: Router) -> Self {
        Self {
            router: router.layer(TraceLayer::new_for_http()),
            builder: Arc::new(Builder::new(TokioExecutor::new())),
        }
    }
}

impl ConnectionHandler for HttpHandler {
    fn protocol(&self) -> &'static str {
        "http"
    }

    fn accept(&self, conn: RawConnection, ctx: ConnectionContext) -> BoxFuture<'static, ()> {
        let router = self.router.clone();
        let builder = Arc::clone(&self.builder);
        Box::pin(async move {
            let id = conn.id();
            let socket = match establish(conn, &ctx).await {
                Ok(socket) => socket,
                Err(e) => {
                    metrics::record_handshake_failure(&ctx.local.to_string());
                    tracing::warn!(connection_id = %id, error = %e, "Connection setup failed");
                    return;
                }
            };

            let peer = socket.peer().clone();
            let service = TowerToHyperService::new(router);
            let service = hyper::service::service_fn(move |mut request: Request<Incoming>| {
                request.extensions_mut().insert(ConnectInfo(peer.clone()));
                service.call(request)
            });

            if let Err(e) = builder
                .serve_connection_with_upgrades(TokioIo::new(socket), service)
                .await
            {
                tracing::debug!(connection_id = %id, error = %e, "HTTP connection ended with error");
            }
        })
    }
}

/// Router served by configured HTTP listeners.
pub fn status_router(listener: &str) -> Router {
    let name = listener.to_string();
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route(
            "/",
            get(move |ConnectInfo(peer): ConnectInfo<SocketAddress>| {
                let name = name.clone();
                async move { format!("{name}: hello {peer}\n") }
            }),
        )
}
