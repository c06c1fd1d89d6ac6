//! Logical server handles sharing physical listeners.
//!
//! # Responsibilities
//! - Bind a handle: become owner of a new listener or join an existing one
//! - Hot-swap the listener's TLS options
//! - Close a handle, tearing the listener down with the last one
//!
//! # Bind Protocol
//! ```text
//! registry.acquire_or_join (worker attached under the registry lock)
//!   owner:  check credentials → resolve TLS → wait predecessor → bind
//!           → publish Bound → spawn accept loop
//!   joiner: wait for the owner's outcome and replay it
//! failure:  owner rolls the entry back and publishes Failed;
//!           joiners detach their worker
//! ```
//!
//! # Design Decisions
//! - The owner's options (TLS, traffic shaping, connection limit) apply to
//!   everyone; a joiner's own options are ignored
//! - `close` on the last handle completes only after the socket is dropped
//!   and the registry entry is gone, so a rebind right after succeeds
//! - In-flight connections outlive the listener; closing stops accepting only

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::config::{ServerOptions, TlsOptions};
use crate::lifecycle::shutdown::{Closeable, HookId, Shutdown};
use crate::load_balancer::{ChannelBalancer, Worker, WorkerId};
use crate::net::address::{LocalAddress, SocketAddress};
use crate::net::connection::{ConnectionTracker, RawConnection};
use crate::net::error::ServerError;
use crate::net::event_loop::{EventLoop, LoopId};
use crate::net::handler::{ConnectionContext, ConnectionHandler};
use crate::net::identity::{BindPlan, ServerIdentity};
use crate::net::listener::Listener;
use crate::net::registry::{RegistryKey, ServerRegistry};
use crate::net::traffic::TrafficShaper;
use crate::observability::metrics;
use crate::tls::{RustlsResolver, TlsContextManager, TlsResolver};

static HANDLE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identifier of one logical server handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(u64);

impl HandleId {
    pub(crate) fn next() -> Self {
        Self(HANDLE_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server-{}", self.0)
    }
}

/// Bind outcome published by the owner.
#[derive(Debug, Clone)]
pub enum BindStatus {
    Pending,
    Bound(LocalAddress),
    Failed(ServerError),
}

/// State of one physical listener, shared by every attached handle.
pub struct SharedServer {
    identity: Option<ServerIdentity>,
    owner: HandleId,
    handles: Mutex<Vec<HandleId>>,
    balancer: Arc<ChannelBalancer>,
    tls: TlsContextManager,
    ssl: bool,
    traffic: Option<Arc<TrafficShaper>>,
    handshake_timeout: Duration,
    max_connections: usize,
    bind_status: watch::Sender<BindStatus>,
    stop: watch::Sender<bool>,
    closed: watch::Sender<bool>,
    closing: AtomicBool,
    tracker: ConnectionTracker,
    predecessor: Option<watch::Receiver<bool>>,
}

impl SharedServer {
    pub(crate) fn new(
        identity: Option<ServerIdentity>,
        owner: HandleId,
        options: &ServerOptions,
        resolver: Arc<dyn TlsResolver>,
        predecessor: Option<watch::Receiver<bool>>,
    ) -> Self {
        Self {
            identity,
            owner,
            handles: Mutex::new(Vec::new()),
            balancer: Arc::new(ChannelBalancer::new()),
            tls: TlsContextManager::new(resolver),
            ssl: options.ssl,
            traffic: options
                .traffic_shaping
                .as_ref()
                .map(|t| Arc::new(TrafficShaper::new(t))),
            handshake_timeout: options.handshake_timeout(),
            max_connections: options.max_connections,
            bind_status: watch::channel(BindStatus::Pending).0,
            stop: watch::channel(false).0,
            closed: watch::channel(false).0,
            closing: AtomicBool::new(false),
            tracker: ConnectionTracker::new(),
            predecessor,
        }
    }

    pub fn identity(&self) -> Option<&ServerIdentity> {
        self.identity.as_ref()
    }

    pub fn owner(&self) -> HandleId {
        self.owner
    }

    pub fn handles(&self) -> Vec<HandleId> {
        self.handles.lock().clone()
    }

    pub fn balancer(&self) -> &Arc<ChannelBalancer> {
        &self.balancer
    }

    pub fn tls(&self) -> &TlsContextManager {
        &self.tls
    }

    pub fn is_ssl(&self) -> bool {
        self.ssl
    }

    pub fn status(&self) -> BindStatus {
        self.bind_status.borrow().clone()
    }

    pub fn local_address(&self) -> Option<LocalAddress> {
        match &*self.bind_status.borrow() {
            BindStatus::Bound(local) => Some(local.clone()),
            _ => None,
        }
    }

    pub fn active_connections(&self) -> u64 {
        self.tracker.active_count()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closing(&self) {
        self.closing.store(true, Ordering::Release);
    }

    pub(crate) fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    fn attach(&self, handle: HandleId, event_loop: &EventLoop, worker: Arc<dyn Worker>) -> WorkerId {
        self.handles.lock().push(handle);
        self.balancer.add_worker(event_loop, worker)
    }

    fn forget(&self, handle: HandleId) {
        self.handles.lock().retain(|h| *h != handle);
    }

    /// Context for a connection accepted now, `None` when it must be refused.
    fn context(&self) -> Option<ConnectionContext> {
        let local = self.local_address()?;
        let tls = if self.ssl { Some(self.tls.current()?) } else { None };
        Some(ConnectionContext {
            tls,
            traffic: self.traffic.clone(),
            local,
            handshake_timeout: self.handshake_timeout,
        })
    }

    fn fail(&self, error: ServerError) {
        self.balancer.close();
        self.bind_status.send_replace(BindStatus::Failed(error));
        self.closed.send_replace(true);
    }
}

/// Balancer worker of one handle.
struct HandleWorker {
    handle: HandleId,
    handler: Arc<dyn ConnectionHandler>,
    server: Weak<SharedServer>,
}

impl Worker for HandleWorker {
    fn accept(&self, conn: RawConnection) -> BoxFuture<'static, ()> {
        let Some(ctx) = self.server.upgrade().and_then(|s| s.context()) else {
            tracing::warn!(
                server_id = %self.handle,
                connection_id = %conn.id(),
                "Listener not ready, refusing connection"
            );
            return Box::pin(async {});
        };
        self.handler.accept(conn, ctx)
    }
}

struct Attachment {
    server: Arc<SharedServer>,
    key: Option<RegistryKey>,
    loop_id: LoopId,
    worker: WorkerId,
    hook: Option<HookId>,
}

#[derive(Default)]
struct HandleState {
    listening: bool,
    attachment: Option<Attachment>,
}

struct ServerHandle {
    id: HandleId,
    registry: Arc<ServerRegistry>,
    options: ServerOptions,
    handler: Arc<dyn ConnectionHandler>,
    resolver: Arc<dyn TlsResolver>,
    shutdown: Option<Shutdown>,
    event_loop: Mutex<Option<EventLoop>>,
    state: Mutex<HandleState>,
}

/// Builder for `TcpServer`.
pub struct TcpServerBuilder {
    registry: Arc<ServerRegistry>,
    handler: Arc<dyn ConnectionHandler>,
    options: ServerOptions,
    resolver: Option<Arc<dyn TlsResolver>>,
    shutdown: Option<Shutdown>,
    event_loop: Option<EventLoop>,
}

impl TcpServerBuilder {
    pub fn options(mut self, options: ServerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn tls_resolver(mut self, resolver: Arc<dyn TlsResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Register the bound handle as a close hook of `shutdown`.
    pub fn shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Pin the handle to an event loop. Defaults to a new loop identity on
    /// the runtime that calls `bind`.
    pub fn event_loop(mut self, event_loop: EventLoop) -> Self {
        self.event_loop = Some(event_loop);
        self
    }

    pub fn build(self) -> TcpServer {
        TcpServer {
            handle: Arc::new(ServerHandle {
                id: HandleId::next(),
                registry: self.registry,
                options: self.options,
                handler: self.handler,
                resolver: self.resolver.unwrap_or_else(|| Arc::new(RustlsResolver::new())),
                shutdown: self.shutdown,
                event_loop: Mutex::new(self.event_loop),
                state: Mutex::new(HandleState::default()),
            }),
        }
    }
}

/// A logical server handle.
#[derive(Clone)]
pub struct TcpServer {
    handle: Arc<ServerHandle>,
}

impl TcpServer {
    pub fn builder(registry: Arc<ServerRegistry>, handler: impl ConnectionHandler) -> TcpServerBuilder {
        TcpServerBuilder {
            registry,
            handler: Arc::new(handler),
            options: ServerOptions::default(),
            resolver: None,
            shutdown: None,
            event_loop: None,
        }
    }

    pub fn id(&self) -> HandleId {
        self.handle.id
    }

    pub fn options(&self) -> &ServerOptions {
        &self.handle.options
    }

    pub fn is_listening(&self) -> bool {
        self.handle.state.lock().listening
    }

    /// Address the physical listener is bound to.
    pub fn local_address(&self) -> Option<LocalAddress> {
        self.shared().and_then(|s| s.local_address())
    }

    /// Port actually bound, which for joiners of an ephemeral group is the
    /// owner's port.
    pub fn actual_port(&self) -> Option<u16> {
        self.local_address().map(|l| l.port())
    }

    /// Live connections of the physical listener.
    pub fn active_connections(&self) -> u64 {
        self.shared().map_or(0, |s| s.active_connections())
    }

    pub fn shared(&self) -> Option<Arc<SharedServer>> {
        self.handle
            .state
            .lock()
            .attachment
            .as_ref()
            .map(|a| Arc::clone(&a.server))
    }

    /// Start listening on `address`.
    pub async fn bind(&self, address: &SocketAddress) -> Result<LocalAddress, ServerError> {
        {
            let mut state = self.handle.state.lock();
            if state.listening {
                return Err(ServerError::AlreadyListening);
            }
            state.listening = true;
        }

        let result = self.try_bind(address).await;
        if let Err(e) = &result {
            let mut state = self.handle.state.lock();
            state.listening = false;
            state.attachment = None;
            tracing::warn!(server_id = %self.handle.id, address = %address, error = %e, "Bind failed");
        }
        result
    }

    async fn try_bind(&self, address: &SocketAddress) -> Result<LocalAddress, ServerError> {
        let event_loop = self.event_loop()?;
        let plan = BindPlan::for_address(address);
        let key = plan
            .identity()
            .map(|id| RegistryKey::new(self.handle.handler.protocol(), id.clone()));

        let create = |predecessor| {
            Arc::new(SharedServer::new(
                plan.identity().cloned(),
                self.handle.id,
                &self.handle.options,
                Arc::clone(&self.handle.resolver),
                predecessor,
            ))
        };
        let attach = |server: &Arc<SharedServer>| {
            let worker = HandleWorker {
                handle: self.handle.id,
                handler: Arc::clone(&self.handle.handler),
                server: Arc::downgrade(server),
            };
            server.attach(self.handle.id, &event_loop, Arc::new(worker))
        };

        let (server, owner, worker) = match &key {
            Some(key) => {
                let acquired = self.handle.registry.acquire_or_join(key, create, attach);
                (acquired.server, acquired.owner, acquired.attached)
            }
            None => {
                let server = create(None);
                let worker = attach(&server);
                (server, true, worker)
            }
        };

        self.handle.state.lock().attachment = Some(Attachment {
            server: Arc::clone(&server),
            key: key.clone(),
            loop_id: event_loop.id(),
            worker,
            hook: None,
        });

        let outcome = if owner {
            let outcome = self.bind_owner(&server, key.as_ref(), &plan, &event_loop).await;
            if let Err(e) = &outcome {
                if let Some(key) = &key {
                    self.handle.registry.abandon(key, &server);
                }
                server.fail(e.clone());
            }
            outcome
        } else {
            let outcome = Self::join(&server).await;
            if outcome.is_err() {
                self.handle.registry.detach(&server, event_loop.id(), worker);
                server.forget(self.handle.id);
            }
            outcome
        };

        let local = outcome?;
        self.register_hook();
        tracing::info!(
            server_id = %self.handle.id,
            address = %local,
            owner,
            "Server listening"
        );
        Ok(local)
    }

    async fn bind_owner(
        &self,
        server: &Arc<SharedServer>,
        key: Option<&RegistryKey>,
        plan: &BindPlan,
        event_loop: &EventLoop,
    ) -> Result<LocalAddress, ServerError> {
        let options = &self.handle.options;
        if options.ssl {
            if !options.tls.has_credentials() {
                return Err(ServerError::MissingCredentials);
            }
            server.tls.update(options.tls.clone()).await?;
        }

        if let Some(mut predecessor) = server.predecessor.clone() {
            tracing::debug!(server_id = %self.handle.id, "Waiting for previous listener to close");
            let _ = predecessor.wait_for(|closed| *closed).await;
        }
        if server.is_closing() {
            return Err(ServerError::Closed);
        }

        let listener = Listener::bind(&plan.bind_address, server.max_connections).await?;
        if server.is_closing() {
            return Err(ServerError::Closed);
        }
        let local = listener.local_addr().clone();
        let label = local.to_string();
        metrics::record_listener_bound(&label);
        server.bind_status.send_replace(BindStatus::Bound(local.clone()));
        if let Some(traffic) = &server.traffic {
            traffic.spawn_reporter(label.clone());
        }

        let registry = Arc::clone(&self.handle.registry);
        let shared = Arc::clone(server);
        let key = key.cloned();
        let stop = server.stop.subscribe();
        event_loop.spawn(async move {
            listener
                .run(Arc::clone(&shared.balancer), shared.tracker.clone(), stop)
                .await;
            shared.balancer.close();
            metrics::record_listener_closed(&label);
            if let Some(key) = &key {
                registry.release(key, &shared);
            }
            shared.closed.send_replace(true);
        });

        Ok(local)
    }

    async fn join(server: &SharedServer) -> Result<LocalAddress, ServerError> {
        let mut status = server.bind_status.subscribe();
        let status = status
            .wait_for(|s| !matches!(s, BindStatus::Pending))
            .await
            .map_err(|_| ServerError::Closed)?
            .clone();
        match status {
            BindStatus::Bound(local) => Ok(local),
            BindStatus::Failed(e) => Err(e),
            BindStatus::Pending => Err(ServerError::Closed),
        }
    }

    fn event_loop(&self) -> Result<EventLoop, ServerError> {
        let mut slot = self.handle.event_loop.lock();
        if let Some(event_loop) = slot.as_ref() {
            return Ok(event_loop.clone());
        }
        let event_loop = EventLoop::try_current().ok_or(ServerError::NoRuntime)?;
        *slot = Some(event_loop.clone());
        Ok(event_loop)
    }

    fn register_hook(&self) {
        let Some(shutdown) = &self.handle.shutdown else {
            return;
        };
        let mut state = self.handle.state.lock();
        if let Some(attachment) = state.attachment.as_mut() {
            attachment.hook = Some(shutdown.add_hook(Arc::new(self.clone())));
        }
    }

    /// Resolve and install new TLS options on the physical listener.
    pub async fn update_tls_options(&self, options: TlsOptions) -> Result<(), ServerError> {
        let server = self.shared().ok_or(ServerError::NotListening)?;
        server.tls.update(options).await?;
        tracing::info!(server_id = %self.handle.id, "TLS options updated");
        Ok(())
    }

    /// Stop this handle. The listener closes with its last handle.
    pub async fn close(&self) {
        let attachment = {
            let mut state = self.handle.state.lock();
            state.listening = false;
            state.attachment.take()
        };
        let Some(attachment) = attachment else {
            return;
        };

        if let (Some(shutdown), Some(hook)) = (&self.handle.shutdown, attachment.hook) {
            shutdown.remove_hook(hook);
        }

        let server = attachment.server;
        server.forget(self.handle.id);
        let last = self
            .handle
            .registry
            .detach(&server, attachment.loop_id, attachment.worker);
        if !last {
            tracing::debug!(server_id = %self.handle.id, "Handle detached, listener stays open");
            return;
        }

        server.stop.send_replace(true);
        let mut closed = server.closed_signal();
        let _ = closed.wait_for(|closed| *closed).await;
        if let Some(key) = &attachment.key {
            self.handle.registry.release(key, &server);
        }
        tracing::info!(server_id = %self.handle.id, "Listener closed by last handle");
    }
}

impl Closeable for TcpServer {
    fn name(&self) -> String {
        self.handle.id.to_string()
    }

    fn close(&self) -> BoxFuture<'static, ()> {
        let server = self.clone();
        Box::pin(async move { server.close().await })
    }
}

impl fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpServer")
            .field("id", &self.handle.id)
            .field("protocol", &self.handle.handler.protocol())
            .field("listening", &self.is_listening())
            .finish_non_exhaustive()
    }
}
