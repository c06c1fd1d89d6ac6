//! Process-scoped table of physical listeners.
//!
//! # Responsibilities
//! - Decide which handle owns the physical listener of an identity
//! - Attach later handles to the existing listener
//! - Forget a listener once its last handle has gone
//!
//! # Design Decisions
//! - One coarse lock; critical sections never await
//! - A closing entry is replaced rather than joined; the replacement waits
//!   for it to finish closing before binding
//! - Removal is check-then-remove under the lock and requires the same
//!   `Arc`, so a stale release never evicts a newer listener

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::load_balancer::WorkerId;
use crate::net::event_loop::LoopId;
use crate::net::identity::ServerIdentity;
use crate::net::server::SharedServer;

/// Registry key: listeners of different protocols never share.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegistryKey {
    pub protocol: &'static str,
    pub identity: ServerIdentity,
}

impl RegistryKey {
    pub fn new(protocol: &'static str, identity: ServerIdentity) -> Self {
        Self { protocol, identity }
    }
}

impl fmt::Display for RegistryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.identity)
    }
}

/// Outcome of `acquire_or_join`.
pub struct Acquired<T> {
    pub server: Arc<SharedServer>,
    /// True when the caller must bind the socket.
    pub owner: bool,
    /// Whatever the attach callback returned.
    pub attached: T,
}

/// Shared listener table. Construct once and pass by `Arc` to every handle.
#[derive(Default)]
pub struct ServerRegistry {
    servers: Mutex<HashMap<RegistryKey, Arc<SharedServer>>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the live listener for `key`, or create its state and become owner.
    ///
    /// `create` receives the closed signal of a listener that is still closing
    /// for the same key. `attach` runs under the lock for owner and joiners.
    pub fn acquire_or_join<T>(
        &self,
        key: &RegistryKey,
        create: impl FnOnce(Option<watch::Receiver<bool>>) -> Arc<SharedServer>,
        attach: impl FnOnce(&Arc<SharedServer>) -> T,
    ) -> Acquired<T> {
        let mut servers = self.servers.lock();
        let predecessor = match servers.get(key) {
            Some(existing) if !existing.is_closing() => {
                let attached = attach(existing);
                tracing::debug!(key = %key, "Joined existing listener");
                return Acquired {
                    server: Arc::clone(existing),
                    owner: false,
                    attached,
                };
            }
            Some(closing) => Some(closing.closed_signal()),
            None => None,
        };

        let server = create(predecessor);
        let attached = attach(&server);
        servers.insert(key.clone(), Arc::clone(&server));
        tracing::debug!(key = %key, "Registered new listener");
        Acquired {
            server,
            owner: true,
            attached,
        }
    }

    /// Remove a worker from `server` and tell whether it was the last one.
    /// The server is marked closing in that case.
    pub fn detach(&self, server: &SharedServer, loop_id: LoopId, worker: WorkerId) -> bool {
        let _servers = self.servers.lock();
        if !server.balancer().remove_worker(loop_id, worker) {
            return false;
        }
        if server.balancer().has_workers() {
            return false;
        }
        server.mark_closing();
        true
    }

    /// Drop the entry for `key` if it is still `server` and has no workers.
    pub fn release(&self, key: &RegistryKey, server: &Arc<SharedServer>) -> bool {
        let mut servers = self.servers.lock();
        let Some(current) = servers.get(key) else {
            return false;
        };
        if !Arc::ptr_eq(current, server) || server.balancer().has_workers() {
            return false;
        }
        servers.remove(key);
        tracing::debug!(key = %key, "Released listener");
        true
    }

    /// Roll back the entry of a failed bind.
    pub fn abandon(&self, key: &RegistryKey, server: &Arc<SharedServer>) {
        let mut servers = self.servers.lock();
        if servers.get(key).is_some_and(|current| Arc::ptr_eq(current, server)) {
            servers.remove(key);
            tracing::debug!(key = %key, "Abandoned listener");
        }
    }

    pub fn contains(&self, key: &RegistryKey) -> bool {
        self.servers.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.servers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.lock().is_empty()
    }
}

impl fmt::Debug for ServerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<String> = self.servers.lock().keys().map(ToString::to_string).collect();
        f.debug_struct("ServerRegistry").field("servers", &keys).finish()
    }
}
