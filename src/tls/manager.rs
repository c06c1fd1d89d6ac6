//! Hot-swappable TLS context.
//!
//! # Responsibilities
//! - Hold the active context (lock-free reads on the accept path)
//! - Run at most one resolution at a time
//! - Install only the most recently requested options
//!
//! # Update Protocol
//! ```text
//! update    → take the next sequence number, replace the pending request,
//!             start the driver task when none is running
//! driver    → resolve pending requests one at a time until none is left
//! finished  → install when no newer request is pending, then publish the
//!             outcome; callers wait for an outcome at or past their number
//! ```
//!
//! # Design Decisions
//! - The driver runs in its own task so a cancelled caller cannot stall it
//! - A request overtaken while queued is never resolved; its caller receives
//!   the newer outcome
//! - A failed resolution leaves the previous context in place

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::config::TlsOptions;
use crate::observability::metrics;
use crate::tls::{TlsContext, TlsError, TlsResolver};

type Outcome = Result<Arc<TlsContext>, TlsError>;

/// Outcome of the resolution started for request `seq`.
#[derive(Clone)]
struct Finished {
    seq: u64,
    outcome: Outcome,
}

#[derive(Default)]
struct Requests {
    /// Highest sequence number handed out.
    latest: u64,
    pending: Option<(u64, TlsOptions)>,
    running: bool,
}

struct Inner {
    resolver: Arc<dyn TlsResolver>,
    active: ArcSwapOption<TlsContext>,
    requests: Mutex<Requests>,
    finished: watch::Sender<Option<Finished>>,
    resolutions: AtomicU64,
}

/// Shared TLS context of one physical listener.
#[derive(Clone)]
pub struct TlsContextManager {
    inner: Arc<Inner>,
}

impl TlsContextManager {
    pub fn new(resolver: Arc<dyn TlsResolver>) -> Self {
        Self {
            inner: Arc::new(Inner {
                resolver,
                active: ArcSwapOption::empty(),
                requests: Mutex::new(Requests::default()),
                finished: watch::channel(None).0,
                resolutions: AtomicU64::new(0),
            }),
        }
    }

    /// The context new connections handshake with.
    pub fn current(&self) -> Option<Arc<TlsContext>> {
        self.inner.active.load_full()
    }

    /// Number of finished resolutions, successful or not.
    pub fn resolution_count(&self) -> u64 {
        self.inner.resolutions.load(Ordering::SeqCst)
    }

    pub fn is_resolving(&self) -> bool {
        self.inner.requests.lock().running
    }

    /// Resolve `options` and make the result the active context.
    ///
    /// Requests queued behind a running resolution collapse into the latest
    /// one, so the last caller's options win.
    pub async fn update(&self, options: TlsOptions) -> Result<Arc<TlsContext>, TlsError> {
        let mut finished = self.inner.finished.subscribe();
        let seq = Inner::request(&self.inner, options);

        let outcome = match finished
            .wait_for(|f| f.as_ref().is_some_and(|f| f.seq >= seq))
            .await
        {
            Ok(finished) => finished.as_ref().map(|f| f.outcome.clone()),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| Err(TlsError::ResolutionFailed("TLS manager dropped".into())))
    }
}

impl Inner {
    fn request(this: &Arc<Self>, options: TlsOptions) -> u64 {
        let mut requests = this.requests.lock();
        requests.latest += 1;
        let seq = requests.latest;
        if let Some((overtaken, _)) = requests.pending.replace((seq, options)) {
            tracing::debug!(overtaken, seq, "Queued TLS update replaced by a newer one");
        }
        if !requests.running {
            requests.running = true;
            tokio::spawn(Arc::clone(this).drive());
        }
        seq
    }

    async fn drive(self: Arc<Self>) {
        while let Some((seq, options)) = self.next_request() {
            let resolve = self.resolver.resolve(options);
            let outcome = match tokio::spawn(resolve).await {
                Ok(result) => result.map(Arc::new),
                Err(e) => Err(TlsError::ResolutionFailed(e.to_string())),
            };
            self.finish(seq, outcome);
        }
    }

    fn next_request(&self) -> Option<(u64, TlsOptions)> {
        let mut requests = self.requests.lock();
        let next = requests.pending.take();
        if next.is_none() {
            requests.running = false;
        }
        next
    }

    fn finish(&self, seq: u64, outcome: Outcome) {
        self.resolutions.fetch_add(1, Ordering::SeqCst);
        {
            let requests = self.requests.lock();
            match &outcome {
                Ok(ctx) if requests.pending.is_none() => {
                    self.active.store(Some(Arc::clone(ctx)));
                    metrics::record_tls_update("installed");
                    tracing::info!(
                        seq,
                        alpn_protocols = ?ctx.options().alpn_protocols,
                        key_certs = ctx.options().key_certs.len(),
                        "TLS context installed"
                    );
                }
                Ok(_) => {
                    metrics::record_tls_update("superseded");
                    tracing::debug!(seq, latest = requests.latest, "TLS context superseded by a newer update");
                }
                Err(e) => {
                    metrics::record_tls_update("failed");
                    tracing::warn!(seq, error = %e, "TLS context resolution failed");
                }
            }
        }
        self.finished.send_replace(Some(Finished { seq, outcome }));
    }
}
