//! Per-request timeout watchdog.
//!
//! # Responsibilities
//! - Arm a deadline timer for one request, replacing any earlier timer
//! - Turn the deadline into an idle timeout once data has been received
//! - Deliver the timeout failure exactly once and keep it as the sticky cause
//!
//! # States
//! ```text
//! Idle → Armed → (Rescheduled)* → Fired | Cancelled
//! ```
//!
//! # Design Decisions
//! - All state lives in one record under a `parking_lot::Mutex`; the timer
//!   task holds a `Weak` reference and a timer id, so a replaced or cancelled
//!   timer that still wakes up is ignored
//! - The delivery callback runs outside the lock
//! - Timers run on the event loop the watchdog was created for, so the
//!   mutators may be called from any thread

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::http::request::RequestError;
use crate::net::event_loop::EventLoop;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogPhase {
    Idle,
    Armed,
    Rescheduled,
    Fired,
    Cancelled,
}

/// What the guarded request was doing, used in the timeout message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutTarget {
    pub method: String,
    pub uri: String,
    pub authority: String,
}

type OnTimeout = Box<dyn Fn(RequestError) + Send + Sync>;

struct Timer {
    id: u64,
    handle: JoinHandle<()>,
}

struct TimeoutState {
    phase: WatchdogPhase,
    timer: Option<Timer>,
    configured: Option<Duration>,
    period: Duration,
    last_progress: Option<Instant>,
    fired: Option<RequestError>,
    next_timer: u64,
}

struct Inner {
    target: TimeoutTarget,
    event_loop: EventLoop,
    state: Mutex<TimeoutState>,
    on_timeout: OnTimeout,
}

#[derive(Clone)]
pub struct RequestTimeoutWatchdog {
    inner: Arc<Inner>,
}

impl RequestTimeoutWatchdog {
    /// `on_timeout` receives the timeout failure, at most once.
    pub fn new(
        target: TimeoutTarget,
        event_loop: EventLoop,
        on_timeout: impl Fn(RequestError) + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                target,
                event_loop,
                state: Mutex::new(TimeoutState {
                    phase: WatchdogPhase::Idle,
                    timer: None,
                    configured: None,
                    period: Duration::ZERO,
                    last_progress: None,
                    fired: None,
                    next_timer: 0,
                }),
                on_timeout: Box::new(on_timeout),
            }),
        }
    }

    pub fn target(&self) -> &TimeoutTarget {
        &self.inner.target
    }

    /// Start (or restart) the deadline. Ignored once the watchdog fired.
    pub fn arm(&self, timeout: Duration) {
        let mut state = self.inner.state.lock();
        if state.phase == WatchdogPhase::Fired {
            return;
        }
        if let Some(timer) = state.timer.take() {
            timer.handle.abort();
        }
        state.configured = Some(timeout);
        state.last_progress = None;
        state.phase = WatchdogPhase::Armed;
        Inner::schedule(&self.inner, &mut state, timeout);
    }

    /// Note that data arrived for the request.
    pub fn record_progress(&self) {
        let mut state = self.inner.state.lock();
        if state.timer.is_some() {
            state.last_progress = Some(Instant::now());
        }
    }

    /// Stop the timer. Returns the period that was in force, or `None` when
    /// nothing was armed.
    pub fn cancel(&self) -> Option<Duration> {
        let mut state = self.inner.state.lock();
        match state.phase {
            WatchdogPhase::Armed | WatchdogPhase::Rescheduled => {
                if let Some(timer) = state.timer.take() {
                    timer.handle.abort();
                }
                state.phase = WatchdogPhase::Cancelled;
                state.configured = None;
                state.last_progress = None;
                Some(state.period)
            }
            _ => None,
        }
    }

    pub fn phase(&self) -> WatchdogPhase {
        self.inner.state.lock().phase
    }

    pub fn fired_cause(&self) -> Option<RequestError> {
        self.inner.state.lock().fired.clone()
    }

    /// Report a connection failure seen after a timeout as the timeout itself.
    pub fn map_error(&self, err: RequestError) -> RequestError {
        match err {
            RequestError::ConnectionClosed | RequestError::StreamReset { .. } => {
                self.fired_cause().unwrap_or(err)
            }
            other => other,
        }
    }
}

impl Inner {
    fn schedule(this: &Arc<Self>, state: &mut TimeoutState, period: Duration) {
        let id = state.next_timer;
        state.next_timer += 1;
        state.period = period;

        let deadline = Instant::now() + period;
        let weak: Weak<Self> = Arc::downgrade(this);
        let handle = this.event_loop.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = weak.upgrade() {
                Inner::expire(&inner, id);
            }
        });
        state.timer = Some(Timer { id, handle });
    }

    fn expire(this: &Arc<Self>, id: u64) {
        let cause = {
            let mut state = this.state.lock();
            if state.timer.as_ref().map(|t| t.id) != Some(id) {
                return;
            }
            state.timer = None;
            let Some(configured) = state.configured else {
                return;
            };

            if let Some(progress) = state.last_progress.take() {
                let idle = progress.elapsed();
                if idle < configured {
                    let remaining = configured - idle;
                    state.phase = WatchdogPhase::Rescheduled;
                    tracing::trace!(
                        uri = %this.target.uri,
                        remaining_ms = remaining.as_millis() as u64,
                        "Request timeout rescheduled after progress"
                    );
                    Inner::schedule(this, &mut state, remaining);
                    return;
                }
            }

            let cause = RequestError::timeout(configured, &this.target);
            state.phase = WatchdogPhase::Fired;
            state.fired = Some(cause.clone());
            cause
        };

        tracing::warn!(
            method = %this.target.method,
            uri = %this.target.uri,
            authority = %this.target.authority,
            "Request timed out"
        );
        crate::observability::metrics::record_request_timeout(&this.target.authority);
        (this.on_timeout)(cause);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(timer) = self.state.get_mut().timer.take() {
            timer.handle.abort();
        }
    }
}

impl fmt::Debug for RequestTimeoutWatchdog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("RequestTimeoutWatchdog")
            .field("target", &self.inner.target)
            .field("phase", &state.phase)
            .field("period", &state.period)
            .finish()
    }
}
