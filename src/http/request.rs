//! Outbound request bookkeeping.
//!
//! # Responsibilities
//! - Describe one request sent through a pooled endpoint (method, URI,
//!   authority, scheme)
//! - Guard it with a `RequestTimeoutWatchdog`
//! - Complete the response future exactly once: with the response head, a
//!   reset, a failure or the timeout
//!
//! # Design Decisions
//! - The response future is `Shared`, so any number of callers can wait on
//!   the same outcome
//! - Failures seen after a timeout fired are reported as that timeout

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, Method, StatusCode, Version};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::net::address::HostAndPort;
use crate::net::event_loop::EventLoop;
use crate::pool::{EndpointKey, PoolError};
use crate::resilience::timeouts::{RequestTimeoutWatchdog, TimeoutTarget};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("The timeout period of {timeout_ms}ms has been exceeded while executing {method} {uri} for server {authority}")]
    Timeout {
        timeout_ms: u64,
        method: String,
        uri: String,
        authority: String,
    },

    #[error("stream reset (code {code})")]
    StreamReset { code: u64 },

    #[error("connection closed")]
    ConnectionClosed,

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("i/o error: {0}")]
    Io(String),
}

impl RequestError {
    pub fn timeout(timeout: Duration, target: &TimeoutTarget) -> Self {
        Self::Timeout {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            method: target.method.clone(),
            uri: target.uri.clone(),
            authority: target.authority.clone(),
        }
    }
}

impl From<std::io::Error> for RequestError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Status line and headers of a received response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
        }
    }
}

pub type ResponseResult = Result<ResponseHead, RequestError>;

struct Outcome {
    sender: Mutex<Option<oneshot::Sender<ResponseResult>>>,
}

impl Outcome {
    fn complete(&self, result: ResponseResult) -> bool {
        match self.sender.lock().take() {
            Some(sender) => {
                let _ = sender.send(result);
                true
            }
            None => false,
        }
    }

    fn is_complete(&self) -> bool {
        self.sender.lock().is_none()
    }
}

pub struct ClientRequest {
    method: Method,
    uri: String,
    authority: HostAndPort,
    ssl: bool,
    watchdog: RequestTimeoutWatchdog,
    outcome: Arc<Outcome>,
    response: Shared<BoxFuture<'static, ResponseResult>>,
}

impl ClientRequest {
    /// `uri` is the request target: path plus optional query. Timeouts run
    /// on `event_loop`.
    pub fn new(
        event_loop: EventLoop,
        method: Method,
        ssl: bool,
        authority: HostAndPort,
        uri: impl Into<String>,
    ) -> Self {
        let uri = uri.into();
        let (tx, rx) = oneshot::channel();
        let outcome = Arc::new(Outcome {
            sender: Mutex::new(Some(tx)),
        });

        let target = TimeoutTarget {
            method: method.to_string(),
            uri: uri.clone(),
            authority: authority.to_string(),
        };
        let on_timeout = Arc::clone(&outcome);
        let watchdog = RequestTimeoutWatchdog::new(target, event_loop, move |cause| {
            on_timeout.complete(Err(cause));
        });

        let response = rx
            .map(|received| received.unwrap_or(Err(RequestError::ConnectionClosed)))
            .boxed()
            .shared();

        Self {
            method,
            uri,
            authority,
            ssl,
            watchdog,
            outcome,
            response,
        }
    }

    /// Request for `uri` on the endpoint `key` points at.
    pub fn for_endpoint(event_loop: EventLoop, method: Method, key: &EndpointKey, uri: impl Into<String>) -> Self {
        Self::new(event_loop, method, key.ssl(), key.authority().clone(), uri)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn is_ssl(&self) -> bool {
        self.ssl
    }

    /// Host header value; the scheme's default port is left out.
    pub fn authority(&self) -> String {
        match self.authority.port {
            Some(80) if !self.ssl => self.authority.host.clone(),
            Some(443) if self.ssl => self.authority.host.clone(),
            Some(port) => format!("{}:{}", self.authority.host, port),
            None => self.authority.host.clone(),
        }
    }

    pub fn absolute_uri(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        format!("{scheme}://{}{}", self.authority(), self.uri)
    }

    pub fn path(&self) -> &str {
        let end = self.uri.find(['?', '#']).unwrap_or(self.uri.len());
        &self.uri[..end]
    }

    pub fn query(&self) -> Option<&str> {
        let (_, rest) = self.uri.split_once('?')?;
        Some(rest.split_once('#').map_or(rest, |(query, _)| query))
    }

    pub fn watchdog(&self) -> &RequestTimeoutWatchdog {
        &self.watchdog
    }

    /// Arm (or re-arm) the response timeout.
    pub fn set_timeout(&self, timeout: Duration) -> &Self {
        self.watchdog.arm(timeout);
        self
    }

    /// Called for every chunk received; turns the timeout into an idle timeout.
    pub fn data_received(&self) {
        self.watchdog.record_progress();
    }

    /// Abort the request with a stream reset. Returns `false` when the
    /// request already completed.
    pub fn reset(&self, code: u64) -> bool {
        self.watchdog.cancel();
        let cause = self.watchdog.map_error(RequestError::StreamReset { code });
        let reset = self.outcome.complete(Err(cause));
        if reset {
            tracing::debug!(uri = %self.absolute_uri(), code, "Request reset");
        }
        reset
    }

    pub fn fail(&self, err: RequestError) {
        self.watchdog.cancel();
        let err = self.watchdog.map_error(err);
        if self.outcome.complete(Err(err.clone())) {
            tracing::debug!(uri = %self.absolute_uri(), error = %err, "Request failed");
        }
    }

    /// The response head arrived. Returns the timeout period that was still
    /// armed, for the caller to apply to the body.
    pub fn handle_response(&self, head: ResponseHead) -> Option<Duration> {
        let remaining = self.watchdog.cancel();
        self.outcome.complete(Ok(head));
        remaining
    }

    pub fn is_complete(&self) -> bool {
        self.outcome.is_complete()
    }

    pub fn response(&self) -> Shared<BoxFuture<'static, ResponseResult>> {
        self.response.clone()
    }
}

impl std::fmt::Debug for ClientRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRequest")
            .field("method", &self.method)
            .field("uri", &self.absolute_uri())
            .field("watchdog", &self.watchdog)
            .finish()
    }
}
