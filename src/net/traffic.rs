//! Global traffic shaping.
//!
//! # Responsibilities
//! - Enforce inbound/outbound bandwidth across every connection of a listener
//! - Count transferred bytes
//! - Periodically report throughput
//!
//! # Design Decisions
//! - Token buckets may go into debt: the transfer that overdraws the bucket
//!   completes and the *next* transfer on that stream waits the debt off
//! - A single delay never exceeds `max_delay_to_wait`

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};

use crate::config::TrafficShapingOptions;
use crate::observability::metrics;

/// A token bucket measured in bytes.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_update: Instant::now(),
        }
    }

    /// Take `bytes` and return how long the caller should wait before the
    /// bucket is back out of debt.
    fn consume(&mut self, bytes: u64, capacity: f64, refill_rate: f64) -> Duration {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();

        self.tokens = (self.tokens + elapsed * refill_rate).min(capacity);
        self.last_update = now;
        self.tokens -= bytes as f64;

        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / refill_rate)
        }
    }
}

#[derive(Debug)]
struct Direction {
    rate: f64,
    capacity: f64,
    bucket: Option<Mutex<TokenBucket>>,
    bytes: AtomicU64,
}

impl Direction {
    fn new(rate: u64, peak: u64) -> Self {
        let rate = rate as f64;
        let capacity = if peak > 0 { peak as f64 } else { rate };
        Self {
            rate,
            capacity,
            bucket: (rate > 0.0).then(|| Mutex::new(TokenBucket::new(capacity))),
            bytes: AtomicU64::new(0),
        }
    }

    fn record(&self, bytes: u64, max_delay: Duration) -> Duration {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        match &self.bucket {
            Some(bucket) => bucket.lock().consume(bytes, self.capacity, self.rate).min(max_delay),
            None => Duration::ZERO,
        }
    }
}

/// Bandwidth limits shared by every connection of one physical listener.
#[derive(Debug)]
pub struct TrafficShaper {
    inbound: Direction,
    outbound: Direction,
    max_delay: Duration,
    check_interval: Duration,
}

impl TrafficShaper {
    pub fn new(options: &TrafficShapingOptions) -> Self {
        Self {
            inbound: Direction::new(options.inbound_global_bandwidth, 0),
            outbound: Direction::new(
                options.outbound_global_bandwidth,
                options.peak_outbound_global_bandwidth,
            ),
            max_delay: Duration::from_millis(options.max_delay_to_wait_ms),
            check_interval: Duration::from_millis(options.check_interval_for_stats_ms),
        }
    }

    /// Account `bytes` read and return the delay before the next read.
    pub fn read_delay(&self, bytes: u64) -> Duration {
        self.inbound.record(bytes, self.max_delay)
    }

    /// Account `bytes` written and return the delay before the next write.
    pub fn write_delay(&self, bytes: u64) -> Duration {
        self.outbound.record(bytes, self.max_delay)
    }

    pub async fn throttle_read(&self, bytes: u64) {
        let delay = self.read_delay(bytes);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    pub async fn throttle_write(&self, bytes: u64) {
        let delay = self.write_delay(bytes);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.inbound.bytes.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.outbound.bytes.load(Ordering::Relaxed)
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Report throughput every check interval until the shaper is dropped.
    pub fn spawn_reporter(self: &Arc<Self>, label: String) {
        if self.check_interval.is_zero() {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.check_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            let (mut last_read, mut last_written) = (0u64, 0u64);
            loop {
                ticker.tick().await;
                let Some(shaper) = weak.upgrade() else { break };
                let (read, written) = (shaper.bytes_read(), shaper.bytes_written());
                let secs = interval.as_secs_f64();
                let inbound = (read - last_read) as f64 / secs;
                let outbound = (written - last_written) as f64 / secs;
                metrics::record_throughput(&label, inbound, outbound);
                tracing::trace!(address = %label, inbound, outbound, "Traffic throughput");
                (last_read, last_written) = (read, written);
            }
        });
    }
}

/// A stream whose reads and writes are paced by a `TrafficShaper`.
pub struct ShapedStream<S> {
    inner: S,
    shaper: Arc<TrafficShaper>,
    read_wait: Option<Pin<Box<Sleep>>>,
    write_wait: Option<Pin<Box<Sleep>>>,
}

impl<S> ShapedStream<S> {
    pub fn new(inner: S, shaper: Arc<TrafficShaper>) -> Self {
        Self {
            inner,
            shaper,
            read_wait: None,
            write_wait: None,
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

fn poll_wait(wait: &mut Option<Pin<Box<Sleep>>>, cx: &mut Context<'_>) -> Poll<()> {
    if let Some(sleep) = wait {
        if sleep.as_mut().poll(cx).is_pending() {
            return Poll::Pending;
        }
        *wait = None;
    }
    Poll::Ready(())
}

fn schedule(delay: Duration) -> Option<Pin<Box<Sleep>>> {
    (!delay.is_zero()).then(|| Box::pin(tokio::time::sleep(delay)))
}

impl<S: AsyncRead + Unpin> AsyncRead for ShapedStream<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if poll_wait(&mut this.read_wait, cx).is_pending() {
            return Poll::Pending;
        }
        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let read = (buf.filled().len() - before) as u64;
            if read > 0 {
                this.read_wait = schedule(this.shaper.read_delay(read));
            }
        }
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ShapedStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if poll_wait(&mut this.write_wait, cx).is_pending() {
            return Poll::Pending;
        }
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(written)) = &result {
            this.write_wait = schedule(this.shaper.write_delay(*written as u64));
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
