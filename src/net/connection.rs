//! Connection lifecycle tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Count live connections so shutdown can wait for them to drain
//! - Track each connection's phase for the header-read and idle timeouts
//!
//! # Connection Phases
//! ```text
//! accept ──▶ Waiting(HeaderRead) ──request head parsed──▶ Active
//!                 ▲                                         │
//!           first byte                              response finished
//!                 │                                         ▼
//!            Waiting(Idle) ◀────────────────────────────────┘
//! ```
//! A connection whose waiting deadline passes is closed.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use http_body::{Body, Frame, SizeHint};
use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};

/// Global atomic counter for connection IDs.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Counts live connections.
///
/// Cloning shares the count.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Debug, Default)]
struct TrackerInner {
    active: AtomicUsize,
    drained: Notify,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new live connection. The returned guard releases it on drop.
    pub fn track(&self) -> ConnectionGuard {
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            inner: Arc::clone(&self.inner),
            id: ConnectionId::new(),
        }
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Resolve once no connection is live.
    pub async fn drained(&self) {
        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.active_count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Guard that tracks a connection's lifetime.
#[derive(Debug)]
pub struct ConnectionGuard {
    inner: Arc<TrackerInner>,
    id: ConnectionId,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.inner.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.drained.notify_waiters();
        }
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}

/// Why a waiting connection is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// The client did not finish sending a request head in time.
    HeaderRead,
    /// The connection sat idle between requests for too long.
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Waiting {
        head_started: Option<Instant>,
        deadline: Instant,
        expiry: Expiry,
    },
    Active,
}

/// Per-connection timer state shared by the IO wrapper, the request service
/// and the connection task.
#[derive(Debug)]
pub struct ConnectionClock {
    phase: Mutex<Phase>,
    changed: Notify,
    header_read: Duration,
    idle: Duration,
}

impl ConnectionClock {
    /// Clock for a connection accepted now. The header-read window is open.
    pub fn new(header_read: Duration, idle: Duration) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            phase: Mutex::new(Phase::Waiting {
                head_started: Some(now),
                deadline: now + header_read,
                expiry: Expiry::HeaderRead,
            }),
            changed: Notify::new(),
            header_read,
            idle,
        })
    }

    fn update(&self, f: impl FnOnce(&mut Phase) -> bool) {
        let changed = {
            let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut phase)
        };
        if changed {
            self.changed.notify_waiters();
        }
    }

    fn phase(&self) -> Phase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bytes arrived from the client.
    pub fn on_read(&self) {
        let header_read = self.header_read;
        self.update(|phase| match *phase {
            Phase::Waiting {
                expiry: Expiry::Idle,
                ..
            } => {
                let now = Instant::now();
                *phase = Phase::Waiting {
                    head_started: Some(now),
                    deadline: now + header_read,
                    expiry: Expiry::HeaderRead,
                };
                true
            }
            _ => false,
        });
    }

    /// A request head was parsed. Returns when that head started arriving.
    pub fn request_started(&self) -> Instant {
        let mut started = Instant::now();
        self.update(|phase| {
            if let Phase::Waiting {
                head_started: Some(at),
                ..
            } = *phase
            {
                started = at;
            }
            *phase = Phase::Active;
            true
        });
        started
    }

    /// The response was fully written (or abandoned).
    pub fn request_finished(&self) {
        let deadline = Instant::now() + self.idle;
        self.update(|phase| {
            *phase = Phase::Waiting {
                head_started: None,
                deadline,
                expiry: Expiry::Idle,
            };
            true
        });
    }

    /// Resolve when the connection has been waiting past its deadline.
    pub async fn expired(&self) -> Expiry {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.phase() {
                Phase::Active => notified.await,
                Phase::Waiting { deadline, .. } => {
                    tokio::select! {
                        _ = notified => {}
                        _ = sleep_until(deadline) => {
                            if let Phase::Waiting { deadline, expiry, .. } = self.phase() {
                                if deadline <= Instant::now() {
                                    return expiry;
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Guard to hold for as long as the current exchange's response is alive.
    pub fn exchange(self: &Arc<Self>) -> ExchangeGuard {
        ExchangeGuard {
            clock: Arc::clone(self),
        }
    }
}

/// Marks the current exchange finished when dropped.
#[derive(Debug)]
pub struct ExchangeGuard {
    clock: Arc<ConnectionClock>,
}

impl Drop for ExchangeGuard {
    fn drop(&mut self) {
        self.clock.request_finished();
    }
}

/// Response body that finishes the exchange when hyper drops it.
#[pin_project]
pub struct TrackedBody<B> {
    #[pin]
    inner: B,
    _guard: ExchangeGuard,
}

impl<B> TrackedBody<B> {
    pub fn new(inner: B, guard: ExchangeGuard) -> Self {
        Self {
            inner,
            _guard: guard,
        }
    }
}

impl<B: Body> Body for TrackedBody<B> {
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        self.project().inner.poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Socket wrapper that reports client reads to the connection clock.
#[pin_project]
#[derive(Debug)]
pub struct ActivityIo<T> {
    #[pin]
    inner: T,
    clock: Arc<ConnectionClock>,
}

impl<T> ActivityIo<T> {
    pub fn new(inner: T, clock: Arc<ConnectionClock>) -> Self {
        Self { inner, clock }
    }
}

impl<T: AsyncRead> AsyncRead for ActivityIo<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        let result = this.inner.poll_read(cx, buf);
        if matches!(result, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            this.clock.on_read();
        }
        result
    }
}

impl<T: AsyncWrite> AsyncWrite for ActivityIo<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn connection_tracker_counts() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.active_count(), 0);

        let guard1 = tracker.track();
        assert_eq!(tracker.active_count(), 1);

        let guard2 = tracker.clone().track();
        assert_eq!(tracker.active_count(), 2);

        drop(guard1);
        assert_eq!(tracker.active_count(), 1);

        drop(guard2);
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn drained_waits_for_last_guard() {
        let tracker = ConnectionTracker::new();
        tracker.drained().await;

        let guard = tracker.track();
        let waiter = tokio::spawn({
            let tracker = tracker.clone();
            async move { tracker.drained().await }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_connection_expires_on_header_read() {
        let clock = ConnectionClock::new(Duration::from_secs(2), Duration::from_secs(30));
        let start = Instant::now();
        assert_eq!(clock.expired().await, Expiry::HeaderRead);
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn active_request_never_expires() {
        let clock = ConnectionClock::new(Duration::from_secs(2), Duration::from_secs(30));
        clock.request_started();

        let expired = tokio::time::timeout(Duration::from_secs(120), clock.expired()).await;
        assert!(expired.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn finished_exchange_starts_idle_window() {
        let clock = ConnectionClock::new(Duration::from_secs(2), Duration::from_secs(30));
        clock.request_started();
        drop(clock.exchange());

        let start = Instant::now();
        assert_eq!(clock.expired().await, Expiry::Idle);
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn first_byte_after_idle_opens_header_window() {
        let clock = ConnectionClock::new(Duration::from_secs(2), Duration::from_secs(30));
        clock.request_started();
        clock.request_finished();

        tokio::time::advance(Duration::from_secs(10)).await;
        let byte_at = Instant::now();
        clock.on_read();

        assert_eq!(clock.expired().await, Expiry::HeaderRead);
        assert_eq!(byte_at.elapsed(), Duration::from_secs(2));
        assert_eq!(clock.request_started(), byte_at);
    }

    #[tokio::test]
    async fn activity_io_reports_reads() {
        let clock = ConnectionClock::new(Duration::from_secs(2), Duration::from_secs(30));
        clock.request_started();
        clock.request_finished();

        let (client, server) = tokio::io::duplex(64);
        let mut io = ActivityIo::new(server, Arc::clone(&clock));
        drop(client);

        let mut buf = Vec::new();
        io.read_to_end(&mut buf).await.unwrap();
        assert!(matches!(
            clock.phase(),
            Phase::Waiting {
                expiry: Expiry::Idle,
                ..
            }
        ));

        let (mut client, server) = tokio::io::duplex(64);
        let mut io = ActivityIo::new(server, Arc::clone(&clock));
        tokio::io::AsyncWriteExt::write_all(&mut client, b"GET").await.unwrap();
        let mut buf = [0u8; 3];
        io.read_exact(&mut buf).await.unwrap();
        assert!(matches!(
            clock.phase(),
            Phase::Waiting {
                expiry: Expiry::HeaderRead,
                ..
            }
        ));
    }
}
