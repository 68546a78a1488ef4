//! HTTP server lifecycle.
//!
//! # Responsibilities
//! - Bind the client-facing socket (`listen`) separately from accepting
//!   connections (`serve`) so ephemeral ports can be read in between
//! - Drive one hyper HTTP/1.1 connection per accepted socket, dispatching
//!   every request to the forwarding router
//! - Enforce header-read, read, write and idle timeouts per connection
//! - Bounded graceful shutdown
//!
//! # States
//! ```text
//! Unbound ──listen──▶ Bound ──serve──▶ Serving ──shutdown──▶ Closed
//!                       └──────────────shutdown──────────────▶ Closed
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::Router;
use http::{Request, Response};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;
use tower::ServiceExt;
use tracing::Instrument;

use crate::config::{ProxyConfig, ServerTimeouts};
use crate::lifecycle::{Shutdown, ShutdownPhase, ShutdownSignal};
use crate::net::connection::{ActivityIo, ConnectionClock, ConnectionTracker, TrackedBody};
use crate::net::{Listener, ListenerError};
use crate::proxy::{ForwardingEngine, ResponseDeadline, TargetError};
use crate::resilience::DeadlineBody;

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Errors reported by the server lifecycle.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("must call listen() before serve()")]
    NotListening,
    #[error("server is already listening on {0}")]
    AlreadyListening(SocketAddr),
    #[error("server is already serving on {0}")]
    AlreadyServing(SocketAddr),
    #[error("server has been shut down")]
    Closed,
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error("shutdown grace period elapsed with {remaining} connection(s) still open")]
    Forced { remaining: usize },
}

#[derive(Debug)]
enum ServerState {
    Unbound,
    Bound(Listener),
    Serving(SocketAddr),
    Closed(Option<SocketAddr>),
}

impl ServerState {
    fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            ServerState::Unbound => None,
            ServerState::Bound(listener) => Some(listener.local_addr()),
            ServerState::Serving(addr) => Some(*addr),
            ServerState::Closed(addr) => *addr,
        }
    }
}

/// The client-facing HTTP server.
///
/// All methods take `&self`; `shutdown` is meant to be called from another
/// task while `serve` is running.
pub struct HttpServer {
    engine: Arc<ForwardingEngine>,
    router: Router,
    timeouts: ServerTimeouts,
    state: Mutex<ServerState>,
    accepting: watch::Sender<bool>,
    shutdown: Shutdown,
    tracker: ConnectionTracker,
}

impl HttpServer {
    pub fn new(engine: Arc<ForwardingEngine>, timeouts: ServerTimeouts) -> Self {
        let router = engine.router();
        let (accepting, _) = watch::channel(false);
        Self {
            engine,
            router,
            timeouts,
            state: Mutex::new(ServerState::Unbound),
            accepting,
            shutdown: Shutdown::new(),
            tracker: ConnectionTracker::new(),
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Result<Self, TargetError> {
        let engine = ForwardingEngine::from_config(config)?;
        Ok(Self::new(Arc::new(engine), config.server))
    }

    pub fn engine(&self) -> &Arc<ForwardingEngine> {
        &self.engine
    }

    fn lock_state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind the listening socket. Returns the resolved address.
    pub async fn listen(&self, address: &str) -> Result<SocketAddr, ServerError> {
        Self::check_unbound(&self.lock_state())?;

        let listener = Listener::bind(address).await?;
        let addr = listener.local_addr();

        let mut state = self.lock_state();
        Self::check_unbound(&state)?;
        *state = ServerState::Bound(listener);
        Ok(addr)
    }

    fn check_unbound(state: &ServerState) -> Result<(), ServerError> {
        match state {
            ServerState::Unbound => Ok(()),
            ServerState::Bound(listener) => {
                Err(ServerError::AlreadyListening(listener.local_addr()))
            }
            ServerState::Serving(addr) => Err(ServerError::AlreadyListening(*addr)),
            ServerState::Closed(_) => Err(ServerError::Closed),
        }
    }

    /// Accept connections until shutdown.
    ///
    /// Returns `Ok(())` once shutdown has stopped the accept loop.
    pub async fn serve(&self) -> Result<(), ServerError> {
        let (listener, addr) = {
            let mut state = self.lock_state();
            let addr = match &*state {
                ServerState::Bound(listener) => listener.local_addr(),
                ServerState::Unbound => return Err(ServerError::NotListening),
                ServerState::Serving(addr) => return Err(ServerError::AlreadyServing(*addr)),
                ServerState::Closed(_) => return Err(ServerError::Closed),
            };
            match std::mem::replace(&mut *state, ServerState::Serving(addr)) {
                ServerState::Bound(listener) => {
                    self.accepting.send_replace(true);
                    (listener, addr)
                }
                _ => return Err(ServerError::NotListening),
            }
        };

        tracing::info!(
            address = %addr,
            target = %self.engine.target(),
            origin_tls = self.engine.target().is_tls(),
            "HTTP server starting"
        );

        let mut signal = self.shutdown.subscribe();
        let mut backoff: Option<Duration> = None;

        loop {
            let accepted = tokio::select! {
                _ = signal.recv() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    backoff = None;
                    self.spawn_connection(stream, peer);
                }
                Err(e) => {
                    let delay = backoff
                        .map_or(ACCEPT_BACKOFF_MIN, |d| (d * 2).min(ACCEPT_BACKOFF_MAX));
                    backoff = Some(delay);
                    tracing::warn!(error = %e, retry_in = ?delay, "Accept failed");

                    tokio::select! {
                        _ = signal.recv() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        drop(listener);
        self.accepting.send_replace(false);
        tracing::info!(address = %addr, "HTTP server stopped accepting connections");
        Ok(())
    }

    /// `listen` followed by `serve`.
    pub async fn listen_and_serve(&self, address: &str) -> Result<(), ServerError> {
        self.listen(address).await?;
        self.serve().await
    }

    /// Stop accepting and wait for in-flight requests.
    ///
    /// Waits at most `min(deadline, shutdown_grace)`. Connections still open
    /// after that are closed and reported as [`ServerError::Forced`].
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), ServerError> {
        let grace = deadline.min(self.timeouts.shutdown_grace());
        let until = Instant::now() + grace;

        if self.shutdown.trigger(until) {
            tracing::info!(
                grace = ?grace,
                active_connections = self.tracker.active_count(),
                "Shutting down"
            );
        }

        {
            let mut state = self.lock_state();
            let addr = state.local_addr();
            *state = ServerState::Closed(addr);
        }

        let mut accepting = self.accepting.subscribe();
        let drained = tokio::time::timeout_at(until, async {
            let _ = accepting.wait_for(|accepting| !accepting).await;
            self.tracker.drained().await;
        })
        .await;

        if drained.is_ok() {
            tracing::info!("All connections drained");
            return Ok(());
        }

        let remaining = self.tracker.active_count();
        self.shutdown.force();
        tracing::warn!(remaining, "Grace period elapsed, closing remaining connections");
        Err(ServerError::Forced { remaining })
    }

    /// The bound address, once `listen` has succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock_state().local_addr()
    }

    /// `http://` URL of the bound address.
    pub fn url(&self) -> Option<String> {
        self.local_addr().map(|addr| format!("http://{}", addr))
    }

    pub fn active_connections(&self) -> usize {
        self.tracker.active_count()
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let guard = self.tracker.track();
        let span = tracing::debug_span!(
            "connection",
            connection_id = %guard.id(),
            peer_addr = %peer
        );
        let router = self.router.clone();
        let timeouts = self.timeouts;
        let signal = self.shutdown.subscribe();

        tokio::spawn(
            async move {
                tracing::trace!("Connection accepted");
                serve_connection(stream, peer, router, timeouts, signal).await;
                drop(guard);
            }
            .instrument(span),
        );
    }
}

impl std::fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServer")
            .field("target", self.engine.target())
            .field("local_addr", &self.local_addr())
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    router: Router,
    timeouts: ServerTimeouts,
    mut signal: ShutdownSignal,
) {
    let clock = ConnectionClock::new(timeouts.header_read(), timeouts.idle());
    let io = TokioIo::new(ActivityIo::new(stream, Arc::clone(&clock)));
    let service = {
        let clock = Arc::clone(&clock);
        service_fn(move |request| {
            handle_request(request, peer, router.clone(), Arc::clone(&clock), timeouts)
        })
    };

    let conn = http1::Builder::new().serve_connection(io, service);
    tokio::pin!(conn);

    let mut phase = ShutdownPhase::Running;
    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    tracing::debug!(error = %e, "Connection ended with error");
                }
                break;
            }
            expiry = clock.expired() => {
                tracing::debug!(expiry = ?expiry, "Connection timed out");
                break;
            }
            next = signal.changed_from(phase) => {
                phase = next;
                match next {
                    ShutdownPhase::Draining { .. } => conn.as_mut().graceful_shutdown(),
                    ShutdownPhase::Forced => {
                        tracing::debug!("Connection closed by forced shutdown");
                        break;
                    }
                    ShutdownPhase::Running => {}
                }
            }
        }
    }
}

type ServerBody = TrackedBody<DeadlineBody<Body>>;

/// The write deadline is handed to the engine as a [`ResponseDeadline`].
async fn handle_request(
    mut request: Request<Incoming>,
    peer: SocketAddr,
    router: Router,
    clock: Arc<ConnectionClock>,
    timeouts: ServerTimeouts,
) -> Result<Response<ServerBody>, Infallible> {
    let head_started = clock.request_started();
    let exchange = clock.exchange();
    let write_deadline = Instant::now() + timeouts.write();
    let read_deadline = head_started + timeouts.read();

    request.extensions_mut().insert(ConnectInfo(peer));
    request
        .extensions_mut()
        .insert(ResponseDeadline(write_deadline));
    let request = request.map(|body| Body::new(DeadlineBody::read(body, read_deadline)));

    let response = router.oneshot(request).await?;
    Ok(response.map(|body| TrackedBody::new(DeadlineBody::write(body, write_deadline), exchange)))
}
