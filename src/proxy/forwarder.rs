//! The forwarding engine: one inbound request in, one relayed response out.
//!
//! # Pipeline
//! ```text
//! inbound request
//!     → rewrite URI onto the target (target.rs)
//!     → strip hop-by-hop, add X-Forwarded-* (headers.rs)
//!     → dispatch over the pooled transport (transport.rs)
//!     → strip hop-by-hop from the response, re-announce trailers
//!     → relay body with periodic flushing, trailers last (body.rs)
//! ```
//!
//! Failures before a response head exists become `502 Bad Gateway`. Failures
//! after it (origin or client going away mid-body) abort the body stream.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::response::{IntoResponse, Response};
use axum::Router;
use http::header::{self, HeaderValue};
use http::{Request, StatusCode, Version};
use hyper::body::Incoming;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tower_http::trace::TraceLayer;

use crate::config::{ProxyConfig, StreamingConfig, TransportConfig};
use crate::proxy::body::{FlushPolicy, RelayBody, UploadBody};
use crate::proxy::headers::{
    contains_token, prepare_request_headers, prepare_response_headers, set_forwarded,
};
use crate::proxy::target::{Target, TargetError};
use crate::proxy::transport::{OutboundBody, Transport};

/// Request extension bounding how long the engine may wait for the origin's
/// response head. Past it the client gets `502 Bad Gateway`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseDeadline(pub Instant);

/// Forwards every request to a single fixed origin.
///
/// Holds no per-request state: the target is read-only and the transport's
/// pool synchronizes itself, so one engine serves any number of concurrent
/// requests.
#[derive(Debug)]
pub struct ForwardingEngine {
    target: Target,
    transport: Transport,
    flush: FlushPolicy,
}

impl ForwardingEngine {
    pub fn new(target: Target, transport: TransportConfig, streaming: StreamingConfig) -> Self {
        Self::with_transport(target, Transport::new(transport), streaming)
    }

    /// Engine over an already built transport, e.g. one with its own TLS
    /// trust roots.
    pub fn with_transport(target: Target, transport: Transport, streaming: StreamingConfig) -> Self {
        Self {
            target,
            transport,
            flush: FlushPolicy::from_interval(streaming.flush_interval()),
        }
    }

    /// Engine with the default transport and flush policy.
    pub fn with_defaults(target: Target) -> Self {
        Self::new(target, TransportConfig::default(), StreamingConfig::default())
    }

    pub fn from_config(config: &ProxyConfig) -> Result<Self, TargetError> {
        let target = Target::parse(&config.target.url)?;
        Ok(Self::new(target, config.transport, config.streaming))
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn flush_policy(&self) -> FlushPolicy {
        self.flush
    }

    /// Request handler for this engine.
    ///
    /// Every method and path is forwarded. The peer address must be present
    /// as `ConnectInfo<SocketAddr>`.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .fallback(forward_handler)
            .with_state(Arc::clone(self))
            .layer(TraceLayer::new_for_http())
    }

    /// Build the outbound copy of an inbound request.
    ///
    /// Returns the request and a receiver that resolves once its body has been
    /// fully uploaded.
    pub fn rewrite(
        &self,
        request: Request<Body>,
        client_ip: IpAddr,
    ) -> Result<(Request<OutboundBody>, oneshot::Receiver<()>), http::Error> {
        let (parts, body) = request.into_parts();

        let uri = self.target.rewrite_uri(&parts.uri)?;
        let original_host = parts.headers.get(header::HOST).cloned().or_else(|| {
            parts
                .uri
                .authority()
                .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
        });
        let expect_continue = contains_token(&parts.headers, &header::EXPECT, "100-continue")
            .then(|| self.expect_continue_timeout());

        let mut headers = parts.headers;
        prepare_request_headers(&mut headers);
        set_forwarded(&mut headers, client_ip, original_host.as_ref());

        let (body, uploaded) = UploadBody::new(body, expect_continue);
        let mut outbound = Request::builder()
            .method(parts.method)
            .uri(uri)
            .version(Version::HTTP_11)
            .body(body)?;
        *outbound.headers_mut() = headers;

        Ok((outbound, uploaded))
    }

    /// Turn an origin response into the response sent to the client.
    pub fn relay(&self, response: http::Response<Incoming>) -> Response {
        let (mut parts, body) = response.into_parts();
        prepare_response_headers(&mut parts.headers);
        parts.version = Version::HTTP_11;
        parts.extensions.clear();

        let policy = FlushPolicy::for_response(self.flush, &parts.headers);
        Response::from_parts(parts, Body::new(RelayBody::new(body, policy)))
    }

    /// Forward one request and produce the client's response.
    pub async fn forward(&self, request: Request<Body>, client: SocketAddr) -> Response {
        let method = request.method().clone();
        let uri = request.uri().clone();
        let deadline = request
            .extensions()
            .get::<ResponseDeadline>()
            .map(|ResponseDeadline(at)| *at);

        let (outbound, uploaded) = match self.rewrite(request, client.ip()) {
            Ok(parts) => parts,
            Err(e) => {
                tracing::error!(
                    method = %method,
                    uri = %uri,
                    error = %e,
                    "Failed to build upstream request"
                );
                return bad_gateway();
            }
        };

        tracing::debug!(
            method = %method,
            uri = %uri,
            upstream = %outbound.uri(),
            client = %client,
            "Forwarding request"
        );

        match self.transport.send(outbound, uploaded, deadline).await {
            Ok(response) => {
                tracing::debug!(
                    method = %method,
                    uri = %uri,
                    status = response.status().as_u16(),
                    "Upstream responded"
                );
                self.relay(response)
            }
            Err(e) => {
                tracing::error!(
                    method = %method,
                    uri = %uri,
                    target = %self.target,
                    connect = e.is_connect(),
                    error = %e.describe(),
                    "Upstream error"
                );
                bad_gateway()
            }
        }
    }

    /// Upper bound on how long a request body may be held for
    /// `Expect: 100-continue`.
    pub fn expect_continue_timeout(&self) -> Duration {
        self.transport.config().expect_continue()
    }
}

fn bad_gateway() -> Response {
    StatusCode::BAD_GATEWAY.into_response()
}

async fn forward_handler(
    State(engine): State<Arc<ForwardingEngine>>,
    ConnectInfo(client): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    engine.forward(request, client).await
}
