//! Outbound transport to the origin.
//!
//! # Responsibilities
//! - Pool connections to the origin (HTTP/1.1, and HTTP/2 when negotiated)
//! - Bound every wait: connect, TLS handshake, response headers
//! - Keep transport errors distinct so the engine can map them to 502
//!
//! # Design Decisions
//! - One `Transport` is shared by all requests; the pool is its only mutable
//!   state and synchronizes itself
//! - TLS is negotiated by our own connector so the handshake has its own
//!   deadline separate from the TCP connect timeout
//! - The response-header wait starts once a connection is checked out and
//!   the body is uploaded, so connect and upload keep their own bounds

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use http::uri::Scheme;
use http::{Request, Response, Uri};
use hyper::body::Incoming;
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper_util::client::legacy::connect::{
    capture_connection, Connected, Connection, HttpConnector,
};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::{sleep_until, Instant};
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tower::{Service, ServiceExt};

use crate::config::TransportConfig;
use crate::proxy::body::{BoxError, UploadBody};

/// Request body type accepted by the transport.
pub type OutboundBody = UploadBody<axum::body::Body>;

/// Failure to establish a connection to the origin.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connect to {host} failed")]
    Tcp {
        host: String,
        #[source]
        source: BoxError,
    },

    #[error("TLS handshake with {host} timed out after {timeout:?}")]
    TlsHandshakeTimeout { host: String, timeout: Duration },

    #[error("TLS handshake with {host} failed")]
    Tls {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("{0:?} is not a valid TLS server name")]
    ServerName(String),
}

/// Failure to obtain a response head from the origin.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("origin did not start responding within {0:?}")]
    ResponseHeaderTimeout(Duration),

    #[error("response deadline passed before the origin responded")]
    Deadline,

    #[error("origin request failed")]
    Request(#[from] hyper_util::client::legacy::Error),
}

impl TransportError {
    /// Whether the failure happened while connecting.
    pub fn is_connect(&self) -> bool {
        matches!(self, TransportError::Request(e) if e.is_connect())
    }

    /// The error and all of its sources, for logs.
    pub fn describe(&self) -> String {
        let mut message = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(e) = source {
            message.push_str(": ");
            message.push_str(&e.to_string());
            source = std::error::Error::source(e);
        }
        message
    }
}

/// Connection to the origin, plaintext or TLS.
#[derive(Debug)]
pub enum OriginStream {
    Plain(TokioIo<TcpStream>),
    Tls(TokioIo<TlsStream<TcpStream>>),
}

impl Read for OriginStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            OriginStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            OriginStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl Write for OriginStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            OriginStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            OriginStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            OriginStream::Plain(s) => Pin::new(s).poll_flush(cx),
            OriginStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            OriginStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            OriginStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            OriginStream::Plain(s) => s.is_write_vectored(),
            OriginStream::Tls(s) => s.is_write_vectored(),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            OriginStream::Plain(s) => Pin::new(s).poll_write_vectored(cx, bufs),
            OriginStream::Tls(s) => Pin::new(s).poll_write_vectored(cx, bufs),
        }
    }
}

impl Connection for OriginStream {
    fn connected(&self) -> Connected {
        match self {
            OriginStream::Plain(s) => s.connected(),
            OriginStream::Tls(s) => {
                let (_, session) = s.inner().get_ref();
                if session.alpn_protocol() == Some(&b"h2"[..]) {
                    Connected::new().negotiated_h2()
                } else {
                    Connected::new()
                }
            }
        }
    }
}

/// Connector that dials TCP and, for `https` targets, performs the TLS
/// handshake under its own deadline.
#[derive(Clone)]
pub struct OriginConnector {
    http: HttpConnector,
    tls: TlsConnector,
    tls_handshake_timeout: Duration,
}

/// TLS settings for origin connections trusting `roots`, offering `h2` and
/// `http/1.1` via ALPN.
pub fn client_tls_config(roots: RootCertStore) -> ClientConfig {
    let mut tls_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    tls_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    tls_config
}

/// [`client_tls_config`] over the Mozilla root set.
pub fn default_tls_config() -> ClientConfig {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    client_tls_config(roots)
}

impl OriginConnector {
    pub fn new(config: &TransportConfig) -> Self {
        Self::with_tls(config, Arc::new(default_tls_config()))
    }

    pub fn with_tls(config: &TransportConfig, tls: Arc<ClientConfig>) -> Self {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(Some(config.connect()));
        http.set_keepalive(Some(config.keepalive()));
        http.set_nodelay(true);

        Self {
            http,
            tls: TlsConnector::from(tls),
            tls_handshake_timeout: config.tls_handshake(),
        }
    }
}

impl Service<Uri> for OriginConnector {
    type Response = OriginStream;
    type Error = ConnectError;
    type Future = Pin<Box<dyn Future<Output = Result<OriginStream, ConnectError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let http = self.http.clone();
        let tls = self.tls.clone();
        let handshake_timeout = self.tls_handshake_timeout;

        Box::pin(async move {
            let is_tls = uri.scheme() == Some(&Scheme::HTTPS);
            let host = uri
                .host()
                .unwrap_or_default()
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string();

            let tcp = http
                .oneshot(uri)
                .await
                .map_err(|e| ConnectError::Tcp {
                    host: host.clone(),
                    source: e.into(),
                })?;

            if !is_tls {
                return Ok(OriginStream::Plain(tcp));
            }

            let server_name = ServerName::try_from(host.clone())
                .map_err(|_| ConnectError::ServerName(host.clone()))?;

            let stream = tokio::time::timeout(
                handshake_timeout,
                tls.connect(server_name, tcp.into_inner()),
            )
            .await
            .map_err(|_| ConnectError::TlsHandshakeTimeout {
                host: host.clone(),
                timeout: handshake_timeout,
            })?
            .map_err(|source| ConnectError::Tls {
                host: host.clone(),
                source,
            })?;

            tracing::trace!(host = %host, "TLS session established with origin");
            Ok(OriginStream::Tls(TokioIo::new(stream)))
        })
    }
}

/// Pooled client for the origin. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct Transport {
    client: Client<OriginConnector, OutboundBody>,
    config: TransportConfig,
}

impl Transport {
    pub fn new(config: TransportConfig) -> Self {
        Self::with_tls(config, Arc::new(default_tls_config()))
    }

    /// Transport whose `https` connections use `tls` instead of the default
    /// Mozilla roots.
    pub fn with_tls(config: TransportConfig, tls: Arc<ClientConfig>) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(config.pool_idle())
            .pool_timer(TokioTimer::new())
            .build(OriginConnector::with_tls(&config, tls));

        Self { client, config }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Send a request and wait for the response head.
    ///
    /// The response-header timeout starts once a pooled connection has been
    /// obtained and `uploaded` has resolved. `deadline`, when set, bounds the
    /// whole wait.
    pub async fn send(
        &self,
        mut request: Request<OutboundBody>,
        uploaded: oneshot::Receiver<()>,
        deadline: Option<Instant>,
    ) -> Result<Response<Incoming>, TransportError> {
        let mut connection = capture_connection(&mut request);
        let response = self.client.request(request);
        tokio::pin!(response);

        let cutoff = async {
            match deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(cutoff);

        let ready = async {
            connection.wait_for_connection_metadata().await;
            let _ = uploaded.await;
        };

        tokio::select! {
            biased;
            result = &mut response => return result.map_err(TransportError::from),
            _ = &mut cutoff => return Err(TransportError::Deadline),
            _ = ready => {}
        }

        let timeout = self.config.response_header();
        tokio::select! {
            biased;
            result = &mut response => result.map_err(TransportError::from),
            _ = &mut cutoff => Err(TransportError::Deadline),
            _ = sleep_until(Instant::now() + timeout) => {
                Err(TransportError::ResponseHeaderTimeout(timeout))
            }
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
