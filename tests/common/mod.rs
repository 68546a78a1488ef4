//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::Router;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;

use upstream_proxy::config::{ServerTimeouts, StreamingConfig, TransportConfig};
use upstream_proxy::proxy::{client_tls_config, Transport};
use upstream_proxy::{ForwardingEngine, HttpServer, Target};

const CA_PEM: &[u8] = include_bytes!("../fixtures/ca.pem");
const ORIGIN_CERT_PEM: &[u8] = include_bytes!("../fixtures/origin.pem");
const ORIGIN_KEY_PEM: &[u8] = include_bytes!("../fixtures/origin-key.pem");

/// Serve `router` as an origin on an ephemeral port.
pub async fn start_origin(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    addr
}

/// Start an origin that answers every request with the same raw bytes and
/// then closes the connection.
pub async fn start_raw_origin(response: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                read_request_head(&mut socket).await;
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

/// Start an origin that accepts connections and reads requests but never
/// answers.
pub async fn start_silent_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                read_request_head(&mut socket).await;
                tokio::time::sleep(Duration::from_secs(60)).await;
            });
        }
    });
    addr
}

async fn read_request_head(socket: &mut tokio::net::TcpStream) {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
}

/// Serve `router` over TLS with the test certificate (valid for
/// `127.0.0.1` and `localhost`). The origin offers only the `alpn`
/// protocols and waits `handshake_delay` before each handshake.
pub async fn start_tls_origin(
    router: Router,
    alpn: &[&[u8]],
    handshake_delay: Duration,
) -> SocketAddr {
    let certs = rustls_pemfile::certs(&mut &ORIGIN_CERT_PEM[..])
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    let key = rustls_pemfile::private_key(&mut &ORIGIN_KEY_PEM[..])
        .unwrap()
        .expect("origin key");
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .unwrap();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            let router = router.clone();
            tokio::spawn(async move {
                tokio::time::sleep(handshake_delay).await;
                let Ok(tls) = acceptor.accept(tcp).await else {
                    return;
                };
                let h2 = tls.get_ref().1.alpn_protocol() == Some(&b"h2"[..]);
                let service = service_fn(move |request: http::Request<Incoming>| {
                    router.clone().oneshot(request.map(Body::new))
                });
                let io = TokioIo::new(tls);
                if h2 {
                    let _ = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
                        .serve_connection(io, service)
                        .await;
                } else {
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service)
                        .await;
                }
            });
        }
    });
    addr
}

/// Trust store holding only the test CA.
pub fn test_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut &CA_PEM[..]) {
        roots.add(cert.unwrap()).unwrap();
    }
    roots
}

/// An address with nothing listening on it.
pub async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

pub fn engine(target: &str) -> Arc<ForwardingEngine> {
    Arc::new(ForwardingEngine::with_defaults(Target::parse(target).unwrap()))
}

pub fn engine_with_transport(target: &str, transport: TransportConfig) -> Arc<ForwardingEngine> {
    Arc::new(ForwardingEngine::new(
        Target::parse(target).unwrap(),
        transport,
        StreamingConfig::default(),
    ))
}

/// Engine for an `https` target signed by the test CA.
pub fn tls_engine(target: &str, transport: TransportConfig) -> Arc<ForwardingEngine> {
    let tls = Arc::new(client_tls_config(test_roots()));
    Arc::new(ForwardingEngine::with_transport(
        Target::parse(target).unwrap(),
        Transport::with_tls(transport, tls),
        StreamingConfig::default(),
    ))
}

/// A proxy that is listening and serving in a background task.
pub struct RunningProxy {
    pub server: Arc<HttpServer>,
    pub serving: tokio::task::JoinHandle<Result<(), upstream_proxy::ServerError>>,
}

impl RunningProxy {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.server.url().unwrap(), path)
    }

    pub fn addr(&self) -> SocketAddr {
        self.server.local_addr().unwrap()
    }
}

pub async fn start_proxy_with(
    engine: Arc<ForwardingEngine>,
    timeouts: ServerTimeouts,
) -> RunningProxy {
    let server = Arc::new(HttpServer::new(engine, timeouts));
    server.listen("127.0.0.1:0").await.unwrap();

    let serving = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.serve().await }
    });
    RunningProxy { server, serving }
}

pub async fn start_proxy(target: &str) -> RunningProxy {
    start_proxy_with(engine(target), ServerTimeouts::default()).await
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}
