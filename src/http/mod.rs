//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection (net::listener)
//!     → server.rs (hyper HTTP/1.1 connection, per-connection timeouts)
//!     → axum Router (proxy::ForwardingEngine::router)
//!     → Send to client
//! ```

pub mod server;

pub use server::{HttpServer, ServerError};
