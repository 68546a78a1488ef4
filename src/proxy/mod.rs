//! Request forwarding subsystem.
//!
//! # Data Flow
//! ```text
//! Inbound request (from http::server)
//!     → forwarder.rs (ForwardingEngine, one per server)
//!     → target.rs (rewrite URI onto the origin)
//!     → headers.rs (hop-by-hop stripping, X-Forwarded-*)
//!     → transport.rs (pooled client, connect/TLS/response-header timeouts)
//!     → body.rs (streamed relay with periodic flushing)
//!     → Response to client
//! ```
//!
//! # Design Decisions
//! - Exactly one origin; no routing, balancing or retries
//! - Bodies are never buffered whole in either direction
//! - Transport failures before a response head map to 502 with an empty body

pub mod body;
pub mod forwarder;
pub mod headers;
pub mod target;
pub mod transport;

pub use body::FlushPolicy;
pub use forwarder::{ForwardingEngine, ResponseDeadline};
pub use target::{Target, TargetError};
pub use transport::{client_tls_config, Transport, TransportError};
