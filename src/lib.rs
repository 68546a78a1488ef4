//! Single-upstream HTTP forwarding proxy.
//!
//! Accepts client connections, forwards every request to one fixed origin,
//! and streams the origin's response (body and trailers) back.

// Core subsystems
pub mod config;
pub mod http;
pub mod net;
pub mod proxy;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::schema::ProxyConfig;
pub use http::{HttpServer, ServerError};
pub use lifecycle::Shutdown;
pub use proxy::{ForwardingEngine, Target};
