//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (bind, accept)
//!     → connection.rs (id, drain tracking, header-read/idle clock)
//!     → Hand off to HTTP layer
//!
//! Connection Phases:
//!     Waiting(HeaderRead) → Active → Waiting(Idle) → ... → Closed
//! ```
//!
//! # Design Decisions
//! - Each connection is tracked so shutdown can wait for it
//! - Client-facing connections are plaintext only

pub mod connection;
pub mod listener;

pub use connection::{ConnectionClock, ConnectionTracker, Expiry};
pub use listener::{normalize_bind_address, Listener, ListenerError};
