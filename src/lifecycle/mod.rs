//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     trigger → Draining (stop accept, finish in-flight) → Forced (drop the rest)
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → HttpServer::shutdown with the configured grace
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop accept, drain, close
//! - Shutdown has a deadline: forced close after it

pub mod shutdown;
pub mod signals;

pub use shutdown::{Shutdown, ShutdownPhase, ShutdownSignal};
pub use signals::{shutdown_signal, ShutdownRequest};
