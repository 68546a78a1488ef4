//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Request head read:
//!     → timeouts.rs (read deadline on the request body,
//!                    write deadline on handler + response body)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every client-facing wait has a deadline
//! - No retries: a failed upstream exchange is reported as 502 once
//! - Outbound timeouts live with the transport (proxy/transport.rs)

pub mod timeouts;

pub use timeouts::{DeadlineBody, TimeoutError};
