//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check the bind address is a usable host:port
//! - Check the target is an absolute http/https URL with a host
//! - Validate value ranges (timeouts > 0)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before any socket is opened

use thiserror::Error;

use crate::config::schema::ProxyConfig;
use crate::net::listener::normalize_bind_address;
use crate::proxy::target::{Target, TargetError};

/// A single semantic problem with a configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid bind address {address:?}: {reason}")]
    BindAddress { address: String, reason: String },

    #[error("invalid target url: {0}")]
    Target(#[from] TargetError),

    #[error("{field} must be greater than zero")]
    ZeroTimeout { field: &'static str },
}

/// Validate a configuration, collecting every problem found.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if let Err(reason) = check_bind_address(&config.listener.bind_address) {
        errors.push(ValidationError::BindAddress {
            address: config.listener.bind_address.clone(),
            reason,
        });
    }

    if let Err(e) = Target::parse(&config.target.url) {
        errors.push(ValidationError::Target(e));
    }

    let timeouts = [
        ("server.header_read_ms", config.server.header_read_ms),
        ("server.read_ms", config.server.read_ms),
        ("server.write_ms", config.server.write_ms),
        ("server.idle_ms", config.server.idle_ms),
        ("server.shutdown_grace_ms", config.server.shutdown_grace_ms),
        ("transport.connect_ms", config.transport.connect_ms),
        ("transport.keepalive_ms", config.transport.keepalive_ms),
        ("transport.tls_handshake_ms", config.transport.tls_handshake_ms),
        ("transport.response_header_ms", config.transport.response_header_ms),
        ("transport.expect_continue_ms", config.transport.expect_continue_ms),
        ("transport.pool_idle_ms", config.transport.pool_idle_ms),
    ];
    errors.extend(
        timeouts
            .into_iter()
            .filter(|(_, value)| *value == 0)
            .map(|(field, _)| ValidationError::ZeroTimeout { field }),
    );

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_bind_address(address: &str) -> Result<(), String> {
    let normalized = normalize_bind_address(address);
    let (host, port) = normalized
        .rsplit_once(':')
        .ok_or_else(|| "expected host:port".to_string())?;

    if host.is_empty() {
        return Err("missing host".to_string());
    }
    if host.contains("://") || host.contains('/') {
        return Err("must not include a scheme or path".to_string());
    }
    port.parse::<u16>()
        .map_err(|_| format!("invalid port {port:?}"))?;

    Ok(())
}
