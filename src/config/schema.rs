//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the forwarding proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// The single origin every request is forwarded to.
    pub target: TargetConfig,

    /// Client-facing connection timeouts.
    pub server: ServerTimeouts,

    /// Outbound transport timeouts.
    pub transport: TransportConfig,

    /// Response streaming behavior.
    pub streaming: StreamingConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "127.0.0.1:8001", or ":0"-style ephemeral ports).
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8001".to_string(),
        }
    }
}

/// Origin server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Absolute URL of the origin (scheme is required).
    pub url: String,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8000".to_string(),
        }
    }
}

/// Protective timeouts applied to every client connection.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerTimeouts {
    /// Time allowed for a client to finish sending request headers.
    pub header_read_ms: u64,

    /// Time allowed to read a full request, headers and body.
    pub read_ms: u64,

    /// Time allowed to write a full response once the request head is read.
    pub write_ms: u64,

    /// Keep-alive connections with no activity for this long are closed.
    pub idle_ms: u64,

    /// Upper bound on how long shutdown waits for in-flight requests.
    pub shutdown_grace_ms: u64,
}

impl ServerTimeouts {
    pub fn header_read(&self) -> Duration {
        Duration::from_millis(self.header_read_ms)
    }

    pub fn read(&self) -> Duration {
        Duration::from_millis(self.read_ms)
    }

    pub fn write(&self) -> Duration {
        Duration::from_millis(self.write_ms)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_millis(self.idle_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Default for ServerTimeouts {
    fn default() -> Self {
        Self {
            header_read_ms: 2_000,
            read_ms: 5_000,
            write_ms: 10_000,
            idle_ms: 30_000,
            shutdown_grace_ms: 10_000,
        }
    }
}

/// Outbound transport configuration.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct TransportConfig {
    /// TCP connection establishment timeout.
    pub connect_ms: u64,

    /// TCP keep-alive probe interval on origin connections.
    pub keepalive_ms: u64,

    /// TLS handshake timeout (encrypted targets only).
    pub tls_handshake_ms: u64,

    /// Time allowed for the origin to start sending response headers.
    pub response_header_ms: u64,

    /// How long a body announced with `Expect: 100-continue` is withheld.
    pub expect_continue_ms: u64,

    /// Idle pooled origin connections are evicted after this long.
    pub pool_idle_ms: u64,
}

impl TransportConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_millis(self.keepalive_ms)
    }

    pub fn tls_handshake(&self) -> Duration {
        Duration::from_millis(self.tls_handshake_ms)
    }

    pub fn response_header(&self) -> Duration {
        Duration::from_millis(self.response_header_ms)
    }

    pub fn expect_continue(&self) -> Duration {
        Duration::from_millis(self.expect_continue_ms)
    }

    pub fn pool_idle(&self) -> Duration {
        Duration::from_millis(self.pool_idle_ms)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_ms: 30_000,
            keepalive_ms: 30_000,
            tls_handshake_ms: 10_000,
            response_header_ms: 10_000,
            expect_continue_ms: 1_000,
            pool_idle_ms: 90_000,
        }
    }
}

/// Response streaming configuration.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct StreamingConfig {
    /// Maximum time response bytes may sit buffered before being written to
    /// the client. Zero writes every chunk as soon as it arrives.
    pub flush_interval_ms: u64,
}

impl StreamingConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 10,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable output for development.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error), used when `RUST_LOG` is unset.
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_policy() {
        let config = ProxyConfig::default();
        assert_eq!(config.server.header_read(), Duration::from_secs(2));
        assert_eq!(config.server.read(), Duration::from_secs(5));
        assert_eq!(config.server.write(), Duration::from_secs(10));
        assert_eq!(config.server.idle(), Duration::from_secs(30));
        assert_eq!(config.server.shutdown_grace(), Duration::from_secs(10));

        assert_eq!(config.transport.connect(), Duration::from_secs(30));
        assert_eq!(config.transport.keepalive(), Duration::from_secs(30));
        assert_eq!(config.transport.tls_handshake(), Duration::from_secs(10));
        assert_eq!(config.transport.response_header(), Duration::from_secs(10));
        assert_eq!(config.transport.expect_continue(), Duration::from_secs(1));

        assert_eq!(config.streaming.flush_interval(), Duration::from_millis(10));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: ProxyConfig = toml::from_str(
            r#"
            [target]
            url = "https://origin.internal"

            [server]
            write_ms = 2500

            [observability]
            log_format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.target.url, "https://origin.internal");
        assert_eq!(config.server.write_ms, 2500);
        assert_eq!(config.server.read_ms, 5_000);
        assert_eq!(config.listener.bind_address, "127.0.0.1:8001");
        assert_eq!(config.observability.log_format, LogFormat::Json);
    }
}
