//! Single-upstream forwarding proxy.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request   ┌──────────┐    ┌──────────┐    ┌────────────────┐
//!     ────────────────▶│   net    │───▶│  http    │───▶│     proxy      │
//!                      │ listener │    │  server  │    │ForwardingEngine│
//!                      └──────────┘    └──────────┘    └───────┬────────┘
//!                                                              │ pooled
//!                                                              ▼ transport
//!     Client Response  ┌──────────┐                    ┌────────────────┐
//!     ◀────────────────│RelayBody │◀───────────────────│     origin     │
//!                      │ (flush)  │                    │     server     │
//!                      └──────────┘                    └────────────────┘
//! ```
//!
//! Exit status is 0 after shutdown, including one that had to force
//! connections closed, and 1 on any configuration, bind or serve error.

use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;

use upstream_proxy::config::{read_config, validate_config, LogFormat, ProxyConfig};
use upstream_proxy::lifecycle::shutdown_signal;
use upstream_proxy::observability::init_logging;
use upstream_proxy::{HttpServer, ServerError};

#[derive(Parser, Debug)]
#[command(name = "upstream-proxy", version, about = "Forward HTTP traffic to a single origin")]
struct Args {
    /// Address to listen on (host:port or :port).
    #[arg(short, long)]
    address: Option<String>,

    /// Origin URL every request is forwarded to (http:// or https://).
    #[arg(short, long)]
    target: Option<String>,

    /// Optional TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log output format.
    #[arg(long, value_parser = parse_log_format)]
    log_format: Option<LogFormat>,
}

fn parse_log_format(value: &str) -> Result<LogFormat, String> {
    match value.to_ascii_lowercase().as_str() {
        "pretty" => Ok(LogFormat::Pretty),
        "json" => Ok(LogFormat::Json),
        other => Err(format!("unknown log format {other:?} (expected pretty or json)")),
    }
}

fn build_config(args: Args) -> Result<ProxyConfig, String> {
    let mut config = match &args.config {
        Some(path) => read_config(path).map_err(|e| format!("{}: {}", path.display(), e))?,
        None => ProxyConfig::default(),
    };

    if let Some(address) = args.address {
        config.listener.bind_address = address;
    }
    if let Some(target) = args.target {
        config.target.url = target;
    }
    if let Some(format) = args.log_format {
        config.observability.log_format = format;
    }

    validate_config(&config).map_err(|errors| {
        errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    })?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match build_config(Args::parse()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("upstream-proxy: invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logging(&config.observability) {
        eprintln!("upstream-proxy: failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    tracing::info!(
        bind_address = %config.listener.bind_address,
        target = %config.target.url,
        "upstream-proxy v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    let server = match HttpServer::from_config(&config) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "Invalid target");
            return ExitCode::FAILURE;
        }
    };

    let address = match server.listen(&config.listener.bind_address).await {
        Ok(address) => address,
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(address = %address, "Listening for connections");

    let served = serve_until(&server, shutdown_signal(), config.server.shutdown_grace()).await;

    match served {
        Ok(()) => {
            tracing::info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Server stopped with an error");
            ExitCode::FAILURE
        }
    }
}

/// Serve until `signal` resolves, then shut down within `grace`.
///
/// A shutdown that had to force connections closed is logged, not returned.
async fn serve_until<S: Future>(
    server: &HttpServer,
    signal: S,
    grace: Duration,
) -> Result<(), ServerError> {
    let serve = server.serve();
    tokio::pin!(serve);

    tokio::select! {
        result = &mut serve => result,
        _ = signal => {
            let (served, drained) = tokio::join!(serve, server.shutdown(grace));
            if let Err(e) = drained {
                tracing::warn!(error = %e, "Shutdown was not graceful");
            }
            served
        }
    }
}
