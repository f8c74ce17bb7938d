//! Agent binary: parses flags/env, starts the collection + reporting
//! pipeline, and runs until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use mon::agent::app::{self, AgentConfig};
use mon::agent::reporter::{HttpTransport, HttpTransportConfig, ReporterConfig, RpcTransport, Transport};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Telemetry collection agent: samples runtime and system metrics on a
/// fixed poll interval and reports them to a server on a fixed report
/// interval.
#[derive(Parser, Debug)]
#[command(name = "agent")]
struct Args {
    /// Server address for the HTTP transport.
    #[arg(short = 'a', long, env = "ADDRESS", default_value = "localhost:8080")]
    addr: String,

    /// Server address for the RPC transport; when set, takes precedence
    /// over the HTTP transport.
    #[arg(long, env = "GRPC_ADDRESS")]
    grpc_addr: Option<String>,

    /// Metrics poll interval in seconds.
    #[arg(short = 'p', long, env = "POLL_INTERVAL", default_value_t = 2)]
    poll_interval: u64,

    /// Metrics report interval in seconds.
    #[arg(short = 'r', long, env = "REPORT_INTERVAL", default_value_t = 10)]
    report_interval: u64,

    /// HMAC signing key for outbound HTTP payloads.
    #[arg(short = 'k', long, env = "KEY")]
    key: Option<String>,

    /// Number of concurrent reporting workers.
    #[arg(short = 'l', long, env = "RATE_LIMIT", default_value_t = 2)]
    rate_limit: u64,

    /// PEM-encoded RSA public key used to encrypt outbound HTTP payloads.
    #[arg(long = "crypto-key", env = "CRYPTO_KEY")]
    public_key_path: Option<String>,

    /// Logging level passed straight to `tracing_subscriber::EnvFilter`.
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&args.log_level))
        .with_target(false)
        .compact()
        .init();

    let public_key_pem = match &args.public_key_path {
        Some(path) => Some(tokio::fs::read_to_string(path).await?),
        None => None,
    };

    let transport: Arc<dyn Transport> = if let Some(grpc_addr) = &args.grpc_addr {
        Arc::new(RpcTransport::connect(grpc_addr).await?)
    } else {
        Arc::new(HttpTransport::new(HttpTransportConfig {
            addr: args.addr.clone(),
            hash_key: args.key.clone(),
            public_key_pem,
        })?)
    };

    let cfg = AgentConfig {
        poll_interval: Duration::from_secs(args.poll_interval),
        report_interval: Duration::from_secs(args.report_interval),
        reporter: ReporterConfig { rate_limit: args.rate_limit as usize },
    };

    let token = CancellationToken::new();
    let run_token = token.clone();
    let run = tokio::spawn(async move { app::run(cfg, transport, run_token).await });

    tokio::signal::ctrl_c().await?;
    token.cancel();
    run.await??;
    Ok(())
}
