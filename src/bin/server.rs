//! Server binary: parses flags/env, selects a storage backend, and serves
//! the HTTP and (optionally) RPC ingress until a shutdown signal.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use ipnet::IpNet;
use mon::server::app::{self, ServerConfig};
use tracing_subscriber::EnvFilter;

/// Telemetry ingest server: accepts metric updates over HTTP and/or RPC,
/// aggregates them (gauges replace, counters accumulate), and persists
/// them to the configured storage backend.
#[derive(Parser, Debug)]
#[command(name = "server")]
struct Args {
    /// HTTP listen address.
    #[arg(short = 'a', long, env = "ADDRESS", default_value = "localhost:8080")]
    addr: String,

    /// RPC listen address; omit to disable the RPC entrypoint entirely.
    #[arg(long, env = "GRPC_ADDRESS")]
    grpc_addr: Option<String>,

    /// Logging level passed straight to `tracing_subscriber::EnvFilter`.
    #[arg(short = 'l', long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Periodic dump interval for the file backend, in seconds; 0 dumps
    /// synchronously after every write.
    #[arg(short = 'i', long = "store-interval", env = "STORE_INTERVAL", default_value_t = 300)]
    store_interval: u64,

    /// File backend dump path. Selects the file backend when set and no
    /// database DSN is configured.
    #[arg(short = 'f', long = "file-storage-path", env = "FILE_STORAGE_PATH")]
    file_storage_path: Option<PathBuf>,

    /// Restore prior state from the file backend's dump on startup.
    #[arg(short = 'r', long, env = "RESTORE", default_value_t = true)]
    restore: bool,

    /// Postgres DSN. Selects the relational backend when set, taking
    /// precedence over the file backend.
    #[arg(short = 'd', long = "database-dsn", env = "DATABASE_DSN")]
    database_dsn: Option<String>,

    /// HMAC key for verifying inbound and signing outbound bodies.
    #[arg(short = 'k', long, env = "KEY")]
    key: Option<String>,

    /// CIDR of the only subnet allowed to submit metrics.
    #[arg(short = 't', long = "trusted-subnet", env = "TRUSTED_SUBNET")]
    trusted_subnet: Option<IpNet>,

    /// PEM-encoded RSA private key used to decrypt inbound payloads.
    #[arg(long = "crypto-key", env = "CRYPTO_KEY")]
    private_key_path: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&args.log_level))
        .with_target(false)
        .compact()
        .init();

    let private_key_pem = match &args.private_key_path {
        Some(path) => Some(tokio::fs::read_to_string(path).await?),
        None => None,
    };

    let cfg = ServerConfig {
        http_addr: resolve_addr(&args.addr)?,
        rpc_addr: args.grpc_addr.as_deref().map(resolve_addr).transpose()?,
        database_dsn: args.database_dsn,
        file_storage_path: args.file_storage_path,
        store_interval: Duration::from_secs(args.store_interval),
        restore: args.restore,
        hash_key: args.key,
        trusted_subnet: args.trusted_subnet,
        private_key_pem,
    };

    app::run(cfg).await
}

fn resolve_addr(addr: &str) -> anyhow::Result<std::net::SocketAddr> {
    use std::net::ToSocketAddrs;
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(|| anyhow::anyhow!("could not resolve address: {addr}"))
}
