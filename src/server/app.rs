//! Server lifecycle glue: builds the storage backend selected by
//! configuration, wires the shared use-case into both the HTTP and RPC
//! entrypoints, and runs until an INT/TERM/QUIT signal, giving in-flight
//! work a fixed deadline to finish before the storage backend closes.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ipnet::IpNet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::codec::crypto::Decryptor;
use crate::error::AppError;
use crate::server::http::{self, AppState, HttpConfig};
use crate::server::rpc;
use crate::storage::{FileStorage, MemoryStorage, RelationalStorage, Storage};
use crate::usecase::MetricUseCase;

/// Grace period for in-flight requests after a shutdown signal, matching
/// the reference server's fixed shutdown deadline.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(15);

pub struct ServerConfig {
    pub http_addr: SocketAddr,
    pub rpc_addr: Option<SocketAddr>,
    pub database_dsn: Option<String>,
    pub file_storage_path: Option<PathBuf>,
    pub store_interval: Duration,
    pub restore: bool,
    pub hash_key: Option<String>,
    pub trusted_subnet: Option<IpNet>,
    pub private_key_pem: Option<String>,
}

/// Selects a backend per the fixed precedence: relational if a DSN is
/// configured, else file-persisted if a path is configured, else in-memory.
/// Returns the trait object used everywhere plus the concrete file handle
/// (if any), since only the file backend needs a background dump loop.
async fn build_storage(cfg: &ServerConfig) -> Result<(Arc<dyn Storage>, Option<Arc<FileStorage>>), AppError> {
    if let Some(dsn) = &cfg.database_dsn {
        info!("using relational storage backend");
        return Ok((Arc::new(RelationalStorage::connect(dsn).await?), None));
    }
    if let Some(path) = &cfg.file_storage_path {
        info!(path = %path.display(), "using file-persisted storage backend");
        let file = Arc::new(
            FileStorage::new(crate::storage::file::FileStorageConfig {
                store_interval: cfg.store_interval,
                file_path: path.clone(),
                restore: cfg.restore,
            })
            .await?,
        );
        return Ok((file.clone(), Some(file)));
    }
    info!("using in-memory storage backend");
    Ok((Arc::new(MemoryStorage::new()), None))
}

pub async fn run(cfg: ServerConfig) -> anyhow::Result<()> {
    let (storage, file_storage) = build_storage(&cfg).await?;
    let usecase = Arc::new(MetricUseCase::new(storage.clone()));

    let token = CancellationToken::new();

    let dump_loop = file_storage.map(|file| {
        let token = token.clone();
        tokio::spawn(async move { file.run_dump_loop(token).await })
    });

    let decryptor = cfg
        .private_key_pem
        .as_deref()
        .map(Decryptor::from_private_key_pem)
        .transpose()?;

    let http_addr = cfg.http_addr;
    let rpc_addr = cfg.rpc_addr;
    let trusted_subnet = cfg.trusted_subnet;

    let http_state = Arc::new(AppState {
        usecase: usecase.clone(),
        config: HttpConfig { hash_key: cfg.hash_key.clone(), trusted_subnet, decryptor },
    });
    let http_router = http::router(http_state);

    let http_token = token.clone();
    let http_server = tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(http_addr).await?;
        info!(addr = %http_addr, "http server listening");
        axum::serve(listener, http_router)
            .with_graceful_shutdown(async move { http_token.cancelled().await })
            .await
            .map_err(anyhow::Error::from)
    });

    let rpc_server = rpc_addr.map(|addr| {
        let rpc_router = rpc::router(usecase.clone(), trusted_subnet);
        let rpc_token = token.clone();
        tokio::spawn(async move {
            info!(%addr, "rpc server listening");
            rpc::serve(rpc_router, addr, async move { rpc_token.cancelled().await }).await
        })
    });

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining in-flight work");
    token.cancel();

    let drain = async {
        let _ = http_server.await;
        if let Some(rpc_server) = rpc_server {
            let _ = rpc_server.await;
        }
        if let Some(dump_loop) = dump_loop {
            let _ = dump_loop.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_DEADLINE, drain).await.is_err() {
        warn!(deadline = ?SHUTDOWN_DEADLINE, "shutdown deadline exceeded, forcing exit");
    }

    if let Err(e) = storage.close().await {
        warn!(error = %e, "failed to close storage cleanly");
    }
    info!("server shut down");
    Ok(())
}

/// Waits for SIGINT, SIGTERM, or SIGQUIT (Unix) / Ctrl-C (elsewhere).
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut quit = signal(SignalKind::quit()).expect("failed to install SIGQUIT handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
            _ = quit.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
