//! File-persisted backend: wraps [`MemoryStorage`] and adds newline-delimited
//! JSON dump/restore. `store_interval == 0` dumps synchronously after every
//! `set`; otherwise a background dump loop wakes on a fixed interval and
//! performs an atomic rewrite (open-truncate-write-close). The loop observes
//! a [`CancellationToken`] and exits without a forced final dump — the final
//! dump is driven by an explicit `close()`.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::AppError;
use crate::metric::{Metric, MetricDto};
use crate::metric::MetricKey;
use crate::storage::{memory::MemoryStorage, Storage};

pub struct FileStorageConfig {
    pub store_interval: Duration,
    pub file_path: PathBuf,
    pub restore: bool,
}

/// File-persisted storage. The dumper mutex serializes writes so a
/// synchronous dump from `set()` never races the periodic loop's rewrite.
pub struct FileStorage {
    mem: MemoryStorage,
    file_path: PathBuf,
    store_interval: Duration,
    dump_lock: Mutex<()>,
}

impl FileStorage {
    /// Constructs the backend, optionally restoring prior state from disk.
    /// A missing file is not an error; a malformed record aborts the whole
    /// load (no partial-state load).
    pub async fn new(cfg: FileStorageConfig) -> Result<Self, AppError> {
        let storage = Self {
            mem: MemoryStorage::new(),
            file_path: cfg.file_path,
            store_interval: cfg.store_interval,
            dump_lock: Mutex::new(()),
        };
        if cfg.restore {
            storage.restore().await?;
        }
        Ok(storage)
    }

    async fn restore(&self) -> Result<(), AppError> {
        let bytes = match tokio::fs::read(&self.file_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(AppError::internal(e)),
        };
        let text = String::from_utf8(bytes).map_err(AppError::internal)?;
        let mut loaded = Vec::new();
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let dto: MetricDto = serde_json::from_str(line).map_err(AppError::internal)?;
            let metric: Metric = dto.try_into().map_err(AppError::internal)?;
            loaded.push(metric);
        }
        self.mem.load(loaded).await;
        Ok(())
    }

    /// Atomically rewrites the dump file from the current in-memory state.
    pub async fn dump(&self) -> Result<(), AppError> {
        let _guard = self.dump_lock.lock().await;
        let metrics = self.mem.snapshot().await;
        let mut body = String::new();
        for m in &metrics {
            let dto: MetricDto = m.into();
            body.push_str(&serde_json::to_string(&dto).map_err(AppError::internal)?);
            body.push('\n');
        }

        let tmp_path = self.file_path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp_path).await.map_err(AppError::internal)?;
        file.write_all(body.as_bytes()).await.map_err(AppError::internal)?;
        file.flush().await.map_err(AppError::internal)?;
        tokio::fs::rename(&tmp_path, &self.file_path).await.map_err(AppError::internal)?;
        Ok(())
    }

    /// Background loop: wakes every `store_interval`, dumps, and exits
    /// cleanly (without a forced final dump) when `token` fires.
    pub async fn run_dump_loop(&self, token: CancellationToken) {
        if self.store_interval.is_zero() {
            return;
        }
        let mut ticker = tokio::time::interval(self.store_interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("dump loop cancelled");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.dump().await {
                        warn!(error = %e, "periodic dump failed");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn get(&self, key: &MetricKey) -> Result<Option<Metric>, AppError> {
        self.mem.get(key).await
    }

    async fn all(&self) -> Result<Vec<Metric>, AppError> {
        self.mem.all().await
    }

    async fn set(&self, metrics: Vec<Metric>) -> Result<(), AppError> {
        self.mem.set(metrics).await?;
        if self.store_interval.is_zero() {
            self.dump().await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), AppError> {
        self.dump().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::MetricKind;

    #[tokio::test]
    async fn restore_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");

        let cfg1 = FileStorageConfig { store_interval: Duration::ZERO, file_path: path.clone(), restore: false };
        let s1 = FileStorage::new(cfg1).await.unwrap();
        s1.set(vec![Metric::Gauge { name: "g".into(), value: 2.5 }]).await.unwrap();
        s1.close().await.unwrap();

        let cfg2 = FileStorageConfig { store_interval: Duration::ZERO, file_path: path, restore: true };
        let s2 = FileStorage::new(cfg2).await.unwrap();
        let got = s2.get(&MetricKey::new("g", MetricKind::Gauge)).await.unwrap();
        assert_eq!(got, Some(Metric::Gauge { name: "g".into(), value: 2.5 }));
    }

    #[tokio::test]
    async fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = FileStorageConfig {
            store_interval: Duration::ZERO,
            file_path: dir.path().join("does-not-exist.json"),
            restore: true,
        };
        assert!(FileStorage::new(cfg).await.is_ok());
    }
}
