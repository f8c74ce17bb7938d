//! Plug-in storage abstraction. One trait, three interchangeable backends;
//! handlers never switch on the concrete backend — the lifecycle glue
//! selects one at container construction (§4.C backend selection: relational
//! if a DSN is set, else file if a path is set, else in-memory).

pub mod db;
pub mod file;
pub mod memory;

use async_trait::async_trait;

use crate::error::AppError;
use crate::metric::{Metric, MetricKey};

/// Unified storage contract. `Set` is an upsert, atomic per call: either
/// every metric in the call is applied or none are.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &MetricKey) -> Result<Option<Metric>, AppError>;
    async fn all(&self) -> Result<Vec<Metric>, AppError>;
    async fn set(&self, metrics: Vec<Metric>) -> Result<(), AppError>;
    /// Releases resources; file backends perform a final dump, DB pools
    /// close their connections. In-memory storage has nothing to flush.
    async fn close(&self) -> Result<(), AppError> {
        Ok(())
    }
    /// Liveness probe backing `/ping`. Backends with no external dependency
    /// (memory, file) are always live; the relational backend checks the
    /// pool.
    async fn ping(&self) -> Result<(), AppError> {
        Ok(())
    }
}

pub use db::RelationalStorage;
pub use file::FileStorage;
pub use memory::MemoryStorage;
