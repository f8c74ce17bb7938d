//! Use-case layer: the only thing that knows update semantics (gauge
//! replace, counter accumulate). Depends on the [`Storage`] contract only —
//! it must never switch on the concrete backend.

use std::sync::Arc;

use tracing::warn;

use crate::error::AppError;
use crate::metric::{Metric, MetricKey};
use crate::storage::Storage;

pub struct MetricUseCase {
    storage: Arc<dyn Storage>,
}

impl MetricUseCase {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Dispatches by type: a gauge writes through unchanged; a counter
    /// reads the accumulated delta and writes back the sum. The read and
    /// write are two separate backend calls and are NOT atomic — concurrent
    /// counter updates on the same key may lose increments. The reference
    /// contract tolerates this race and relies on upstream per-fingerprint
    /// serialization at the reporter (each batch is sent by one worker).
    pub async fn update(&self, metrics: Vec<Metric>) -> Result<Vec<Metric>, AppError> {
        let mut applied = Vec::with_capacity(metrics.len());
        for m in metrics {
            let resolved = match &m {
                Metric::Gauge { .. } => m,
                Metric::Counter { name, delta } => {
                    let key = MetricKey::new(name.clone(), crate::metric::MetricKind::Counter);
                    let prior = self.storage.get(&key).await?;
                    let accumulated = match prior {
                        Some(Metric::Counter { delta: prior_delta, .. }) => prior_delta + delta,
                        Some(_) => {
                            warn!(name, "stored metric type mismatch for counter key");
                            *delta
                        }
                        None => *delta,
                    };
                    Metric::Counter { name: name.clone(), delta: accumulated }
                }
            };
            self.storage.set(vec![resolved.clone()]).await?;
            applied.push(resolved);
        }
        Ok(applied)
    }

    /// Batched variant: applies every metric through [`update`]'s per-item
    /// semantics, but as with `update`, cross-item storage calls are not
    /// wrapped in one atomic operation.
    pub async fn update_batch(&self, metrics: Vec<Metric>) -> Result<Vec<Metric>, AppError> {
        self.update(metrics).await
    }

    pub async fn get(&self, key: &MetricKey) -> Result<Metric, AppError> {
        self.storage.get(key).await?.ok_or(AppError::NotFound)
    }

    pub async fn get_all(&self) -> Result<Vec<Metric>, AppError> {
        self.storage.all().await
    }

    /// Liveness probe for `/ping`: delegates to the backend's own check.
    pub async fn ping(&self) -> Result<(), AppError> {
        self.storage.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::MetricKind;
    use crate::storage::MemoryStorage;

    fn usecase() -> MetricUseCase {
        MetricUseCase::new(Arc::new(MemoryStorage::new()))
    }

    #[tokio::test]
    async fn gauge_update_is_last_write_wins() {
        let uc = usecase();
        uc.update(vec![Metric::Gauge { name: "g".into(), value: 1.0 }]).await.unwrap();
        uc.update(vec![Metric::Gauge { name: "g".into(), value: 2.0 }]).await.unwrap();
        let got = uc.get(&MetricKey::new("g", MetricKind::Gauge)).await.unwrap();
        assert_eq!(got, Metric::Gauge { name: "g".into(), value: 2.0 });
    }

    #[tokio::test]
    async fn counter_update_accumulates() {
        let uc = usecase();
        uc.update(vec![Metric::Counter { name: "c".into(), delta: 1 }]).await.unwrap();
        uc.update(vec![Metric::Counter { name: "c".into(), delta: 2 }]).await.unwrap();
        let got = uc.get(&MetricKey::new("c", MetricKind::Counter)).await.unwrap();
        assert_eq!(got, Metric::Counter { name: "c".into(), delta: 3 });
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let uc = usecase();
        let err = uc.get(&MetricKey::new("missing", MetricKind::Gauge)).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound));
    }
}
