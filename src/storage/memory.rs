//! In-memory backend: a map from canonical key to [`Metric`] guarded by a
//! reader/writer lock. Readers take the shared lease; writers take
//! exclusive. `all()` returns a snapshot copy so callers never observe a
//! concurrent mutation mid-iteration.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::AppError;
use crate::metric::{Metric, MetricKey};
use crate::storage::Storage;

#[derive(Default)]
pub struct MemoryStorage {
    inner: RwLock<HashMap<MetricKey, Metric>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct, non-trait-object snapshot helper used by the file backend's
    /// dump loop (avoids a `Box<dyn Storage>` indirection for its own data).
    pub async fn snapshot(&self) -> Vec<Metric> {
        self.inner.read().await.values().cloned().collect()
    }

    pub async fn load(&self, metrics: Vec<Metric>) {
        let mut guard = self.inner.write().await;
        for m in metrics {
            guard.insert(m.key(), m);
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &MetricKey) -> Result<Option<Metric>, AppError> {
        Ok(self.inner.read().await.get(key).cloned())
    }

    async fn all(&self) -> Result<Vec<Metric>, AppError> {
        Ok(self.inner.read().await.values().cloned().collect())
    }

    async fn set(&self, metrics: Vec<Metric>) -> Result<(), AppError> {
        let mut guard = self.inner.write().await;
        for m in metrics {
            guard.insert(m.key(), m);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::MetricKind;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = MemoryStorage::new();
        let m = Metric::Gauge { name: "heap".into(), value: 1.5 };
        store.set(vec![m.clone()]).await.unwrap();
        let got = store.get(&MetricKey::new("heap", MetricKind::Gauge)).await.unwrap();
        assert_eq!(got, Some(m));
    }

    #[tokio::test]
    async fn missing_key_returns_none_not_error() {
        let store = MemoryStorage::new();
        let got = store.get(&MetricKey::new("nope", MetricKind::Gauge)).await.unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn all_is_a_snapshot_copy() {
        let store = MemoryStorage::new();
        store
            .set(vec![Metric::Counter { name: "c".into(), delta: 1 }])
            .await
            .unwrap();
        let snap = store.all().await.unwrap();
        store
            .set(vec![Metric::Counter { name: "c".into(), delta: 2 }])
            .await
            .unwrap();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0], Metric::Counter { name: "c".into(), delta: 1 });
    }
}
