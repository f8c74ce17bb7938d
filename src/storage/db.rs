//! Relational backend: a `sqlx` Postgres pool with an idempotent migration,
//! a single-transaction upsert per `set()` call, and a fixed retry schedule
//! for transient connection errors.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres, Row};
use tracing::{error, warn};

use crate::error::AppError;
use crate::metric::{Metric, MetricKey, MetricKind};
use crate::storage::Storage;

/// Fixed retry schedule for SQLSTATE class `08` ("connection exception").
const RETRY_SCHEDULE: &[Duration] = &[Duration::from_secs(1), Duration::from_secs(3), Duration::from_secs(5)];

pub struct RelationalStorage {
    pool: Pool<Postgres>,
}

impl RelationalStorage {
    pub async fn connect(dsn: &str) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(dsn)
            .await
            .map_err(AppError::internal)?;
        let storage = Self { pool };
        storage.migrate().await?;
        Ok(storage)
    }

    async fn migrate(&self) -> Result<(), AppError> {
        sqlx::query(
            r#"create table if not exists metrics (
                "name" text not null,
                "type" text not null,
                "delta" bigint,
                "value" double precision,
                primary key ("name", "type")
            )"#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!(error = %e, "migration failed");
            AppError::internal(e)
        })?;
        Ok(())
    }

    fn is_connection_exception(err: &sqlx::Error) -> bool {
        matches!(err, sqlx::Error::Database(db) if db.code().map(|c| c.starts_with("08")).unwrap_or(false))
            || matches!(err, sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut)
    }

    async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
    {
        let mut attempt = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if Self::is_connection_exception(&e) && attempt < RETRY_SCHEDULE.len() => {
                    let wait = RETRY_SCHEDULE[attempt];
                    warn!(attempt, ?wait, error = %e, "transient db error, retrying");
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => return Err(AppError::internal(e)),
            }
        }
    }
}

#[async_trait]
impl Storage for RelationalStorage {
    async fn get(&self, key: &MetricKey) -> Result<Option<Metric>, AppError> {
        let row = self
            .with_retry(|| async {
                sqlx::query(r#"select "name", "type", "delta", "value" from metrics where "name" = $1 and "type" = $2"#)
                    .bind(&key.name)
                    .bind(key.kind.as_str())
                    .fetch_optional(&self.pool)
                    .await
            })
            .await?;

        let Some(row) = row else { return Ok(None) };
        row_to_metric(&row).map(Some)
    }

    async fn all(&self) -> Result<Vec<Metric>, AppError> {
        let rows = self
            .with_retry(|| async {
                sqlx::query(r#"select "name", "type", "delta", "value" from metrics"#)
                    .fetch_all(&self.pool)
                    .await
            })
            .await?;
        rows.iter().map(row_to_metric).collect()
    }

    async fn set(&self, metrics: Vec<Metric>) -> Result<(), AppError> {
        if metrics.is_empty() {
            return Ok(());
        }

        self.with_retry(|| async {
            let mut tx = self.pool.begin().await?;
            for m in &metrics {
                let key = m.key();
                let (delta, value) = metric_columns(m);
                let result = sqlx::query(
                    r#"insert into metrics ("name", "type", "delta", "value") values ($1, $2, $3, $4)
                       on conflict ("name", "type") do update
                       set "delta" = excluded."delta", "value" = excluded."value""#,
                )
                .bind(&key.name)
                .bind(key.kind.as_str())
                .bind(delta)
                .bind(value)
                .execute(&mut *tx)
                .await;

                if let Err(e) = result {
                    let rollback = tx.rollback().await;
                    return Err(join_errors(e, rollback.err()));
                }
            }
            tx.commit().await
        })
        .await
    }

    async fn ping(&self) -> Result<(), AppError> {
        sqlx::query("select 1").execute(&self.pool).await.map(|_| ()).map_err(AppError::internal)
    }
}

fn metric_columns(m: &Metric) -> (Option<i64>, Option<f64>) {
    match m {
        Metric::Gauge { value, .. } => (None, Some(*value)),
        Metric::Counter { delta, .. } => (Some(*delta), None),
    }
}

fn row_to_metric(row: &sqlx::postgres::PgRow) -> Result<Metric, AppError> {
    let name: String = row.try_get("name").map_err(AppError::internal)?;
    let kind_text: String = row.try_get("type").map_err(AppError::internal)?;
    let kind = MetricKind::parse(&kind_text).ok_or_else(|| AppError::Internal(format!("bad metric type in db: {kind_text}")))?;
    match kind {
        MetricKind::Gauge => {
            let value: Option<f64> = row.try_get("value").map_err(AppError::internal)?;
            let value = value.ok_or_else(|| AppError::Internal("gauge row missing value".into()))?;
            Ok(Metric::Gauge { name, value })
        }
        MetricKind::Counter => {
            let delta: Option<i64> = row.try_get("delta").map_err(AppError::internal)?;
            let delta = delta.ok_or_else(|| AppError::Internal("counter row missing delta".into()))?;
            Ok(Metric::Counter { name, delta })
        }
    }
}

/// Joins the original failure with a rollback failure, if any, so neither
/// is silently dropped.
fn join_errors(original: sqlx::Error, rollback: Option<sqlx::Error>) -> sqlx::Error {
    match rollback {
        Some(rb) => sqlx::Error::Io(std::io::Error::other(format!("{original}; rollback also failed: {rb}"))),
        None => original,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Requires a live Postgres reachable via `DATABASE_DSN`; run with
    /// `cargo test -- --ignored` against a provisioned test database.
    #[tokio::test]
    #[ignore]
    async fn set_then_get_round_trips_against_live_postgres() {
        let dsn = std::env::var("DATABASE_DSN").expect("DATABASE_DSN must be set for this test");
        let storage = RelationalStorage::connect(&dsn).await.unwrap();
        let m = Metric::Counter { name: "live_test_counter".into(), delta: 5 };
        storage.set(vec![m.clone()]).await.unwrap();
        let got = storage.get(&m.key()).await.unwrap();
        assert_eq!(got, Some(m));
    }
}
