//! Agent lifecycle glue: wires the two collection jobs and the reporter,
//! ticks them against independent poll/report intervals, and shuts down on
//! signal.

use std::sync::Arc;
use std::time::Duration;

use sysinfo::System;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::agent::collector::{collect_runtime_metrics, collect_system_metrics, Collector};
use crate::agent::reporter::{Reporter, ReporterConfig, Transport};

pub struct AgentConfig {
    pub poll_interval: Duration,
    pub report_interval: Duration,
    pub reporter: ReporterConfig,
}

/// Runs both collection jobs and the reporter until `token` is cancelled.
pub async fn run(cfg: AgentConfig, transport: Arc<dyn Transport>, token: CancellationToken) -> anyhow::Result<()> {
    let reporter = Arc::new(Reporter::new(cfg.reporter, transport));

    let runtime_job = tokio::spawn(run_collection_job(
        cfg.poll_interval,
        cfg.report_interval,
        reporter.clone(),
        token.clone(),
        CollectionKind::Runtime,
    ));
    let system_job = tokio::spawn(run_collection_job(
        cfg.poll_interval,
        cfg.report_interval,
        reporter.clone(),
        token.clone(),
        CollectionKind::System,
    ));

    let _ = tokio::join!(runtime_job, system_job);
    reporter.close().await;
    info!("agent shut down");
    Ok(())
}

enum CollectionKind {
    Runtime,
    System,
}

/// One collection job: owns its own `Collector`, ticks on `poll_interval`,
/// and hands its snapshot to the reporter every `report_interval` — the two
/// intervals are independent.
async fn run_collection_job(
    poll_interval: Duration,
    report_interval: Duration,
    reporter: Arc<Reporter>,
    token: CancellationToken,
    kind: CollectionKind,
) {
    let collector = Mutex::new(Collector::new());
    let mut sys = System::new();
    let mut poll_ticker = tokio::time::interval(poll_interval);
    let mut report_ticker = tokio::time::interval(report_interval);

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = poll_ticker.tick() => {
                let mut c = collector.lock().await;
                match kind {
                    CollectionKind::Runtime => collect_runtime_metrics(&mut c),
                    CollectionKind::System => collect_system_metrics(&mut c, &mut sys),
                }
            }
            _ = report_ticker.tick() => {
                let snapshot = collector.lock().await.snapshot();
                reporter.enqueue(snapshot).await;
            }
        }
    }
}
