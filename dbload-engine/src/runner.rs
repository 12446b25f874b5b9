//! Sequencing of a complete experiment run.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::sync::{Barrier, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::aggregate::{Aggregator, Summary};
use crate::backend::Backend;
use crate::error::RunError;
use crate::operation::OperationKind;
use crate::pool::{self, Schedule, WorkerContext, WorkerReport};
use crate::record::Phase;
use crate::recorder::{KindSummary, MetricsRecorder, RecordObserver};
use crate::workload::Workload;

/// The results of a run.
#[derive(Debug, Serialize)]
pub struct RunReport {
    /// Name of the workload.
    pub label: String,
    /// Description of the system under test.
    pub backend: String,
    /// Number of concurrent workers.
    pub concurrency: usize,
    /// Base seed of the run.
    pub seed: u64,
    /// Wall-clock time at which the workers were released.
    #[serde(skip)]
    pub started_at: SystemTime,
    /// Time from start until all workers stopped.
    pub elapsed_secs: f64,
    /// Whether the run was stopped before its planned end.
    pub cancelled: bool,
    /// Time-windowed statistics.
    pub summary: Summary,
    /// Per-kind statistics over the measurement window.
    pub operations: Vec<KindSummary>,
    /// Retained latencies of successful measured operations, per kind.
    #[serde(skip)]
    pub samples: BTreeMap<OperationKind, Vec<Duration>>,
    /// Per-worker operation counts.
    pub workers: Vec<WorkerReport>,
}

/// Runs the workload against the backend: connect, warmup, measure, aggregate.
///
/// Only configuration and connection-bootstrap failures abort the run. Cancelling `cancel` stops
/// all workers after their in-flight operation; the partial results are still returned.
pub async fn run(
    workload: &Workload,
    backend: &Backend,
    cancel: CancellationToken,
) -> Result<RunReport, RunError> {
    run_observed(workload, backend, cancel, Vec::new()).await
}

/// Like [`run`], additionally reporting connections and every record to `observers`.
pub async fn run_observed(
    workload: &Workload,
    backend: &Backend,
    cancel: CancellationToken,
    observers: Vec<Arc<dyn RecordObserver>>,
) -> Result<RunReport, RunError> {
    let keys = workload.keys();
    tracing::info!(
        label = workload.name(),
        backend = %backend.describe(),
        concurrency = workload.concurrency,
        key_universe = keys.universe(),
        key_skew = keys.skew(),
        "connecting workers"
    );
    let clients = pool::connect_all(workload, backend).await?;
    for observer in &observers {
        observer.connections(clients.len());
    }

    let (recorder, pending) = MetricsRecorder::channel();
    let (schedule_tx, schedule_rx) = watch::channel(None);
    let barrier = Arc::new(Barrier::new(clients.len() + 1));
    let progress = Arc::new(AtomicU64::new(0));

    let context = WorkerContext {
        schedule: schedule_rx,
        think_time: workload.think_time,
        cancel: cancel.clone(),
        recorder,
        barrier: Arc::clone(&barrier),
        progress: Arc::clone(&progress),
    };
    let handles = pool::spawn_workers(clients, workload, context);

    // The clock starts once every worker is parked on the barrier.
    barrier.wait().await;
    let started_at = SystemTime::now();
    let start = Instant::now();
    let schedule = Schedule::new(start, workload.warmup, workload.duration);
    schedule_tx.send_replace(Some(schedule));
    tracing::info!(
        warmup = ?workload.warmup,
        duration = ?workload.duration,
        "starting workload"
    );

    for observer in &observers {
        observer.started(started_at);
    }
    let aggregator = Aggregator::new(
        start,
        schedule.warmup_cutoff,
        schedule.deadline,
        workload.bucket_reservoir_size,
        workload.seed,
    )
    .with_overall_samples(workload.reservoir_size);
    let collector = pending.collect(
        aggregator,
        workload.reservoir_size,
        workload.seed,
        observers.clone(),
    );

    let stop_monitor = cancel.child_token();
    let monitor = tokio::spawn(report_progress(
        start,
        schedule.warmup_cutoff,
        workload.report_interval,
        Arc::clone(&progress),
        stop_monitor.clone(),
    ));

    let mut workers = Vec::with_capacity(handles.len());
    for result in futures::future::join_all(handles).await {
        let report = result.map_err(|err| RunError::Internal(format!("worker failed: {err}")))?;
        workers.push(report);
    }
    let stopped = Instant::now();
    for observer in &observers {
        observer.connections(0);
    }

    stop_monitor.cancel();
    monitor
        .await
        .map_err(|err| RunError::Internal(format!("progress monitor failed: {err}")))?;

    let collected = collector.finish().await?;
    let end = stopped.min(schedule.deadline);
    let measurement_secs = end
        .saturating_duration_since(schedule.warmup_cutoff)
        .as_secs_f64();
    let operations = collected.summaries(Phase::Measurement, measurement_secs);
    let samples = collected.samples(Phase::Measurement);
    let summary = collected.aggregator.finish(end);

    let cancelled = cancel.is_cancelled() && stopped < schedule.deadline;
    if cancelled {
        tracing::warn!("run was cancelled, results are partial");
    }
    tracing::info!(
        operations = summary.used,
        discarded = summary.discarded,
        elapsed = ?(stopped - start),
        "workload finished"
    );

    Ok(RunReport {
        label: workload.name().to_owned(),
        backend: backend.describe(),
        concurrency: workload.concurrency,
        seed: workload.seed,
        started_at,
        elapsed_secs: (stopped - start).as_secs_f64(),
        cancelled,
        summary,
        operations,
        samples,
        workers,
    })
}

async fn report_progress(
    start: Instant,
    warmup_cutoff: Instant,
    interval: Duration,
    progress: Arc<AtomicU64>,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(start + interval, interval);
    let mut last = 0;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            now = ticker.tick() => {
                let total = progress.load(Ordering::Relaxed);
                let phase = if now < warmup_cutoff { "warmup" } else { "measurement" };
                tracing::info!(
                    phase,
                    elapsed = ?(now - start),
                    operations = total,
                    rate = (total - last) as f64 / interval.as_secs_f64(),
                    "progress"
                );
                last = total;
            }
        }
    }
}
