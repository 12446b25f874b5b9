//! A fixed pool of closed-loop workers.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{Barrier, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::client::{BackendClient, ClientSettings, Execution};
use crate::error::RunError;
use crate::record::{CacheOutcome, ErrorKind, OperationRecord, Outcome, Phase};
use crate::recorder::MetricsRecorder;
use crate::workload::{ConnectSettings, WorkerPlan, Workload};

/// What a single worker did during the run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    /// Index of the worker.
    pub worker: usize,
    /// Number of operations the worker issued.
    pub operations: u64,
    /// Number of operations that panicked and were recorded as internal errors.
    pub panics: u64,
}

/// Connects one client per worker, concurrently.
///
/// Fails with [`RunError::Connect`] as soon as any worker exhausts its attempts.
pub(crate) async fn connect_all(
    workload: &Workload,
    backend: &Backend,
) -> Result<Vec<BackendClient>, RunError> {
    let connects = (0..workload.concurrency).map(|worker| {
        connect_with_retry(backend, workload.client.clone(), worker, workload.connect)
    });
    futures::future::try_join_all(connects).await
}

async fn connect_with_retry(
    backend: &Backend,
    settings: ClientSettings,
    worker: usize,
    connect: ConnectSettings,
) -> Result<BackendClient, RunError> {
    let mut backoff = connect.initial_backoff;
    let mut attempt = 1;

    loop {
        match BackendClient::connect(backend, settings.clone(), worker).await {
            Ok(client) => return Ok(client),
            Err(err) if attempt < connect.attempts => {
                tracing::warn!(
                    worker,
                    attempt,
                    error = &err as &dyn std::error::Error,
                    "connection failed, retrying in {backoff:?}"
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(connect.max_backoff);
                attempt += 1;
            }
            Err(source) => {
                return Err(RunError::Connect {
                    worker,
                    attempts: attempt,
                    source,
                });
            }
        }
    }
}

/// The phase boundaries of a run, fixed when the workers are released.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Schedule {
    pub warmup_cutoff: Instant,
    pub deadline: Instant,
}

impl Schedule {
    pub fn new(start: Instant, warmup: Duration, duration: Duration) -> Self {
        let warmup_cutoff = start + warmup;
        Self {
            warmup_cutoff,
            deadline: warmup_cutoff + duration,
        }
    }
}

/// State shared by all workers of a run.
#[derive(Clone, Debug)]
pub(crate) struct WorkerContext {
    pub schedule: watch::Receiver<Option<Schedule>>,
    pub think_time: Duration,
    pub cancel: CancellationToken,
    pub recorder: MetricsRecorder,
    pub barrier: Arc<Barrier>,
    pub progress: Arc<AtomicU64>,
}

/// Spawns one task per connected client.
///
/// All workers wait on a shared barrier so that they issue their first operation together. The
/// barrier counts one extra party for the runner, which publishes the [`Schedule`] after it passed.
pub(crate) fn spawn_workers(
    clients: Vec<BackendClient>,
    workload: &Workload,
    context: WorkerContext,
) -> Vec<JoinHandle<WorkerReport>> {
    clients
        .into_iter()
        .enumerate()
        .map(|(worker, client)| {
            let plan = workload.plan(worker);
            tokio::spawn(run_worker(worker, client, plan, context.clone()))
        })
        .collect()
}

async fn run_worker(
    worker: usize,
    mut client: BackendClient,
    mut plan: WorkerPlan,
    context: WorkerContext,
) -> WorkerReport {
    let mut report = WorkerReport {
        worker,
        operations: 0,
        panics: 0,
    };

    context.barrier.wait().await;
    let mut schedule = context.schedule.clone();
    let schedule = match schedule.wait_for(Option::is_some).await.map(|s| *s) {
        Ok(Some(schedule)) => schedule,
        _ => {
            tracing::debug!(worker, "run ended before it was scheduled");
            return report;
        }
    };

    loop {
        let issued_at = Instant::now();
        if context.cancel.is_cancelled() || issued_at >= schedule.deadline {
            break;
        }

        let operation = plan.next_operation();
        let execution = match AssertUnwindSafe(client.execute(&operation))
            .catch_unwind()
            .await
        {
            Ok(execution) => execution,
            Err(payload) => {
                report.panics += 1;
                if report.panics.is_power_of_two() {
                    let message = payload
                        .downcast_ref::<&str>()
                        .copied()
                        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                        .unwrap_or("unknown panic");
                    tracing::error!(
                        worker,
                        panics = report.panics,
                        kind = %operation.kind(),
                        "operation panicked: {message}"
                    );
                }
                Execution {
                    latency: issued_at.elapsed(),
                    outcome: Outcome::Error(ErrorKind::Internal),
                    cache: CacheOutcome::NotApplicable,
                }
            }
        };

        let phase = if issued_at < schedule.warmup_cutoff {
            Phase::Warmup
        } else {
            Phase::Measurement
        };
        context
            .recorder
            .record(OperationRecord {
                kind: operation.kind(),
                issued_at,
                latency: execution.latency,
                outcome: execution.outcome,
                cache: execution.cache,
                phase,
            })
            .await;

        report.operations += 1;
        context.progress.fetch_add(1, Ordering::Relaxed);

        if !context.think_time.is_zero() {
            tokio::select! {
                _ = context.cancel.cancelled() => break,
                _ = tokio::time::sleep(context.think_time) => {}
            }
        }
    }

    tracing::debug!(worker, operations = report.operations, "worker finished");
    report
}
