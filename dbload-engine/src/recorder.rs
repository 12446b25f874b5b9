//! Concurrent collection of operation records.
//!
//! Workers send records through a bounded channel to a single collector task, which is the only
//! writer of per-kind statistics and of the [`Aggregator`]. [`RecordObserver`]s see every record
//! as it arrives, for live exporters and streaming outputs.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::aggregate::{Aggregator, percentile};
use crate::error::RunError;
use crate::operation::OperationKind;
use crate::record::{
    CacheOutcome, ErrorClass, ErrorKind, OperationRecord, Outcome, Phase, errors_by_class,
};
use crate::reservoir::Reservoir;

/// Number of records that may be buffered before workers have to wait for the collector.
pub const CHANNEL_CAPACITY: usize = 65_536;

/// Exact counters and a latency sample for one operation kind within one phase.
#[derive(Debug)]
pub struct KindStats {
    total: u64,
    successes: u64,
    errors: BTreeMap<ErrorKind, u64>,
    cache_hits: u64,
    cache_misses: u64,
    latency_sum: Duration,
    latency_min: Option<Duration>,
    latency_max: Duration,
    latencies: Reservoir<Duration>,
}

impl KindStats {
    fn new(reservoir_size: usize, seed: u64) -> Self {
        Self {
            total: 0,
            successes: 0,
            errors: BTreeMap::new(),
            cache_hits: 0,
            cache_misses: 0,
            latency_sum: Duration::ZERO,
            latency_min: None,
            latency_max: Duration::ZERO,
            latencies: Reservoir::new(reservoir_size, seed),
        }
    }

    fn add(&mut self, record: &OperationRecord) {
        self.total += 1;
        match record.outcome {
            Outcome::Success => {
                self.successes += 1;
                self.latency_sum += record.latency;
                self.latency_min = Some(
                    self.latency_min
                        .map_or(record.latency, |min| min.min(record.latency)),
                );
                self.latency_max = self.latency_max.max(record.latency);
                self.latencies.offer(record.latency);
            }
            Outcome::Error(kind) => *self.errors.entry(kind).or_default() += 1,
        }
        match record.cache {
            CacheOutcome::Hit => self.cache_hits += 1,
            CacheOutcome::Miss => self.cache_misses += 1,
            CacheOutcome::NotApplicable => {}
        }
    }

    /// Total number of recorded operations.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Number of successful operations.
    pub fn successes(&self) -> u64 {
        self.successes
    }

    /// Failures per error kind.
    pub fn errors(&self) -> &BTreeMap<ErrorKind, u64> {
        &self.errors
    }

    /// The retained latencies of successful operations, in arrival order unless sampled.
    pub fn latencies(&self) -> &[Duration] {
        self.latencies.items()
    }

    /// Summarizes these statistics over a window of `window_secs` seconds.
    pub fn summary(&self, kind: OperationKind, window_secs: f64) -> KindSummary {
        let sorted = self.latencies.sorted();
        let ms = |duration: Duration| duration.as_nanos() as f64 / 1e6;
        let quantile = |p| percentile(&sorted, p).map(ms);
        let lookups = self.cache_hits + self.cache_misses;

        KindSummary {
            kind,
            count: self.total,
            successes: self.successes,
            errors: self.errors.values().sum(),
            min_ms: self.latency_min.map(ms),
            max_ms: self.latency_min.map(|_| ms(self.latency_max)),
            mean_ms: (self.successes > 0).then(|| ms(self.latency_sum) / self.successes as f64),
            p50_ms: quantile(0.50),
            p95_ms: quantile(0.95),
            p99_ms: quantile(0.99),
            ops_per_sec: if window_secs > 0.0 {
                self.successes as f64 / window_secs
            } else {
                0.0
            },
            cache_hit_rate_pct: (lookups > 0)
                .then(|| self.cache_hits as f64 / lookups as f64 * 100.0),
            errors_by_kind: self.errors.clone(),
            errors_by_class: errors_by_class(&self.errors),
            sampled: self.latencies.is_sampled(),
        }
    }
}

/// Summary of one operation kind over the measurement window.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct KindSummary {
    /// The operation kind.
    pub kind: OperationKind,
    /// Number of operations issued.
    pub count: u64,
    /// Number of successful operations.
    pub successes: u64,
    /// Number of failed operations.
    pub errors: u64,
    /// Minimum latency of successful operations.
    pub min_ms: Option<f64>,
    /// Maximum latency of successful operations.
    pub max_ms: Option<f64>,
    /// Mean latency of successful operations.
    pub mean_ms: Option<f64>,
    /// Median latency of successful operations.
    pub p50_ms: Option<f64>,
    /// 95th percentile latency of successful operations.
    pub p95_ms: Option<f64>,
    /// 99th percentile latency of successful operations.
    pub p99_ms: Option<f64>,
    /// Successful operations per second.
    pub ops_per_sec: f64,
    /// Cache hits as a percentage of cache lookups.
    pub cache_hit_rate_pct: Option<f64>,
    /// Failures per error kind.
    pub errors_by_kind: BTreeMap<ErrorKind, u64>,
    /// Failures per coarse error class.
    pub errors_by_class: BTreeMap<ErrorClass, u64>,
    /// Whether percentiles were estimated from a sample of the latencies.
    pub sampled: bool,
}

/// Everything the collector task gathered during a run.
#[derive(Debug)]
pub struct Collected {
    /// Per-kind statistics, split by phase.
    pub kinds: BTreeMap<(OperationKind, Phase), KindStats>,
    /// The time-windowed aggregation of all accepted records.
    pub aggregator: Aggregator,
}

impl Collected {
    /// Summaries of every kind that was issued in the given phase.
    pub fn summaries(&self, phase: Phase, window_secs: f64) -> Vec<KindSummary> {
        self.kinds
            .iter()
            .filter(|((_, p), _)| *p == phase)
            .map(|((kind, _), stats)| stats.summary(*kind, window_secs))
            .collect()
    }

    /// The retained latencies of every kind that was issued in the given phase.
    pub fn samples(&self, phase: Phase) -> BTreeMap<OperationKind, Vec<Duration>> {
        self.kinds
            .iter()
            .filter(|((_, p), _)| *p == phase)
            .map(|((kind, _), stats)| (*kind, stats.latencies().to_vec()))
            .collect()
    }
}

/// Receives records as the collector task processes them.
///
/// Callbacks run on the collector task and must not block for long, or workers will back up on
/// the full channel.
pub trait RecordObserver: Send + Sync + fmt::Debug {
    /// Called once when the workers are released, before any record is observed.
    fn started(&self, _started_at: SystemTime) {}

    /// Called for every submitted record, including those the aggregator discards.
    fn observe(&self, record: &OperationRecord);

    /// Called when the number of open worker connections changes.
    fn connections(&self, _active: usize) {}
}

/// A cheap, cloneable handle used by workers to submit records.
#[derive(Clone, Debug)]
pub struct MetricsRecorder {
    tx: mpsc::Sender<OperationRecord>,
}

/// Records submitted through a [`MetricsRecorder`] that no collector has picked up yet.
#[derive(Debug)]
pub struct Pending {
    rx: mpsc::Receiver<OperationRecord>,
}

/// The collector task owning all metrics state.
#[derive(Debug)]
pub struct Collector {
    handle: JoinHandle<Collected>,
}

impl MetricsRecorder {
    /// Creates a recorder whose records are buffered until [`Pending::collect`] is called.
    pub fn channel() -> (Self, Pending) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        (Self { tx }, Pending { rx })
    }

    /// Submits a record.
    ///
    /// Waits only if the collector is behind by a full channel.
    pub async fn record(&self, record: OperationRecord) {
        if self.tx.send(record).await.is_err() {
            tracing::warn!("metrics collector stopped, dropping record");
        }
    }
}

impl Pending {
    /// Spawns the collector task feeding `aggregator`.
    ///
    /// `reservoir_size` bounds the latency sample kept per kind and phase; `0` keeps all.
    pub fn collect(
        self,
        aggregator: Aggregator,
        reservoir_size: usize,
        seed: u64,
        observers: Vec<Arc<dyn RecordObserver>>,
    ) -> Collector {
        let mut rx = self.rx;

        let handle = tokio::spawn(async move {
            let mut aggregator = aggregator;
            let mut kinds = BTreeMap::new();

            while let Some(record) = rx.recv().await {
                for observer in &observers {
                    observer.observe(&record);
                }

                if let Err(reason) = aggregator.ingest(&record) {
                    tracing::trace!(?reason, kind = %record.kind, "discarding record");
                    continue;
                }

                let key = (record.kind, record.phase);
                let seed = seed
                    .wrapping_mul(31)
                    .wrapping_add((record.kind.index() * 2 + record.phase as usize) as u64);
                kinds
                    .entry(key)
                    .or_insert_with(|| KindStats::new(reservoir_size, seed))
                    .add(&record);
            }

            Collected { kinds, aggregator }
        });

        Collector { handle }
    }
}

impl Collector {
    /// Waits until every [`MetricsRecorder`] handle is dropped and returns the collected state.
    pub async fn finish(self) -> Result<Collected, RunError> {
        self.handle
            .await
            .map_err(|err| RunError::Internal(format!("metrics collector failed: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::time::Instant;

    use super::*;

    #[derive(Debug, Default)]
    struct Counting {
        seen: Mutex<u64>,
    }

    impl RecordObserver for Counting {
        fn observe(&self, _record: &OperationRecord) {
            *self.seen.lock().unwrap() += 1;
        }
    }

    fn record(
        issued_at: Instant,
        kind: OperationKind,
        latency_ms: u64,
        outcome: Outcome,
        phase: Phase,
    ) -> OperationRecord {
        OperationRecord {
            kind,
            issued_at,
            latency: Duration::from_millis(latency_ms),
            outcome,
            cache: CacheOutcome::NotApplicable,
            phase,
        }
    }

    #[tokio::test]
    async fn collects_from_concurrent_handles() {
        let start = Instant::now();
        let end = start + Duration::from_secs(60);
        let (recorder, pending) = MetricsRecorder::channel();
        let collector = pending.collect(Aggregator::new(start, start, end, 0, 0), 0, 0, Vec::new());

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let recorder = recorder.clone();
                tokio::spawn(async move {
                    for i in 0..1000 {
                        let outcome = if i % 10 == 0 {
                            Outcome::Error(ErrorKind::Deadlock)
                        } else {
                            Outcome::Success
                        };
                        let r = record(start, OperationKind::Update, 5, outcome, Phase::Measurement);
                        recorder.record(r).await;
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        drop(recorder);

        let collected = collector.finish().await.unwrap();
        let stats = &collected.kinds[&(OperationKind::Update, Phase::Measurement)];
        assert_eq!(stats.total(), 8000);
        assert_eq!(stats.successes(), 7200);
        assert_eq!(stats.errors()[&ErrorKind::Deadlock], 800);

        let summary = stats.summary(OperationKind::Update, 60.0);
        assert_eq!(summary.min_ms, Some(5.0));
        assert_eq!(summary.p99_ms, Some(5.0));
        assert_eq!(summary.ops_per_sec, 120.0);
    }

    #[tokio::test]
    async fn discarded_records_do_not_reach_kind_stats() {
        let start = Instant::now() + Duration::from_secs(5);
        let end = start + Duration::from_secs(1);
        let (recorder, pending) = MetricsRecorder::channel();
        let observer = Arc::new(Counting::default());
        let collector = pending.collect(
            Aggregator::new(start, start, end, 0, 0),
            0,
            0,
            vec![observer.clone() as Arc<dyn RecordObserver>],
        );

        let early = start - Duration::from_secs(1);
        recorder
            .record(record(early, OperationKind::Insert, 1, Outcome::Success, Phase::Warmup))
            .await;
        recorder
            .record(record(start, OperationKind::Insert, 1, Outcome::Success, Phase::Measurement))
            .await;
        drop(recorder);

        let collected = collector.finish().await.unwrap();
        assert_eq!(collected.kinds.len(), 1);
        assert!(collected.summaries(Phase::Warmup, 1.0).is_empty());
        assert_eq!(collected.summaries(Phase::Measurement, 1.0)[0].count, 1);

        let summary = collected.aggregator.finish(end);
        assert_eq!(summary.submitted, 2);
        assert_eq!(summary.discarded, 1);

        // Observers see discarded records too.
        assert_eq!(*observer.seen.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn records_wait_for_the_collector() {
        let start = Instant::now();
        let (recorder, pending) = MetricsRecorder::channel();
        recorder
            .record(record(start, OperationKind::Update, 3, Outcome::Success, Phase::Measurement))
            .await;
        recorder
            .record(record(
                start,
                OperationKind::Update,
                7,
                Outcome::Error(ErrorKind::Timeout),
                Phase::Measurement,
            ))
            .await;
        drop(recorder);

        let end = start + Duration::from_secs(1);
        let collector = pending.collect(Aggregator::new(start, start, end, 0, 0), 2, 0, Vec::new());
        let collected = collector.finish().await.unwrap();

        let summary = &collected.summaries(Phase::Measurement, 1.0)[0];
        assert_eq!(summary.count, 2);
        assert!(!summary.sampled);
        assert_eq!(summary.errors_by_class[&ErrorClass::Timeout], 1);

        let samples = collected.samples(Phase::Measurement);
        assert_eq!(samples[&OperationKind::Update], [Duration::from_millis(3)]);
        assert!(collected.samples(Phase::Warmup).is_empty());
    }

    #[test]
    fn bounded_reservoirs_mark_summaries_as_sampled() {
        let start = Instant::now();
        let mut stats = KindStats::new(4, 1);
        for latency in 1..=10 {
            stats.add(&record(
                start,
                OperationKind::Insert,
                latency,
                Outcome::Success,
                Phase::Measurement,
            ));
        }

        assert_eq!(stats.latencies().len(), 4);
        let summary = stats.summary(OperationKind::Insert, 1.0);
        assert!(summary.sampled);
        assert_eq!(summary.min_ms, Some(1.0));
        assert_eq!(summary.max_ms, Some(10.0));
    }
}
