//! Time-windowed aggregation of operation records.
//!
//! Records are grouped into one-second buckets by their issue time relative to the run start.
//! Every bucket yields throughput, latency percentiles, error rate and cache hit rate. Records
//! issued before the warmup cutoff are reported per second but excluded from the overall summary.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::operation::OperationKind;
use crate::record::{
    CacheOutcome, ErrorClass, ErrorKind, OperationRecord, Outcome, errors_by_class,
};
use crate::reservoir::Reservoir;

/// Default number of successful latencies sampled per one-second bucket.
pub const DEFAULT_BUCKET_SAMPLES: usize = 10_000;

/// Why a record was not aggregated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Discard {
    /// The record was issued before the run started.
    BeforeStart,
    /// The record was issued at or after the end of the run.
    AfterEnd,
}

/// Returns the `p`-quantile of an ascending slice using linear interpolation between ranks.
///
/// `p` is clamped to `[0, 1]`. Returns `None` for an empty slice.
pub fn percentile(sorted: &[Duration], p: f64) -> Option<Duration> {
    let last = sorted.len().checked_sub(1)?;
    let rank = p.clamp(0.0, 1.0) * last as f64;
    let lower = rank.floor() as usize;
    let fraction = rank - lower as f64;

    let low = sorted[lower];
    if fraction == 0.0 {
        return Some(low);
    }
    let high = sorted[(lower + 1).min(last)];
    Some(low + (high - low).mul_f64(fraction))
}

fn millis(duration: Duration) -> f64 {
    duration.as_nanos() as f64 / 1e6
}

/// Statistics over one window of records.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct WindowStats {
    /// Number of operations issued in the window.
    pub operations: u64,
    /// Number of successful operations.
    pub successes: u64,
    /// Number of failed operations.
    pub errors: u64,
    /// Successful operations per second of window width.
    pub throughput_qps: f64,
    /// Median latency of successful operations.
    pub p50_ms: Option<f64>,
    /// 95th percentile latency of successful operations.
    pub p95_ms: Option<f64>,
    /// 99th percentile latency of successful operations.
    pub p99_ms: Option<f64>,
    /// Exact mean latency of successful operations.
    pub mean_ms: Option<f64>,
    /// Exact maximum latency of successful operations.
    pub max_ms: Option<f64>,
    /// Failed operations as a percentage of all operations.
    pub error_rate_pct: Option<f64>,
    /// Cache hits as a percentage of cache lookups; absent if the cache was never consulted.
    pub cache_hit_rate_pct: Option<f64>,
    /// Number of reads served by the cache.
    pub cache_hits: u64,
    /// Number of reads that missed the cache.
    pub cache_misses: u64,
    /// Operations issued per kind.
    pub operations_by_kind: BTreeMap<OperationKind, u64>,
    /// Failures per error kind.
    pub errors_by_kind: BTreeMap<ErrorKind, u64>,
    /// Failures per coarse error class.
    pub errors_by_class: BTreeMap<ErrorClass, u64>,
}

/// Statistics of a single one-second bucket.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SecondStats {
    /// Whole seconds between the run start and the beginning of this bucket.
    pub second_offset: u64,
    /// Width of the bucket in seconds; below `1.0` only for a trailing partial second.
    pub width_secs: f64,
    /// Whether the bucket started before the warmup cutoff.
    pub is_warmup: bool,
    /// Statistics of the records in this bucket.
    #[serde(flatten)]
    pub stats: WindowStats,
}

/// The result of an aggregation.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Summary {
    /// Per-second statistics, one entry for every second of the run including empty ones.
    pub seconds: Vec<SecondStats>,
    /// Statistics over the measurement window, excluding warmup.
    pub overall: WindowStats,
    /// Length of the measurement window in seconds.
    pub measurement_secs: f64,
    /// Number of records offered to the aggregator.
    pub submitted: u64,
    /// Number of records that were aggregated.
    pub used: u64,
    /// Number of records dropped because they fell outside the run window.
    pub discarded: u64,
}

#[derive(Debug)]
struct Accumulator {
    operations: [u64; OperationKind::ALL.len()],
    successes: u64,
    errors: BTreeMap<ErrorKind, u64>,
    cache_hits: u64,
    cache_misses: u64,
    latency_sum: Duration,
    latency_max: Duration,
    latencies: Reservoir<Duration>,
}

impl Accumulator {
    fn new(sample_cap: usize, seed: u64) -> Self {
        Self {
            operations: [0; OperationKind::ALL.len()],
            successes: 0,
            errors: BTreeMap::new(),
            cache_hits: 0,
            cache_misses: 0,
            latency_sum: Duration::ZERO,
            latency_max: Duration::ZERO,
            latencies: Reservoir::new(sample_cap, seed),
        }
    }

    fn add(&mut self, record: &OperationRecord) {
        self.operations[record.kind.index()] += 1;

        match record.outcome {
            Outcome::Success => {
                self.successes += 1;
                self.latency_sum += record.latency;
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

    fn stats(&self, width_secs: f64) -> WindowStats {
        let operations = self.operations.iter().sum::<u64>();
        let errors = self.errors.values().sum::<u64>();
        let sorted = self.latencies.sorted();
        let quantile = |p| percentile(&sorted, p).map(millis);

        let throughput_qps = if width_secs > 0.0 {
            self.successes as f64 / width_secs
        } else {
            0.0
        };
        let lookups = self.cache_hits + self.cache_misses;

        WindowStats {
            operations,
            successes: self.successes,
            errors,
            throughput_qps,
            p50_ms: quantile(0.50),
            p95_ms: quantile(0.95),
            p99_ms: quantile(0.99),
            mean_ms: (self.successes > 0).then(|| millis(self.latency_sum) / self.successes as f64),
            max_ms: (self.successes > 0).then(|| millis(self.latency_max)),
            error_rate_pct: (operations > 0).then(|| errors as f64 / operations as f64 * 100.0),
            cache_hit_rate_pct: (lookups > 0)
                .then(|| self.cache_hits as f64 / lookups as f64 * 100.0),
            cache_hits: self.cache_hits,
            cache_misses: self.cache_misses,
            operations_by_kind: OperationKind::ALL
                .into_iter()
                .zip(self.operations)
                .filter(|(_, count)| *count > 0)
                .collect(),
            errors_by_kind: self.errors.clone(),
            errors_by_class: errors_by_class(&self.errors),
        }
    }
}

/// Streaming aggregator over the records of one run.
///
/// The run window is `[start, end)`. Records issued outside of it are discarded and counted, so
/// that `used + discarded == submitted` holds at all times.
#[derive(Debug)]
pub struct Aggregator {
    start: Instant,
    warmup_cutoff: Instant,
    end: Instant,
    sample_cap: usize,
    seed: u64,
    buckets: BTreeMap<u64, Accumulator>,
    overall: Accumulator,
    submitted: u64,
    discarded: u64,
}

impl Aggregator {
    /// Creates an aggregator for a run spanning `[start, end)`, with warmup up to `warmup_cutoff`.
    ///
    /// `sample_cap` bounds the number of latencies retained per bucket for percentile
    /// estimation; `0` retains all of them. The overall summary uses the same bound unless
    /// [`with_overall_samples`](Self::with_overall_samples) sets its own. `seed` drives the
    /// sampling decisions.
    pub fn new(
        start: Instant,
        warmup_cutoff: Instant,
        end: Instant,
        sample_cap: usize,
        seed: u64,
    ) -> Self {
        let end = end.max(start);
        let warmup_cutoff = warmup_cutoff.clamp(start, end);
        Self {
            start,
            warmup_cutoff,
            end,
            sample_cap,
            seed,
            buckets: BTreeMap::new(),
            overall: Accumulator::new(sample_cap, seed),
            submitted: 0,
            discarded: 0,
        }
    }

    /// Bounds the latencies retained for the overall summary separately from the buckets.
    ///
    /// `0` retains all of them.
    pub fn with_overall_samples(mut self, cap: usize) -> Self {
        self.overall = Accumulator::new(cap, self.seed);
        self
    }

    /// Adds a record, or reports why it was discarded.
    pub fn ingest(&mut self, record: &OperationRecord) -> Result<(), Discard> {
        self.submitted += 1;

        let discard = if record.issued_at < self.start {
            Some(Discard::BeforeStart)
        } else if record.issued_at >= self.end {
            Some(Discard::AfterEnd)
        } else {
            None
        };
        if let Some(reason) = discard {
            self.discarded += 1;
            return Err(reason);
        }

        let second = (record.issued_at - self.start).as_secs();
        let (cap, seed) = (self.sample_cap, self.seed);
        self.buckets
            .entry(second)
            .or_insert_with(|| Accumulator::new(cap, seed.wrapping_add(second + 1)))
            .add(record);

        if record.issued_at >= self.warmup_cutoff {
            self.overall.add(record);
        }

        Ok(())
    }

    /// Closes the run at `end` and computes all statistics.
    ///
    /// `end` may only shorten the window, for example after a cancelled run. Every record offered
    /// so far must have been issued before it.
    pub fn finish(self, end: Instant) -> Summary {
        let end = end.clamp(self.start, self.end);
        let window = end - self.start;

        // Materialize every second of the window, plus any bucket a late record landed in.
        let covered = window.as_secs_f64().ceil() as u64;
        let last = self
            .buckets
            .keys()
            .next_back()
            .map_or(covered, |second| covered.max(second + 1));

        let empty = Accumulator::new(0, 0);
        let cutoff = self.warmup_cutoff - self.start;
        let seconds = (0..last)
            .map(|second| {
                let bucket_start = Duration::from_secs(second);
                let width_secs = window
                    .saturating_sub(bucket_start)
                    .min(Duration::from_secs(1))
                    .as_secs_f64();
                let accumulator = self.buckets.get(&second).unwrap_or(&empty);

                SecondStats {
                    second_offset: second,
                    width_secs,
                    is_warmup: bucket_start < cutoff,
                    stats: accumulator.stats(width_secs),
                }
            })
            .collect();

        let measurement_secs = end.saturating_duration_since(self.warmup_cutoff).as_secs_f64();
        let used = self.submitted - self.discarded;

        Summary {
            seconds,
            overall: self.overall.stats(measurement_secs),
            measurement_secs,
            submitted: self.submitted,
            used,
            discarded: self.discarded,
        }
    }
}

/// Aggregates a finite set of records issued during `[start, end)`.
pub fn summarize<'a>(
    start: Instant,
    end: Instant,
    warmup_cutoff: Instant,
    records: impl IntoIterator<Item = &'a OperationRecord>,
    sample_cap: usize,
) -> Summary {
    let mut aggregator = Aggregator::new(start, warmup_cutoff, end, sample_cap, 0);
    for record in records {
        // Discards are accounted for in the summary.
        let _ = aggregator.ingest(record);
    }
    aggregator.finish(end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Phase;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    fn record(
        start: Instant,
        offset: Duration,
        latency: Duration,
        outcome: Outcome,
        cache: CacheOutcome,
    ) -> OperationRecord {
        OperationRecord {
            kind: OperationKind::PointReadPrimary,
            issued_at: start + offset,
            latency,
            outcome,
            cache,
            phase: Phase::Measurement,
        }
    }

    fn success(start: Instant, offset: Duration, latency: Duration) -> OperationRecord {
        record(start, offset, latency, Outcome::Success, CacheOutcome::NotApplicable)
    }

    #[test]
    fn percentile_interpolates_between_ranks() {
        let sorted = [ms(10), ms(20), ms(30), ms(40)];
        assert_eq!(percentile(&sorted, 0.0), Some(ms(10)));
        assert_eq!(percentile(&sorted, 1.0), Some(ms(40)));

        // rank = 0.5 * 3 = 1.5
        let median = percentile(&sorted, 0.5).unwrap();
        assert!((millis(median) - 25.0).abs() < 1e-9);

        assert_eq!(percentile(&[], 0.5), None);
        assert_eq!(percentile(&[ms(7)], 0.99), Some(ms(7)));
    }

    #[test]
    fn percentiles_are_monotonic() {
        let start = Instant::now();
        let records: Vec<_> = (0..997)
            .map(|i| success(start, ms(i), ms((i * 7919) % 503)))
            .collect();
        let summary = summarize(start, start + Duration::from_secs(1), start, &records, 0);

        let stats = &summary.seconds[0].stats;
        let (p50, p95, p99) = (
            stats.p50_ms.unwrap(),
            stats.p95_ms.unwrap(),
            stats.p99_ms.unwrap(),
        );
        assert!(p50 <= p95 && p95 <= p99, "{p50} {p95} {p99}");
        assert!(p99 <= stats.max_ms.unwrap());
    }

    #[test]
    fn empty_seconds_are_materialized() {
        let start = Instant::now();
        let records = [
            success(start, ms(100), ms(5)),
            success(start, ms(2500), ms(5)),
        ];
        let summary = summarize(start, start + Duration::from_secs(4), start, &records, 0);

        assert_eq!(summary.seconds.len(), 4);
        let empty = &summary.seconds[1].stats;
        assert_eq!(empty.throughput_qps, 0.0);
        assert_eq!(empty.p50_ms, None);
        assert_eq!(empty.p99_ms, None);
        assert_eq!(empty.error_rate_pct, None);
        assert_eq!(empty.cache_hit_rate_pct, None);
        assert_eq!(summary.seconds[3].stats.operations, 0);
    }

    #[test]
    fn cache_hit_rate_is_absent_without_lookups() {
        let start = Instant::now();
        let uncached = [success(start, ms(0), ms(1))];
        let summary = summarize(start, start + Duration::from_secs(1), start, &uncached, 0);
        assert_eq!(summary.seconds[0].stats.cache_hit_rate_pct, None);

        let cached: Vec<_> = [CacheOutcome::Hit, CacheOutcome::Hit, CacheOutcome::Hit]
            .into_iter()
            .chain([CacheOutcome::Miss])
            .map(|cache| record(start, ms(10), ms(1), Outcome::Success, cache))
            .collect();
        let summary = summarize(start, start + Duration::from_secs(1), start, &cached, 0);
        assert_eq!(summary.seconds[0].stats.cache_hit_rate_pct, Some(75.0));
        assert_eq!(summary.overall.cache_hit_rate_pct, Some(75.0));
    }

    #[test]
    fn half_timeouts_bucket() {
        let start = Instant::now();
        let mut records = Vec::new();
        for i in 0..50 {
            records.push(success(start, ms(i * 10), ms(10)));
            records.push(record(
                start,
                ms(i * 10 + 5),
                ms(1000),
                Outcome::Error(ErrorKind::Timeout),
                CacheOutcome::NotApplicable,
            ));
        }
        let summary = summarize(start, start + Duration::from_secs(1), start, &records, 0);

        let stats = &summary.seconds[0].stats;
        assert_eq!(stats.operations, 100);
        assert_eq!(stats.throughput_qps, 50.0);
        assert_eq!(stats.error_rate_pct, Some(50.0));
        assert_eq!(stats.p50_ms, Some(10.0));
        assert_eq!(stats.p95_ms, Some(10.0));
        assert_eq!(stats.p99_ms, Some(10.0));
        assert_eq!(stats.errors_by_kind, BTreeMap::from([(ErrorKind::Timeout, 50)]));
        assert_eq!(stats.errors_by_class, BTreeMap::from([(ErrorClass::Timeout, 50)]));
    }

    #[test]
    fn warmup_is_excluded_from_overall() {
        let start = Instant::now();
        let cutoff = start + Duration::from_secs(2);
        let end = start + Duration::from_secs(4);

        let mut records = Vec::new();
        for second in 0..4 {
            // Warmup seconds are slow, measured seconds are fast.
            let latency = if second < 2 { ms(500) } else { ms(2) };
            for i in 0..10 {
                records.push(success(start, Duration::from_secs(second) + ms(i * 50), latency));
            }
        }
        let summary = summarize(start, end, cutoff, &records, 0);

        let warmup: Vec<_> = summary.seconds.iter().map(|s| s.is_warmup).collect();
        assert_eq!(warmup, [true, true, false, false]);
        assert_eq!(summary.seconds[0].stats.operations, 10);

        assert_eq!(summary.overall.operations, 20);
        assert_eq!(summary.overall.max_ms, Some(2.0));
        assert_eq!(summary.measurement_secs, 2.0);
        assert_eq!(summary.overall.throughput_qps, 10.0);
    }

    #[test]
    fn records_outside_the_window_are_discarded() {
        let start = Instant::now() + Duration::from_secs(10);
        let end = start + Duration::from_secs(2);
        let mut aggregator = Aggregator::new(start, start, end, 0, 0);

        let before = success(start - ms(1), Duration::ZERO, ms(1));
        assert_eq!(aggregator.ingest(&before), Err(Discard::BeforeStart));
        let at_end = success(end, Duration::ZERO, ms(1));
        assert_eq!(aggregator.ingest(&at_end), Err(Discard::AfterEnd));
        for i in 0..5 {
            assert_eq!(aggregator.ingest(&success(start, ms(i * 300), ms(1))), Ok(()));
        }

        let summary = aggregator.finish(end);
        assert_eq!(summary.submitted, 7);
        assert_eq!(summary.discarded, 2);
        assert_eq!(summary.used, 5);
        assert_eq!(summary.used + summary.discarded, summary.submitted);
        assert_eq!(summary.overall.operations, 5);
    }

    #[test]
    fn trailing_partial_second_uses_covered_width() {
        let start = Instant::now();
        let end = start + ms(1500);
        let records: Vec<_> = (0..15).map(|i| success(start, ms(i * 100), ms(1))).collect();
        let summary = summarize(start, end, start, &records, 0);

        assert_eq!(summary.seconds.len(), 2);
        assert_eq!(summary.seconds[0].width_secs, 1.0);
        assert_eq!(summary.seconds[0].stats.throughput_qps, 10.0);
        assert_eq!(summary.seconds[1].width_secs, 0.5);
        assert_eq!(summary.seconds[1].stats.operations, 5);
        assert_eq!(summary.seconds[1].stats.throughput_qps, 10.0);
    }

    #[test]
    fn bounded_samples_keep_exact_counters() {
        let start = Instant::now();
        let records: Vec<_> = (0..1000).map(|i| success(start, ms(i), ms(i % 100))).collect();
        let summary = summarize(start, start + Duration::from_secs(1), start, &records, 50);

        let stats = &summary.seconds[0].stats;
        assert_eq!(stats.successes, 1000);
        assert_eq!(stats.max_ms, Some(99.0));
        assert!((stats.mean_ms.unwrap() - 49.5).abs() < 1e-9);
        assert!(stats.p50_ms.unwrap() <= 99.0);
    }

    #[test]
    fn overall_samples_are_bounded_independently() {
        let start = Instant::now();
        let end = start + Duration::from_secs(10);
        let mut aggregator = Aggregator::new(start, start, end, 20, 7).with_overall_samples(0);

        // 1..=9ms, 111 times each, spread over ten seconds.
        for i in 0..999 {
            let latency = ms(i % 9 + 1);
            aggregator.ingest(&success(start, ms(i * 10), latency)).unwrap();
        }
        let summary = aggregator.finish(end);

        assert_eq!(summary.overall.successes, 999);
        assert_eq!(summary.overall.p50_ms, Some(5.0));
        assert_eq!(summary.overall.p99_ms, Some(9.0));
        assert_eq!(summary.overall.max_ms, Some(9.0));
    }
}
