//! Export of run results to files and the console.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use dbload_engine::aggregate::WindowStats;
use dbload_engine::record::{ErrorKind, Phase};
use dbload_engine::{OperationKind, OperationRecord, RecordObserver, RunReport};
use serde::Serialize;
use yansi::Paint;

use crate::config::{Config, MetricsConfig};

/// Builds the common stem of all result files: `<label>_c<concurrency>_<yyyymmddThhmmssZ>`.
pub fn file_stem(label: &str, concurrency: usize, started_at: SystemTime) -> String {
    let timestamp = humantime::format_rfc3339_seconds(started_at)
        .to_string()
        .replace(['-', ':'], "");
    format!("{label}_c{concurrency}_{timestamp}")
}

fn cell(value: Option<f64>) -> String {
    value.map(|value| format!("{value:.3}")).unwrap_or_default()
}

/// Writes one row per second of the run.
pub fn write_seconds_csv<W: io::Write>(writer: W, report: &RunReport) -> Result<()> {
    let mut writer = csv::Writer::from_writer(writer);

    let mut header = vec![
        "second_offset".to_owned(),
        "timestamp".to_owned(),
        "is_warmup".to_owned(),
        "throughput_qps".to_owned(),
        "p50_ms".to_owned(),
        "p95_ms".to_owned(),
        "p99_ms".to_owned(),
        "mean_ms".to_owned(),
        "max_ms".to_owned(),
        "error_rate_pct".to_owned(),
        "cache_hit_rate_pct".to_owned(),
        "operations".to_owned(),
        "errors".to_owned(),
    ];
    header.extend(OperationKind::ALL.iter().map(|kind| format!("{kind}_count")));
    writer.write_record(&header)?;

    for second in &report.summary.seconds {
        let stats = &second.stats;
        let timestamp = report.started_at + Duration::from_secs(second.second_offset);

        let mut row = vec![
            second.second_offset.to_string(),
            humantime::format_rfc3339_millis(timestamp).to_string(),
            second.is_warmup.to_string(),
            format!("{:.3}", stats.throughput_qps),
            cell(stats.p50_ms),
            cell(stats.p95_ms),
            cell(stats.p99_ms),
            cell(stats.mean_ms),
            cell(stats.max_ms),
            cell(stats.error_rate_pct),
            cell(stats.cache_hit_rate_pct),
            stats.operations.to_string(),
            stats.errors.to_string(),
        ];
        row.extend(OperationKind::ALL.iter().map(|kind| {
            let count = stats.operations_by_kind.get(kind).copied().unwrap_or(0);
            count.to_string()
        }));
        writer.write_record(&row)?;
    }

    writer.flush()?;
    Ok(())
}

/// Writes one row per operation kind issued during the measurement window.
pub fn write_operations_csv<W: io::Write>(writer: W, report: &RunReport) -> Result<()> {
    let mut writer = csv::Writer::from_writer(writer);

    let mut header = vec![
        "operation".to_owned(),
        "count".to_owned(),
        "successes".to_owned(),
        "errors".to_owned(),
        "min_ms".to_owned(),
        "max_ms".to_owned(),
        "mean_ms".to_owned(),
        "p50_ms".to_owned(),
        "p95_ms".to_owned(),
        "p99_ms".to_owned(),
        "ops_per_sec".to_owned(),
        "cache_hit_rate_pct".to_owned(),
    ];
    header.extend(ErrorKind::ALL.iter().map(|kind| format!("{kind}_errors")));
    writer.write_record(&header)?;

    for summary in &report.operations {
        let mut row = vec![
            summary.kind.to_string(),
            summary.count.to_string(),
            summary.successes.to_string(),
            summary.errors.to_string(),
            cell(summary.min_ms),
            cell(summary.max_ms),
            cell(summary.mean_ms),
            cell(summary.p50_ms),
            cell(summary.p95_ms),
            cell(summary.p99_ms),
            format!("{:.3}", summary.ops_per_sec),
            cell(summary.cache_hit_rate_pct),
        ];
        row.extend(ErrorKind::ALL.iter().map(|kind| {
            let count = summary.errors_by_kind.get(kind).copied().unwrap_or(0);
            count.to_string()
        }));
        writer.write_record(&row)?;
    }

    writer.flush()?;
    Ok(())
}

const DETAILED_HEADER: [&str; 3] = ["operation_type", "latency_seconds", "latency_ms"];

fn write_sample<W: io::Write>(
    writer: &mut csv::Writer<W>,
    kind: OperationKind,
    latency: Duration,
) -> csv::Result<()> {
    let seconds = latency.as_secs_f64().to_string();
    let millis = (latency.as_nanos() as f64 / 1e6).to_string();
    writer.write_record([kind.as_str(), seconds.as_str(), millis.as_str()])
}

/// Writes one row per retained latency sample of the measurement window.
pub fn write_detailed_csv<W: io::Write>(writer: W, report: &RunReport) -> Result<()> {
    let mut writer = csv::Writer::from_writer(writer);
    writer.write_record(DETAILED_HEADER)?;

    for (kind, samples) in &report.samples {
        for latency in samples {
            write_sample(&mut writer, *kind, *latency)?;
        }
    }

    writer.flush()?;
    Ok(())
}

/// Streams every successful measured latency to `<stem>_detailed.csv` while the run progresses.
///
/// The file is created once the workers are released, since the stem contains the start time.
pub struct DetailedCsvStream {
    output_dir: PathBuf,
    label: String,
    concurrency: usize,
    file: Mutex<Option<(PathBuf, csv::Writer<BufWriter<File>>)>>,
}

impl fmt::Debug for DetailedCsvStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetailedCsvStream")
            .field("output_dir", &self.output_dir)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl DetailedCsvStream {
    /// Creates a stream for the run with the given label and concurrency.
    pub fn new(output_dir: &Path, label: &str, concurrency: usize) -> Self {
        Self {
            output_dir: output_dir.to_owned(),
            label: label.to_owned(),
            concurrency,
            file: Mutex::new(None),
        }
    }

    fn open(&self, started_at: SystemTime) -> Result<(PathBuf, csv::Writer<BufWriter<File>>)> {
        fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("failed to create {}", self.output_dir.display()))?;
        let stem = file_stem(&self.label, self.concurrency, started_at);
        let path = self.output_dir.join(format!("{stem}_detailed.csv"));

        let mut writer = csv::Writer::from_writer(create(&path)?);
        writer.write_record(DETAILED_HEADER)?;
        Ok((path, writer))
    }

    /// Flushes the file and returns its path, if it was written.
    pub fn finish(&self) -> Result<Option<PathBuf>> {
        let Some((path, mut writer)) = self.file.lock().unwrap().take() else {
            return Ok(None);
        };
        writer
            .flush()
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(Some(path))
    }
}

impl RecordObserver for DetailedCsvStream {
    fn started(&self, started_at: SystemTime) {
        match self.open(started_at) {
            Ok((path, writer)) => {
                tracing::info!(path = %path.display(), "streaming detailed latencies");
                *self.file.lock().unwrap() = Some((path, writer));
            }
            Err(err) => tracing::error!("failed to stream detailed latencies: {err:#}"),
        }
    }

    fn observe(&self, record: &OperationRecord) {
        if !record.outcome.is_success() || record.phase != Phase::Measurement {
            return;
        }

        let mut file = self.file.lock().unwrap();
        let Some((path, writer)) = file.as_mut() else {
            return;
        };
        if let Err(err) = write_sample(writer, record.kind, record.latency) {
            tracing::error!(path = %path.display(), "stopped streaming detailed latencies: {err}");
            *file = None;
        }
    }
}

#[derive(Serialize)]
struct SummaryDocument<'a> {
    started_at: String,
    config: &'a Config,
    #[serde(flatten)]
    report: &'a RunReport,
}

/// Writes the complete report together with the configuration that produced it.
pub fn write_summary_json<W: io::Write>(
    writer: W,
    config: &Config,
    report: &RunReport,
) -> Result<()> {
    let document = SummaryDocument {
        started_at: humantime::format_rfc3339_seconds(report.started_at).to_string(),
        config,
        report,
    };
    serde_json::to_writer_pretty(writer, &document)?;
    Ok(())
}

fn create(path: &Path) -> Result<BufWriter<File>> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    Ok(BufWriter::new(file))
}

/// Writes all enabled result files into the configured output directory.
///
/// Returns the paths of the written files.
pub fn export(config: &Config, report: &RunReport) -> Result<Vec<PathBuf>> {
    let MetricsConfig {
        output_dir,
        export_csv,
        stream_detailed_csv,
        export_json,
        ..
    } = &config.metrics;

    if !export_csv && !export_json {
        return Ok(Vec::new());
    }

    fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;
    let stem = file_stem(&report.label, report.concurrency, report.started_at);
    let mut written = Vec::new();

    if *export_csv {
        let path = output_dir.join(format!("{stem}_seconds.csv"));
        write_seconds_csv(create(&path)?, report)?;
        written.push(path);

        let path = output_dir.join(format!("{stem}_summary.csv"));
        write_operations_csv(create(&path)?, report)?;
        written.push(path);

        if !stream_detailed_csv {
            let path = output_dir.join(format!("{stem}_detailed.csv"));
            write_detailed_csv(create(&path)?, report)?;
            written.push(path);
        }
    }

    if *export_json {
        let path = output_dir.join(format!("{stem}_summary.json"));
        write_summary_json(create(&path)?, config, report)?;
        written.push(path);
    }

    Ok(written)
}

struct Millis(Option<f64>);

impl fmt::Display for Millis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(ms) => write!(f, "{ms:.2}ms"),
            None => f.write_str("-"),
        }
    }
}

fn print_window(stats: &WindowStats) {
    print!(
        "  {:.2} operations/s ({} ops",
        stats.throughput_qps.bold(),
        stats.operations.bold()
    );
    if stats.errors > 0 {
        print!(", {}", format!("{} FAILURES", stats.errors).bold().red());
    }
    println!(")");
    println!(
        "  avg: {}; p50: {}; p95: {}; p99: {}; max: {}",
        Millis(stats.mean_ms).bold(),
        Millis(stats.p50_ms),
        Millis(stats.p95_ms),
        Millis(stats.p99_ms),
        Millis(stats.max_ms),
    );
    if let Some(hit_rate) = stats.cache_hit_rate_pct {
        println!("  cache hit rate: {:.1}%", hit_rate.bold());
    }
    if !stats.errors_by_class.is_empty() {
        let classes: Vec<_> = stats
            .errors_by_class
            .iter()
            .map(|(class, count)| format!("{class} {count}"))
            .collect();
        println!("  errors: {}", classes.join(", ").red());
    }
    for (kind, count) in &stats.errors_by_kind {
        println!("    {}", format!("{kind}: {count}").red());
    }
}

/// Prints a human readable summary of the run to stdout.
pub fn print_report(report: &RunReport) {
    let summary = &report.summary;
    println!(
        "{} {} against {} with {} workers, seed {}",
        "RUN:".bold().green(),
        report.label.bold(),
        report.backend,
        report.concurrency.bold(),
        report.seed,
    );
    if report.cancelled {
        println!("{}", "CANCELLED, results are partial".bold().yellow());
    }
    println!(
        "  measured {:.1}s; {} records used, {} discarded",
        summary.measurement_secs, summary.used, summary.discarded
    );

    println!("{}", "OVERALL:".bold().green());
    print_window(&summary.overall);

    for kind in &report.operations {
        print!(
            "{} ({} ops",
            format!("{}:", kind.kind.as_str().to_uppercase()).bold().green(),
            kind.count.bold()
        );
        if kind.errors > 0 {
            print!(", {}", format!("{} FAILURES", kind.errors).bold().red());
        }
        println!(")");
        println!(
            "  {:.2} operations/s; min: {}; avg: {}; p50: {}; p95: {}; p99: {}",
            kind.ops_per_sec.bold(),
            Millis(kind.min_ms),
            Millis(kind.mean_ms).bold(),
            Millis(kind.p50_ms),
            Millis(kind.p95_ms),
            Millis(kind.p99_ms),
        );
        if kind.sampled {
            println!("  {}", "percentiles estimated from a latency sample".dim());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use dbload_engine::WorkerReport;
    use dbload_engine::aggregate::{SecondStats, Summary};
    use dbload_engine::record::{CacheOutcome, ErrorClass, Outcome};
    use dbload_engine::recorder::KindSummary;
    use tokio::time::Instant;

    use super::*;

    fn started_at() -> SystemTime {
        humantime::parse_rfc3339("2024-03-01T12:30:05Z").unwrap()
    }

    fn report() -> RunReport {
        let busy = WindowStats {
            operations: 100,
            successes: 98,
            errors: 2,
            throughput_qps: 98.0,
            p50_ms: Some(10.0),
            p95_ms: Some(12.5),
            p99_ms: Some(15.0),
            mean_ms: Some(10.5),
            max_ms: Some(20.0),
            error_rate_pct: Some(2.0),
            cache_hit_rate_pct: None,
            cache_hits: 0,
            cache_misses: 0,
            operations_by_kind: BTreeMap::from([
                (OperationKind::PointReadPrimary, 90),
                (OperationKind::Update, 10),
            ]),
            errors_by_kind: BTreeMap::from([(ErrorKind::Timeout, 2)]),
            errors_by_class: BTreeMap::from([(ErrorClass::Timeout, 2)]),
        };

        RunReport {
            label: "baseline".into(),
            backend: "memory".into(),
            concurrency: 4,
            seed: 42,
            started_at: started_at(),
            elapsed_secs: 2.0,
            cancelled: false,
            summary: Summary {
                seconds: vec![
                    SecondStats {
                        second_offset: 0,
                        width_secs: 1.0,
                        is_warmup: true,
                        stats: busy.clone(),
                    },
                    SecondStats {
                        second_offset: 1,
                        width_secs: 1.0,
                        is_warmup: false,
                        stats: WindowStats::default(),
                    },
                ],
                overall: WindowStats::default(),
                measurement_secs: 1.0,
                submitted: 100,
                used: 100,
                discarded: 0,
            },
            operations: vec![KindSummary {
                kind: OperationKind::Update,
                count: 10,
                successes: 8,
                errors: 2,
                min_ms: Some(1.0),
                max_ms: Some(20.0),
                mean_ms: Some(5.0),
                p50_ms: Some(4.0),
                p95_ms: Some(18.0),
                p99_ms: Some(20.0),
                ops_per_sec: 8.0,
                cache_hit_rate_pct: None,
                errors_by_kind: BTreeMap::from([(ErrorKind::Deadlock, 2)]),
                errors_by_class: BTreeMap::from([(ErrorClass::Other, 2)]),
                sampled: false,
            }],
            samples: BTreeMap::from([
                (
                    OperationKind::PointReadPrimary,
                    vec![Duration::from_micros(1500)],
                ),
                (
                    OperationKind::Update,
                    vec![Duration::from_millis(4), Duration::from_millis(20)],
                ),
            ]),
            workers: vec![WorkerReport {
                worker: 0,
                operations: 100,
                panics: 0,
            }],
        }
    }

    #[test]
    fn stem_contains_label_concurrency_and_utc_time() {
        assert_eq!(
            file_stem("baseline", 64, started_at()),
            "baseline_c64_20240301T123005Z"
        );
    }

    #[test]
    fn seconds_csv_has_one_row_per_second() {
        let mut buf = Vec::new();
        write_seconds_csv(&mut buf, &report()).unwrap();
        let csv = String::from_utf8(buf).unwrap();
        let lines: Vec<_> = csv.lines().collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[0],
            "second_offset,timestamp,is_warmup,throughput_qps,p50_ms,p95_ms,p99_ms,mean_ms,max_ms,\
             error_rate_pct,cache_hit_rate_pct,operations,errors,point_read_primary_count,\
             point_read_secondary_count,range_read_count,insert_count,update_count"
        );
        assert_eq!(
            lines[1],
            "0,2024-03-01T12:30:05.000Z,true,98.000,10.000,12.500,15.000,10.500,20.000,2.000,,\
             100,2,90,0,0,0,10"
        );
        // Empty seconds keep their row with null latencies.
        assert_eq!(
            lines[2],
            "1,2024-03-01T12:30:06.000Z,false,0.000,,,,,,,,0,0,0,0,0,0,0"
        );
    }

    #[test]
    fn operations_csv_lists_error_kinds() {
        let mut buf = Vec::new();
        write_operations_csv(&mut buf, &report()).unwrap();
        let csv = String::from_utf8(buf).unwrap();
        let lines: Vec<_> = csv.lines().collect();

        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(
            "timeout_errors,connection_errors,deadlock_errors,lock_timeout_errors,\
             constraint_errors,query_errors,internal_errors"
        ));
        assert!(lines[1].starts_with("update,10,8,2,1.000,20.000,5.000,"));
        assert!(lines[1].ends_with(",0,0,2,0,0,0,0"));
    }

    #[test]
    fn summary_json_echoes_config() {
        figment::Jail::expect_with(|_jail| {
            let config = Config::load(None).unwrap();
            let mut buf = Vec::new();
            write_summary_json(&mut buf, &config, &report()).unwrap();

            let json: serde_json::Value = serde_json::from_slice(&buf).unwrap();
            assert_eq!(json["started_at"], "2024-03-01T12:30:05Z");
            assert_eq!(json["label"], "baseline");
            assert_eq!(json["seed"], 42);
            assert_eq!(json["config"]["store"]["type"], "postgres");
            assert_eq!(json["summary"]["seconds"][0]["throughput_qps"], 98.0);
            assert_eq!(json["summary"]["seconds"][1]["p50_ms"], serde_json::Value::Null);
            assert_eq!(json["operations"][0]["errors_by_kind"]["deadlock"], 2);
            assert_eq!(json["operations"][0]["errors_by_class"]["other"], 2);
            assert!(json.get("samples").is_none());

            Ok(())
        });
    }

    #[test]
    fn export_writes_enabled_files() {
        dbload_test::tracing::init();
        let dir = tempfile::tempdir().unwrap();

        figment::Jail::expect_with(|jail| {
            let output_dir = dir.path().join("results");
            jail.set_env("DBLOAD__METRICS__OUTPUT_DIR", output_dir.display());
            jail.set_env("DBLOAD__METRICS__EXPORT_JSON", "false");

            let config = Config::load(None).unwrap();
            let written = export(&config, &report()).unwrap();

            assert_eq!(
                written,
                [
                    output_dir.join("baseline_c4_20240301T123005Z_seconds.csv"),
                    output_dir.join("baseline_c4_20240301T123005Z_summary.csv"),
                    output_dir.join("baseline_c4_20240301T123005Z_detailed.csv"),
                ]
            );
            assert!(written.iter().all(|path| path.is_file()));

            // Streamed runs already wrote their detailed file.
            jail.set_env("DBLOAD__METRICS__STREAM_DETAILED_CSV", "true");
            let config = Config::load(None).unwrap();
            assert_eq!(export(&config, &report()).unwrap().len(), 2);

            Ok(())
        });
    }

    #[test]
    fn detailed_csv_lists_retained_samples() {
        let mut buf = Vec::new();
        write_detailed_csv(&mut buf, &report()).unwrap();
        let csv = String::from_utf8(buf).unwrap();

        assert_eq!(
            csv.lines().collect::<Vec<_>>(),
            [
                "operation_type,latency_seconds,latency_ms",
                "point_read_primary,0.0015,1.5",
                "update,0.004,4",
                "update,0.02,20",
            ]
        );
    }

    #[test]
    fn stream_writes_measured_successes() {
        dbload_test::tracing::init();
        let dir = tempfile::tempdir().unwrap();
        let stream = DetailedCsvStream::new(dir.path(), "baseline", 4);

        let record = |latency_ms, outcome, phase| OperationRecord {
            kind: OperationKind::Insert,
            issued_at: Instant::now(),
            latency: Duration::from_millis(latency_ms),
            outcome,
            cache: CacheOutcome::NotApplicable,
            phase,
        };

        // Nothing is written before the run started.
        stream.observe(&record(1, Outcome::Success, Phase::Measurement));
        stream.started(started_at());
        stream.observe(&record(2, Outcome::Success, Phase::Warmup));
        stream.observe(&record(3, Outcome::Error(ErrorKind::Timeout), Phase::Measurement));
        stream.observe(&record(5, Outcome::Success, Phase::Measurement));

        let path = stream.finish().unwrap().unwrap();
        assert_eq!(path, dir.path().join("baseline_c4_20240301T123005Z_detailed.csv"));
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "operation_type,latency_seconds,latency_ms\ninsert,0.005,5\n"
        );
        assert_eq!(stream.finish().unwrap(), None);
    }
}
