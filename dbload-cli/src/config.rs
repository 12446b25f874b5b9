//! Configuration for the load generator.
//!
//! Configuration can be loaded from multiple sources with the following precedence (highest to
//! lowest):
//!
//! 1. Environment variables (prefixed with `DBLOAD__`)
//! 2. YAML configuration file (specified via `-c` or `--config` flag)
//! 3. Defaults
//!
//! See [`Config`] for a description of all configuration fields and their defaults.
//!
//! # Environment Variables
//!
//! Environment variables use `DBLOAD__` as a prefix and double underscores (`__`) to denote nested
//! configuration structures. For example:
//!
//! - `DBLOAD__WORKLOAD__CONCURRENCY=64` sets the number of workers
//! - `DBLOAD__STORE__TYPE=postgres` selects the PostgreSQL store
//! - `DBLOAD__STORE__URL=postgres://localhost/bench` sets its connection string
//!
//! # YAML Configuration File
//!
//! ```yaml
//! store:
//!   type: postgres
//!   url: postgres://postgres@localhost:5432/bench
//!   pool_size: 64
//!
//! cache:
//!   enabled: true
//!   type: redis
//!   url: redis://localhost:6379
//!   ttl: 5m
//!
//! workload:
//!   concurrency: 64
//!   warmup: 60s
//!   duration: 5m
//!   keys:
//!     universe: 1000000
//!     skew: 0.99
//!   categories:
//!     read:
//!       weight: 90
//!       operations: { point_read_primary: 80, point_read_secondary: 15, range_read: 5 }
//!     write:
//!       weight: 10
//!       operations: { insert: 50, update: 50 }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use dbload_engine::backend::{
    Backend, InMemoryCache, InMemoryStore, PostgresConfig, PostgresStore, RedisCache,
};
use dbload_engine::client::{ClientSettings, DEFAULT_CACHE_TTL, Invalidation};
use dbload_engine::keys::DEFAULT_SKEW;
use dbload_engine::selector::CategoryWeights;
use dbload_engine::workload::RangeSettings;
use dbload_engine::{ConfigError, OperationKind, Workload};
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

/// Environment variable prefix for all configuration options.
const ENV_PREFIX: &str = "DBLOAD__";

/// The authoritative data store under test.
///
/// The `type` field in YAML or `__TYPE` in environment variables determines which variant is used.
#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    /// PostgreSQL (type `"postgres"`).
    ///
    /// # Example
    ///
    /// ```yaml
    /// store:
    ///   type: postgres
    ///   url: postgres://postgres@localhost:5432/bench
    ///   pool_size: 64
    ///   lock_timeout: 200ms
    /// ```
    Postgres {
        /// Connection string.
        ///
        /// # Environment Variable
        ///
        /// `DBLOAD__STORE__URL`
        url: String,

        /// Size of the connection pool. Raised to the worker count if smaller.
        #[serde(default = "default_pool_size")]
        pool_size: u32,

        /// Server-side lock timeout of every session.
        #[serde(default = "default_lock_timeout", with = "humantime_serde")]
        lock_timeout: Duration,
    },

    /// A simulated in-process store (type `"memory"`), useful for dry runs.
    Memory {
        /// Number of pre-loaded users.
        #[serde(default = "default_rows")]
        rows: u64,

        /// Simulated service time of every operation.
        #[serde(default, with = "humantime_serde")]
        latency: Duration,
    },
}

fn default_pool_size() -> u32 {
    20
}

fn default_lock_timeout() -> Duration {
    Duration::from_millis(200)
}

fn default_rows() -> u64 {
    1_000_000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Postgres {
            url: "postgres://postgres@localhost:5432/postgres".into(),
            pool_size: default_pool_size(),
            lock_timeout: default_lock_timeout(),
        }
    }
}

/// The kind of cache placed in front of the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    /// A Redis server at [`CacheConfig::url`].
    Redis,
    /// An in-process cache.
    Memory,
}

/// Cache configuration.
///
/// Used in: [`Config::cache`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether reads consult the cache.
    ///
    /// # Default
    ///
    /// `false`
    ///
    /// # Environment Variable
    ///
    /// `DBLOAD__CACHE__ENABLED`
    pub enabled: bool,

    /// The cache implementation.
    #[serde(rename = "type")]
    pub kind: CacheKind,

    /// Connection string of the Redis server.
    pub url: String,

    /// Time-to-live of cached entries.
    ///
    /// # Default
    ///
    /// `5m`
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// How updates keep cached rows consistent: `ttl` (let entries age out) or `delete`.
    ///
    /// # Default
    ///
    /// `ttl`
    pub invalidation: Invalidation,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            kind: CacheKind::Redis,
            url: "redis://localhost:6379".into(),
            ttl: DEFAULT_CACHE_TTL,
            invalidation: Invalidation::Ttl,
        }
    }
}

/// Key popularity model.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct KeysConfig {
    /// Number of distinct keys. Keys map to user ids `1..=universe`.
    pub universe: u64,
    /// Zipfian skew; `0` is uniform.
    pub skew: f64,
    /// Draw keys uniformly regardless of `skew`.
    pub uniform: bool,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            universe: 1_000_000,
            skew: DEFAULT_SKEW,
            uniform: false,
        }
    }
}

/// Shape of range reads.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RangeConfig {
    /// Days covered by the data set, starting 2020-01-01.
    pub days: u32,
    /// Maximum number of days covered by one range read.
    pub max_span_days: u32,
    /// Maximum number of rows returned by one range read.
    pub limit: u32,
}

impl Default for RangeConfig {
    fn default() -> Self {
        let range = RangeSettings::default();
        Self {
            days: range.days,
            max_span_days: range.max_span_days,
            limit: 100,
        }
    }
}

/// Weights of one operation category.
#[derive(Debug, Deserialize, Serialize)]
pub struct CategoryConfig {
    /// Share of this category in percent.
    pub weight: f64,
    /// Share of each operation within the category in percent.
    pub operations: BTreeMap<OperationKind, f64>,
}

/// The workload driven against the backend.
///
/// Used in: [`Config::workload`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Number of concurrent closed-loop workers.
    ///
    /// # Environment Variable
    ///
    /// `DBLOAD__WORKLOAD__CONCURRENCY`
    pub concurrency: usize,

    /// Length of the measurement phase.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,

    /// Length of the warmup phase, excluded from the summary.
    #[serde(with = "humantime_serde")]
    pub warmup: Duration,

    /// Pause between two operations of a worker.
    #[serde(with = "humantime_serde")]
    pub think_time: Duration,

    /// Base seed. Chosen randomly if absent and reported with the results.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    /// Server-side statement timeout. The client gives up one second later.
    #[serde(with = "humantime_serde")]
    pub statement_timeout: Duration,

    /// Retries for deadlocked operations.
    pub transient_retries: u32,

    /// Key popularity model.
    pub keys: KeysConfig,

    /// Shape of range reads.
    pub range: RangeConfig,

    /// Operation mix. Defaults to 90% reads and 10% writes if absent.
    ///
    /// Configured categories replace the default mix entirely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub categories: Option<BTreeMap<String, CategoryConfig>>,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            duration: Duration::from_secs(300),
            warmup: Duration::from_secs(60),
            think_time: Duration::ZERO,
            seed: None,
            statement_timeout: Duration::from_secs(2),
            transient_retries: 0,
            keys: KeysConfig::default(),
            range: RangeConfig::default(),
            categories: None,
        }
    }
}

/// Metrics collection and result export.
///
/// Used in: [`Config::metrics`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Latency samples kept per operation kind; `0` keeps all.
    pub reservoir_size: usize,
    /// Latency samples kept per one-second bucket; `0` keeps all.
    pub bucket_reservoir_size: usize,
    /// Interval of progress log lines.
    #[serde(with = "humantime_serde")]
    pub report_interval: Duration,
    /// Directory receiving result files. Created if missing.
    pub output_dir: PathBuf,
    /// Label of the run, used as prefix of result files.
    pub label: String,
    /// Write the per-second, per-operation and per-sample CSV files.
    pub export_csv: bool,
    /// Write per-sample latencies while the run progresses instead of from the retained samples
    /// at the end. Only effective together with `export_csv`.
    pub stream_detailed_csv: bool,
    /// Write the JSON summary.
    pub export_json: bool,
    /// Port of the Prometheus scrape endpoint; disabled if unset.
    ///
    /// # Environment Variable
    ///
    /// `DBLOAD__METRICS__PROMETHEUS_PORT`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prometheus_port: Option<u16>,
    /// Upper bounds of the latency histogram buckets, in seconds.
    pub latency_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            reservoir_size: 0,
            bucket_reservoir_size: dbload_engine::aggregate::DEFAULT_BUCKET_SAMPLES,
            report_interval: Duration::from_secs(30),
            output_dir: PathBuf::from("results"),
            label: "run".into(),
            export_csv: true,
            stream_detailed_csv: false,
            export_json: true,
            prometheus_port: None,
            latency_buckets: vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ],
        }
    }
}

/// Runtime configuration for the Tokio async runtime.
///
/// Used in: [`Config::runtime`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Runtime {
    /// Number of worker threads for the runtime.
    ///
    /// # Default
    ///
    /// Defaults to the number of CPU cores on the host machine.
    ///
    /// # Environment Variable
    ///
    /// `DBLOAD__RUNTIME__WORKER_THREADS`
    pub worker_threads: usize,
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus::get(),
        }
    }
}

/// Log output format, written to stderr.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// [`LogFormat::Pretty`] if stderr is a terminal, [`LogFormat::Simplified`] otherwise.
    Auto,
    /// Colored, human readable lines.
    Pretty,
    /// Plain text lines without colors.
    Simplified,
    /// One JSON object per line.
    Json,
}

/// Minimum level of emitted log events.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => LevelFilter::OFF,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// Logging configuration.
///
/// Used in: [`Config::logging`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Logging {
    /// Minimum log level. A plain level in `RUST_LOG` takes precedence, any other `RUST_LOG`
    /// value is used as a full filter directive.
    ///
    /// # Environment Variable
    ///
    /// `DBLOAD__LOGGING__LEVEL`
    pub level: LogLevel,

    /// Log output format.
    ///
    /// # Environment Variable
    ///
    /// `DBLOAD__LOGGING__FORMAT`
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Auto,
        }
    }
}

/// Main configuration struct for the load generator.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// The store under test. See [`StoreConfig`].
    pub store: StoreConfig,

    /// The optional cache in front of the store. See [`CacheConfig`].
    pub cache: CacheConfig,

    /// The workload. See [`WorkloadConfig`].
    pub workload: WorkloadConfig,

    /// Metrics and result export. See [`MetricsConfig`].
    pub metrics: MetricsConfig,

    /// Logging configuration. See [`Logging`].
    pub logging: Logging,

    /// Configuration of the async runtime. See [`Runtime`].
    pub runtime: Runtime,
}

impl Config {
    /// Loads configuration from the provided arguments.
    ///
    /// Configuration is merged in the following order (later sources override earlier ones):
    /// 1. Default values
    /// 2. YAML configuration file (if provided)
    /// 3. Environment variables (prefixed with `DBLOAD__`)
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = figment::Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        Ok(config)
    }

    /// Validates the workload settings and builds the engine's [`Workload`].
    pub fn workload(&self) -> Result<Workload, ConfigError> {
        let workload = &self.workload;
        let mut builder = Workload::builder(self.metrics.label.clone())
            .concurrency(workload.concurrency)
            .duration(workload.duration)
            .warmup(workload.warmup)
            .think_time(workload.think_time)
            .keys(workload.keys.universe, workload.keys.skew)
            .uniform_keys(workload.keys.uniform)
            .range(RangeSettings {
                days: workload.range.days,
                max_span_days: workload.range.max_span_days,
            })
            .client(ClientSettings {
                statement_timeout: workload.statement_timeout,
                cache_ttl: self.cache.ttl,
                invalidation: self.cache.invalidation,
                transient_retries: workload.transient_retries,
            })
            .reservoir_size(self.metrics.reservoir_size)
            .bucket_reservoir_size(self.metrics.bucket_reservoir_size)
            .report_interval(self.metrics.report_interval);

        if let Some(seed) = workload.seed {
            builder = builder.seed(seed);
        }
        if let Some(categories) = &workload.categories {
            let categories = categories
                .iter()
                .map(|(name, category)| {
                    let weights = CategoryWeights::new(
                        category.weight,
                        category.operations.iter().map(|(kind, w)| (*kind, *w)),
                    );
                    (name.clone(), weights)
                })
                .collect();
            builder = builder.categories(categories);
        }

        builder.build()
    }

    /// Creates the backend described by the `store` and `cache` sections.
    ///
    /// Does not connect; connections are established by the workers. `run_tag` keeps inserted
    /// rows unique across runs.
    pub fn backend(&self, run_tag: &str) -> Result<Backend> {
        let mut backend = match &self.store {
            StoreConfig::Postgres {
                url,
                pool_size,
                lock_timeout,
            } => {
                let config = PostgresConfig {
                    url: url.clone(),
                    pool_size: *pool_size,
                    statement_timeout: self.workload.statement_timeout,
                    lock_timeout: *lock_timeout,
                    range_limit: self.workload.range.limit,
                    run_tag: run_tag.to_owned(),
                };
                let store = PostgresStore::new(config, self.workload.concurrency)
                    .context("failed to configure postgres store")?;
                Backend::new(store)
            }
            StoreConfig::Memory { rows, latency } => {
                Backend::new(InMemoryStore::new(*rows).with_latency(*latency))
            }
        };

        if self.cache.enabled {
            backend = match self.cache.kind {
                CacheKind::Redis => {
                    let cache = RedisCache::new(&self.cache.url)
                        .context("failed to configure redis cache")?;
                    backend.with_cache(cache)
                }
                CacheKind::Memory => backend.with_cache(InMemoryCache::new()),
            };
        }

        Ok(backend)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        figment::Jail::expect_with(|_jail| {
            let config = Config::load(None).unwrap();
            assert!(matches!(config.store, StoreConfig::Postgres { .. }));
            assert!(!config.cache.enabled);
            assert_eq!(config.workload.concurrency, 10);
            assert_eq!(config.workload.warmup, Duration::from_secs(60));
            assert_eq!(config.logging.level, LogLevel::Info);
            assert_eq!(config.metrics.prometheus_port, None);
            assert!(!config.metrics.stream_detailed_csv);

            let workload = config.workload().unwrap();
            assert_eq!(workload.concurrency(), 10);
            assert_eq!(workload.keys().universe(), 1_000_000);

            Ok(())
        });
    }

    #[test]
    fn configurable_via_env() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("DBLOAD__STORE__TYPE", "memory");
            jail.set_env("DBLOAD__STORE__LATENCY", "5ms");
            jail.set_env("DBLOAD__CACHE__ENABLED", "true");
            jail.set_env("DBLOAD__CACHE__TYPE", "memory");
            jail.set_env("DBLOAD__CACHE__INVALIDATION", "delete");
            jail.set_env("DBLOAD__WORKLOAD__CONCURRENCY", "32");
            jail.set_env("DBLOAD__WORKLOAD__DURATION", "2m");
            jail.set_env("DBLOAD__WORKLOAD__KEYS__SKEW", "1.2");
            jail.set_env("DBLOAD__LOGGING__LEVEL", "debug");
            jail.set_env("DBLOAD__LOGGING__FORMAT", "json");

            let config = Config::load(None).unwrap();

            let StoreConfig::Memory { rows, latency } = &dbg!(&config).store else {
                panic!("expected memory store");
            };
            assert_eq!(*rows, 1_000_000);
            assert_eq!(*latency, Duration::from_millis(5));
            assert!(config.cache.enabled);
            assert_eq!(config.cache.kind, CacheKind::Memory);
            assert_eq!(config.cache.invalidation, Invalidation::Delete);
            assert_eq!(config.workload.concurrency, 32);
            assert_eq!(config.workload.duration, Duration::from_secs(120));
            assert_eq!(config.workload.keys.skew, 1.2);
            assert_eq!(config.logging.level, LogLevel::Debug);
            assert_eq!(config.logging.format, LogFormat::Json);

            let backend = config.backend("test").unwrap();
            assert_eq!(backend.describe(), "memory+memory");

            Ok(())
        });
    }

    #[test]
    fn configurable_via_yaml() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile
            .write_all(
                br#"
            store:
                type: memory
                rows: 1000
            workload:
                concurrency: 4
                warmup: 0s
                seed: 42
                keys:
                    universe: 1000
                    uniform: true
                categories:
                    read:
                        weight: 70
                        operations:
                            point_read_primary: 100
                    write:
                        weight: 30
                        operations:
                            update: 100
            metrics:
                label: baseline
                reservoir_size: 5000
                prometheus_port: 9464
                latency_buckets: [0.01, 0.1, 1]
            "#,
            )
            .unwrap();

        figment::Jail::expect_with(|_jail| {
            let config = Config::load(Some(tempfile.path())).unwrap();

            assert_eq!(config.workload.seed, Some(42));
            assert_eq!(config.metrics.label, "baseline");
            assert_eq!(config.metrics.reservoir_size, 5000);
            assert_eq!(config.metrics.prometheus_port, Some(9464));
            assert_eq!(config.metrics.latency_buckets, [0.01, 0.1, 1.0]);

            let categories = config.workload.categories.as_ref().unwrap();
            assert_eq!(categories.len(), 2);
            assert_eq!(
                categories["read"].operations,
                BTreeMap::from([(OperationKind::PointReadPrimary, 100.0)])
            );

            let workload = config.workload().unwrap();
            assert_eq!(workload.name(), "baseline");
            assert_eq!(workload.seed(), 42);
            assert!(workload.keys().is_uniform());

            Ok(())
        });
    }

    #[test]
    fn env_overrides_yaml() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile
            .write_all(
                br#"
            store:
                type: postgres
                url: postgres://localhost/yaml
            "#,
            )
            .unwrap();

        figment::Jail::expect_with(|jail| {
            jail.set_env("DBLOAD__STORE__URL", "postgres://localhost/env");

            let config = Config::load(Some(tempfile.path())).unwrap();

            let StoreConfig::Postgres { url, pool_size, .. } = &dbg!(&config).store else {
                panic!("expected postgres store");
            };
            // Env should overwrite the yaml config
            assert_eq!(url, "postgres://localhost/env");
            assert_eq!(*pool_size, 20);

            Ok(())
        });
    }

    #[test]
    fn invalid_weights_are_rejected() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile
            .write_all(
                br#"
            workload:
                categories:
                    read:
                        weight: 80
                        operations:
                            point_read_primary: 100
            "#,
            )
            .unwrap();

        figment::Jail::expect_with(|_jail| {
            let config = Config::load(Some(tempfile.path())).unwrap();
            let err = config.workload().unwrap_err();
            assert!(matches!(err, ConfigError::Weights { .. }));
            Ok(())
        });
    }
}
