//! A module for defining a [`Workload`] and the per-worker operation streams derived from it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::client::ClientSettings;
use crate::error::ConfigError;
use crate::keys::{DEFAULT_SKEW, KeyDistribution};
use crate::operation::{Operation, OperationKind};
use crate::selector::{CategoryWeights, OperationSelector, default_categories};

/// Shape of range reads over the synthetic creation dates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RangeSettings {
    /// Number of days covered by the data set, starting at the base date.
    pub days: u32,
    /// Maximum number of days covered by a single range read.
    pub max_span_days: u32,
}

impl Default for RangeSettings {
    fn default() -> Self {
        Self {
            days: 1460,
            max_span_days: 30,
        }
    }
}

/// Retry policy for establishing the initial worker connections.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectSettings {
    /// Total number of attempts per worker.
    pub attempts: u32,
    /// Delay before the first retry; doubles with every attempt.
    pub initial_backoff: Duration,
    /// Upper bound for the delay between attempts.
    pub max_backoff: Duration,
}

impl Default for ConnectSettings {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

/// A builder for creating a [`Workload`].
#[derive(Debug)]
pub struct WorkloadBuilder {
    name: String,
    concurrency: usize,
    duration: Duration,
    warmup: Duration,
    think_time: Duration,
    seed: u64,

    key_universe: u64,
    key_skew: f64,
    uniform_keys: bool,

    categories: BTreeMap<String, CategoryWeights>,
    range: RangeSettings,

    client: ClientSettings,
    connect: ConnectSettings,

    reservoir_size: usize,
    bucket_reservoir_size: usize,
    report_interval: Duration,
}

impl WorkloadBuilder {
    /// The number of concurrent closed-loop workers.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Length of the measurement phase.
    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Length of the warmup phase preceding the measurement.
    pub fn warmup(mut self, warmup: Duration) -> Self {
        self.warmup = warmup;
        self
    }

    /// Pause between two consecutive operations of a worker.
    pub fn think_time(mut self, think_time: Duration) -> Self {
        self.think_time = think_time;
        self
    }

    /// Base seed; worker `i` uses `seed + i`.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Number of distinct keys and their Zipfian skew.
    pub fn keys(mut self, universe: u64, skew: f64) -> Self {
        self.key_universe = universe;
        self.key_skew = skew;
        self
    }

    /// Draw keys uniformly, ignoring the skew.
    pub fn uniform_keys(mut self, uniform: bool) -> Self {
        self.uniform_keys = uniform;
        self
    }

    /// Category and operation weights.
    pub fn categories(mut self, categories: BTreeMap<String, CategoryWeights>) -> Self {
        self.categories = categories;
        self
    }

    /// Shape of range reads.
    pub fn range(mut self, range: RangeSettings) -> Self {
        self.range = range;
        self
    }

    /// Behavior of every worker's backend client.
    pub fn client(mut self, client: ClientSettings) -> Self {
        self.client = client;
        self
    }

    /// Retry policy for initial connections.
    pub fn connect(mut self, connect: ConnectSettings) -> Self {
        self.connect = connect;
        self
    }

    /// Latency samples kept per operation kind; `0` keeps all.
    pub fn reservoir_size(mut self, size: usize) -> Self {
        self.reservoir_size = size;
        self
    }

    /// Latency samples kept per one-second bucket; `0` keeps all.
    pub fn bucket_reservoir_size(mut self, size: usize) -> Self {
        self.bucket_reservoir_size = size;
        self
    }

    /// Interval of progress log lines during a run.
    pub fn report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }

    /// Validates the configuration and creates the workload instance.
    pub fn build(self) -> Result<Workload, ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.duration.is_zero() {
            return Err(ConfigError::ZeroDuration("duration"));
        }
        if self.report_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("report_interval"));
        }
        if self.client.statement_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("statement_timeout"));
        }
        if self.connect.attempts == 0 {
            return Err(ConfigError::Invalid {
                setting: "connect.attempts",
                reason: "at least one attempt is required".into(),
            });
        }
        if self.range.max_span_days == 0 || self.range.max_span_days > self.range.days {
            return Err(ConfigError::Invalid {
                setting: "range.max_span_days",
                reason: format!(
                    "must be between 1 and the number of days ({}), got {}",
                    self.range.days, self.range.max_span_days
                ),
            });
        }

        let keys = if self.uniform_keys {
            KeyDistribution::uniform(self.key_universe)?
        } else {
            KeyDistribution::zipfian(self.key_universe, self.key_skew)?
        };
        let selector = OperationSelector::new(&self.categories)?;

        Ok(Workload {
            name: self.name,
            concurrency: self.concurrency,
            duration: self.duration,
            warmup: self.warmup,
            think_time: self.think_time,
            seed: self.seed,
            keys: Arc::new(keys),
            selector: Arc::new(selector),
            range: self.range,
            client: self.client,
            connect: self.connect,
            reservoir_size: self.reservoir_size,
            bucket_reservoir_size: self.bucket_reservoir_size,
            report_interval: self.report_interval,
        })
    }
}

/// A validated experiment: how many workers issue which operations for how long.
#[derive(Clone, Debug)]
pub struct Workload {
    pub(crate) name: String,
    pub(crate) concurrency: usize,
    pub(crate) duration: Duration,
    pub(crate) warmup: Duration,
    pub(crate) think_time: Duration,
    pub(crate) seed: u64,

    keys: Arc<KeyDistribution>,
    selector: Arc<OperationSelector>,
    range: RangeSettings,

    pub(crate) client: ClientSettings,
    pub(crate) connect: ConnectSettings,

    pub(crate) reservoir_size: usize,
    pub(crate) bucket_reservoir_size: usize,
    pub(crate) report_interval: Duration,
}

impl Workload {
    /// Constructs a new workload builder with the given name.
    pub fn builder(name: impl Into<String>) -> WorkloadBuilder {
        WorkloadBuilder {
            name: name.into(),
            concurrency: 1,
            duration: Duration::from_secs(60),
            warmup: Duration::ZERO,
            think_time: Duration::ZERO,
            seed: rand::random(),

            key_universe: 1_000_000,
            key_skew: DEFAULT_SKEW,
            uniform_keys: false,

            categories: default_categories(),
            range: RangeSettings::default(),

            client: ClientSettings::default(),
            connect: ConnectSettings::default(),

            reservoir_size: 0,
            bucket_reservoir_size: crate::aggregate::DEFAULT_BUCKET_SAMPLES,
            report_interval: Duration::from_secs(30),
        }
    }

    /// Name of the workload, used as label in logs and reports.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The number of concurrent workers.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Length of the measurement phase.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Length of the warmup phase.
    pub fn warmup(&self) -> Duration {
        self.warmup
    }

    /// The base seed.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// The key popularity model shared by all workers.
    pub fn keys(&self) -> &KeyDistribution {
        &self.keys
    }

    /// Creates the operation stream of the given worker.
    pub fn plan(&self, worker: usize) -> WorkerPlan {
        WorkerPlan {
            worker,
            rng: SmallRng::seed_from_u64(self.seed.wrapping_add(worker as u64)),
            keys: Arc::clone(&self.keys),
            selector: Arc::clone(&self.selector),
            range: self.range,
            inserted: 0,
        }
    }
}

/// The deterministic operation stream of one worker.
///
/// Two plans created from the same seed and worker index yield identical sequences.
#[derive(Debug)]
pub struct WorkerPlan {
    worker: usize,
    rng: SmallRng,
    keys: Arc<KeyDistribution>,
    selector: Arc<OperationSelector>,
    range: RangeSettings,
    inserted: u64,
}

impl WorkerPlan {
    /// Draws the next operation.
    pub fn next_operation(&mut self) -> Operation {
        match self.selector.select(&mut self.rng) {
            OperationKind::PointReadPrimary => Operation::PointReadPrimary {
                user_id: self.next_user(),
            },
            OperationKind::PointReadSecondary => Operation::PointReadSecondary {
                user_id: self.next_user(),
            },
            OperationKind::RangeRead => {
                let max_span = self.range.max_span_days;
                let start_day = self.rng.random_range(0..=self.range.days - max_span);
                let span = self.rng.random_range(1..=max_span);
                Operation::RangeRead {
                    start_day,
                    end_day: start_day + span - 1,
                }
            }
            OperationKind::Insert => {
                let seq = self.inserted;
                self.inserted += 1;
                Operation::Insert {
                    worker: self.worker,
                    seq,
                    created_day: self.rng.random_range(0..self.range.days),
                    score: self.rng.random_range(0..1000),
                }
            }
            OperationKind::Update => Operation::Update {
                user_id: self.next_user(),
                score: self.rng.random_range(0..1000),
            },
        }
    }

    /// Maps the next key rank to a user id; ids start at `1`.
    fn next_user(&mut self) -> u64 {
        self.keys.sample(&mut self.rng) + 1
    }
}
