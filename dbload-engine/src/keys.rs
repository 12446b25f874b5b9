//! Skewed and uniform key popularity models.
//!
//! Keys are identified by their popularity rank in `[0, N)`, where rank `0` is the most popular
//! key. In Zipfian mode the frequency of rank `r` is proportional to `1 / (r + 1)^α`.

use rand::Rng;

use crate::error::ConfigError;

/// Default skew parameter, matching a strongly skewed "hot key" workload.
pub const DEFAULT_SKEW: f64 = 0.99;

/// Generates key indices according to a popularity model over a fixed key universe.
///
/// The distribution is immutable after construction and can be shared across workers, each of
/// which samples with its own random source.
#[derive(Clone, Debug)]
pub struct KeyDistribution {
    universe: u64,
    skew: f64,
    /// Cumulative probabilities per rank. Empty in uniform mode.
    cumulative: Vec<f64>,
}

impl KeyDistribution {
    /// Creates a Zipfian distribution over `universe` keys with skew `alpha`.
    ///
    /// An `alpha` of exactly `0` yields a uniform distribution.
    pub fn zipfian(universe: u64, alpha: f64) -> Result<Self, ConfigError> {
        if universe == 0 {
            return Err(ConfigError::Keys("key universe must not be empty".into()));
        }
        if !alpha.is_finite() || alpha < 0.0 {
            return Err(ConfigError::Keys(format!(
                "skew must be a finite, non-negative number, got {alpha}"
            )));
        }
        if alpha == 0.0 || universe == 1 {
            return Self::uniform(universe);
        }

        let len = usize::try_from(universe).map_err(|_| {
            ConfigError::Keys(format!("key universe {universe} is too large for this platform"))
        })?;

        let mut cumulative = Vec::with_capacity(len);
        let mut total = 0.0;
        for rank in 0..len {
            total += 1.0 / ((rank + 1) as f64).powf(alpha);
            cumulative.push(total);
        }
        for mass in &mut cumulative {
            *mass /= total;
        }
        // Guard against rounding leaving the last entry slightly below 1.
        if let Some(last) = cumulative.last_mut() {
            *last = 1.0;
        }

        Ok(Self {
            universe,
            skew: alpha,
            cumulative,
        })
    }

    /// Creates a uniform distribution over `universe` keys.
    pub fn uniform(universe: u64) -> Result<Self, ConfigError> {
        if universe == 0 {
            return Err(ConfigError::Keys("key universe must not be empty".into()));
        }

        Ok(Self {
            universe,
            skew: 0.0,
            cumulative: Vec::new(),
        })
    }

    /// The number of distinct keys.
    pub fn universe(&self) -> u64 {
        self.universe
    }

    /// The effective skew parameter; `0` in uniform mode.
    pub fn skew(&self) -> f64 {
        self.skew
    }

    /// Returns `true` if keys are drawn uniformly.
    pub fn is_uniform(&self) -> bool {
        self.cumulative.is_empty()
    }

    /// Draws a key rank in `[0, N)`.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> u64 {
        if self.universe == 1 {
            return 0;
        }
        if self.cumulative.is_empty() {
            return rng.random_range(0..self.universe);
        }

        let u: f64 = rng.random();
        let rank = self.cumulative.partition_point(|&mass| mass <= u);
        rank.min(self.cumulative.len() - 1) as u64
    }

    /// The probability of drawing the given rank.
    pub fn probability(&self, rank: u64) -> f64 {
        if rank >= self.universe {
            return 0.0;
        }
        if self.cumulative.is_empty() {
            return 1.0 / self.universe as f64;
        }

        let rank = rank as usize;
        let below = if rank == 0 { 0.0 } else { self.cumulative[rank - 1] };
        self.cumulative[rank] - below
    }
}
