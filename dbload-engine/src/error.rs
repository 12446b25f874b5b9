//! Errors that abort a run before or while it executes.

use thiserror::Error;

use crate::backend::BackendError;

/// Invalid workload configuration, detected before any worker starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A set of weights does not form a valid distribution.
    #[error("invalid weights for {scope}: {reason}")]
    Weights {
        /// The weight set that failed validation, e.g. `categories` or `category "read"`.
        scope: String,
        /// Human readable description of the problem.
        reason: String,
    },

    /// The key universe or skew parameter is unusable.
    #[error("invalid key distribution: {0}")]
    Keys(String),

    /// The number of concurrent workers must be positive.
    #[error("concurrency must be greater than zero")]
    ZeroConcurrency,

    /// A duration that must be positive was zero.
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    /// Any other inconsistent setting.
    #[error("invalid setting `{setting}`: {reason}")]
    Invalid {
        /// Name of the offending setting.
        setting: &'static str,
        /// Human readable description of the problem.
        reason: String,
    },
}

/// Fatal errors that prevent a run from starting or completing.
///
/// Per-operation failures are never reported through this type; they are recorded as metrics.
#[derive(Debug, Error)]
pub enum RunError {
    /// The workload configuration is invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A worker could not establish its initial backend connection.
    #[error("worker {worker} failed to connect after {attempts} attempts: {source}")]
    Connect {
        /// Index of the worker that failed.
        worker: usize,
        /// Number of connection attempts made.
        attempts: u32,
        /// The last connection error.
        #[source]
        source: BackendError,
    },

    /// A background task of the engine failed unexpectedly.
    #[error("internal error: {0}")]
    Internal(String),
}
