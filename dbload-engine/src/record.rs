//! Per-operation outcome records.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::operation::OperationKind;

/// The reason a single operation failed.
///
/// `timeout` and `connection` are distinguished explicitly; every other backend-reported failure
/// is reduced to a coarse category.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The call exceeded the statement timeout.
    Timeout,
    /// The connection was lost, could not be acquired, or could not be re-established.
    Connection,
    /// The backend aborted the statement to resolve a deadlock.
    Deadlock,
    /// A row lock could not be acquired in time.
    LockTimeout,
    /// A constraint (unique key, foreign key, ...) was violated.
    Constraint,
    /// Any other error reported by the backend for the statement.
    Query,
    /// The load generator itself failed while executing the operation.
    Internal,
}

/// Coarse grouping of [`ErrorKind`]s.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// See [`ErrorKind::Timeout`].
    Timeout,
    /// See [`ErrorKind::Connection`].
    Connection,
    /// Everything else, carrying a category.
    Other,
}

impl ErrorKind {
    /// All error kinds, in a stable order used for reporting.
    pub const ALL: [ErrorKind; 7] = [
        ErrorKind::Timeout,
        ErrorKind::Connection,
        ErrorKind::Deadlock,
        ErrorKind::LockTimeout,
        ErrorKind::Constraint,
        ErrorKind::Query,
        ErrorKind::Internal,
    ];

    /// The coarse class of this error.
    pub fn class(self) -> ErrorClass {
        match self {
            ErrorKind::Timeout => ErrorClass::Timeout,
            ErrorKind::Connection => ErrorClass::Connection,
            ErrorKind::Deadlock
            | ErrorKind::LockTimeout
            | ErrorKind::Constraint
            | ErrorKind::Query
            | ErrorKind::Internal => ErrorClass::Other,
        }
    }

    /// The stable `snake_case` name of this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Connection => "connection",
            ErrorKind::Deadlock => "deadlock",
            ErrorKind::LockTimeout => "lock_timeout",
            ErrorKind::Constraint => "constraint",
            ErrorKind::Query => "query",
            ErrorKind::Internal => "internal",
        }
    }
}

impl ErrorClass {
    /// The stable `snake_case` name of this class.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Timeout => "timeout",
            ErrorClass::Connection => "connection",
            ErrorClass::Other => "other",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sums failure counts per [`ErrorClass`], leaving out classes without failures.
pub fn errors_by_class(errors: &BTreeMap<ErrorKind, u64>) -> BTreeMap<ErrorClass, u64> {
    let mut classes = BTreeMap::new();
    for (kind, count) in errors {
        *classes.entry(kind.class()).or_default() += count;
    }
    classes
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a single operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The operation completed successfully.
    Success,
    /// The operation failed.
    Error(ErrorKind),
}

impl Outcome {
    /// Returns `true` for [`Outcome::Success`].
    pub fn is_success(self) -> bool {
        matches!(self, Outcome::Success)
    }
}

/// Whether a read was served by the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheOutcome {
    /// The result was served from the cache.
    Hit,
    /// The cache was consulted but did not hold the result.
    Miss,
    /// The cache was not involved, because it is disabled or the operation is a write.
    NotApplicable,
}

/// The phase of the run an operation was issued in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Issued before the warmup cutoff; excluded from the run summary.
    Warmup,
    /// Issued within the measurement window.
    Measurement,
}

/// The outcome of one executed request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationRecord {
    /// The kind of operation.
    pub kind: OperationKind,
    /// When the operation was issued, on the monotonic clock.
    pub issued_at: Instant,
    /// Time from issue to completion, including any client-side retries.
    pub latency: Duration,
    /// Whether the operation succeeded.
    pub outcome: Outcome,
    /// Whether the operation was served by the cache.
    pub cache: CacheOutcome,
    /// The phase the operation was issued in.
    pub phase: Phase,
}
