//! Traits and error types shared by all backends.

use std::fmt::Debug;
use std::time::Duration;

use thiserror::Error;

use crate::operation::Operation;
use crate::record::ErrorKind;

/// A type-erased [`StoreConnection`].
pub type BoxedStoreConnection = Box<dyn StoreConnection>;

/// A type-erased [`CacheConnection`].
pub type BoxedCacheConnection = Box<dyn CacheConnection>;

/// The authoritative data store, e.g. a relational database.
#[async_trait::async_trait]
pub trait Store: Debug + Send + Sync + 'static {
    /// The backend name, used for diagnostics.
    fn name(&self) -> &'static str;

    /// Opens a dedicated connection for one worker.
    async fn connect(&self) -> BackendResult<BoxedStoreConnection>;
}

/// A single connection to a [`Store`], owned by one worker.
#[async_trait::async_trait]
pub trait StoreConnection: Send + 'static {
    /// Executes one operation and returns its result.
    async fn execute(&mut self, operation: &Operation) -> BackendResult<Response>;
}

/// A key-value cache in front of the [`Store`].
#[async_trait::async_trait]
pub trait Cache: Debug + Send + Sync + 'static {
    /// The backend name, used for diagnostics.
    fn name(&self) -> &'static str;

    /// Opens a dedicated connection for one worker.
    async fn connect(&self) -> BackendResult<BoxedCacheConnection>;
}

/// A single connection to a [`Cache`], owned by one worker.
#[async_trait::async_trait]
pub trait CacheConnection: Send + 'static {
    /// Looks up a cached value.
    async fn get(&mut self, key: &str) -> BackendResult<Option<String>>;

    /// Stores a value that expires after `ttl`.
    async fn set(&mut self, key: &str, value: &str, ttl: Duration) -> BackendResult<()>;

    /// Removes the given keys. Missing keys are ignored.
    async fn delete(&mut self, keys: &[String]) -> BackendResult<()>;
}

/// The result of a successfully executed operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    /// Rows returned by a read, serialized as a JSON array.
    Rows(String),
    /// Number of rows affected by a write.
    Written(u64),
}

/// A failure reported by a backend for a single operation or connection attempt.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend did not respond within the statement timeout.
    #[error("operation timed out: {context}")]
    Timeout {
        /// What was being executed.
        context: String,
    },

    /// The connection failed, was lost, or could not be established.
    #[error("connection error: {context}")]
    Connection {
        /// What was being executed.
        context: String,
        /// The underlying error.
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The backend rejected the statement.
    #[error("{category} error: {context}")]
    Query {
        /// The coarse category of the failure.
        category: ErrorKind,
        /// What was being executed.
        context: String,
        /// The underlying error.
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl BackendError {
    /// Creates a [`BackendError::Connection`].
    pub fn connection(
        context: impl Into<String>,
        cause: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Connection {
            context: context.into(),
            cause: cause.into(),
        }
    }

    /// Creates a [`BackendError::Query`] of the given category.
    pub fn query(
        category: ErrorKind,
        context: impl Into<String>,
        cause: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Query {
            category,
            context: context.into(),
            cause: cause.into(),
        }
    }

    /// The error kind recorded for the failed operation.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Connection { .. } => ErrorKind::Connection,
            Self::Query { category, .. } => *category,
        }
    }

    /// Returns `true` if the connection that produced this error must not be reused.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    /// Returns `true` if retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Deadlock
    }
}

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;
