//! Execution of single operations against the system under test.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::backend::{
    Backend, BackendError, BackendResult, BoxedCacheConnection, BoxedStoreConnection, Response,
    Store,
};
use crate::operation::Operation;
use crate::record::{CacheOutcome, ErrorKind, Outcome};

/// Default time-to-live of cache entries.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Slack granted on top of the statement timeout before the client gives up on a call.
pub const TIMEOUT_GRACE: Duration = Duration::from_secs(1);

/// How writes keep the cache consistent with the store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Invalidation {
    /// Entries are never invalidated and age out after their TTL.
    #[default]
    Ttl,
    /// Updates synchronously delete the cached copies of the modified row.
    Delete,
}

/// Behavior of a [`BackendClient`].
#[derive(Clone, Debug)]
pub struct ClientSettings {
    /// Longest successful call; slower calls are recorded as timeouts. The client abandons a
    /// call after this plus [`TIMEOUT_GRACE`].
    pub statement_timeout: Duration,
    /// Time-to-live of populated cache entries.
    pub cache_ttl: Duration,
    /// Cache invalidation policy for writes.
    pub invalidation: Invalidation,
    /// Number of retries for transient failures such as deadlocks.
    pub transient_retries: u32,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            statement_timeout: Duration::from_secs(2),
            cache_ttl: DEFAULT_CACHE_TTL,
            invalidation: Invalidation::Ttl,
            transient_retries: 0,
        }
    }
}

/// The result of [`BackendClient::execute`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Execution {
    /// End-to-end latency of the call, including retries.
    pub latency: Duration,
    /// Whether the call succeeded.
    pub outcome: Outcome,
    /// Whether the call was served by the cache.
    pub cache: CacheOutcome,
}

/// A worker's connection to the store and, if enabled, the cache.
///
/// Broken or abandoned store connections are discarded and re-established on the next call.
pub struct BackendClient {
    backend: Backend,
    settings: ClientSettings,
    worker: usize,
    store: Option<BoxedStoreConnection>,
    cache: Option<BoxedCacheConnection>,
}

impl std::fmt::Debug for BackendClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendClient")
            .field("backend", &self.backend.describe())
            .field("worker", &self.worker)
            .field("connected", &self.store.is_some())
            .finish()
    }
}

impl BackendClient {
    /// Establishes the worker's connections.
    pub async fn connect(
        backend: &Backend,
        settings: ClientSettings,
        worker: usize,
    ) -> BackendResult<Self> {
        let store = backend.store.connect().await?;
        let cache = match &backend.cache {
            Some(cache) => Some(cache.connect().await?),
            None => None,
        };

        Ok(Self {
            backend: backend.clone(),
            settings,
            worker,
            store: Some(store),
            cache,
        })
    }

    /// Executes one operation and measures it.
    ///
    /// Never fails: backend errors are reported through [`Execution::outcome`].
    pub async fn execute(&mut self, operation: &Operation) -> Execution {
        let start = Instant::now();
        let limit = self.settings.statement_timeout + TIMEOUT_GRACE;
        let mut cache = CacheOutcome::NotApplicable;

        let result = tokio::time::timeout(limit, self.run(operation, &mut cache)).await;
        let latency = start.elapsed();

        let outcome = match result {
            Ok(Ok(())) if latency > self.settings.statement_timeout => {
                Outcome::Error(ErrorKind::Timeout)
            }
            Ok(Ok(())) => Outcome::Success,
            Ok(Err(err)) => {
                tracing::trace!(worker = self.worker, error = %err, "operation failed");
                Outcome::Error(err.kind())
            }
            // A store call in flight owned the taken connection, which was dropped with it.
            Err(_elapsed) => Outcome::Error(ErrorKind::Timeout),
        };

        Execution {
            latency,
            outcome,
            cache,
        }
    }

    async fn run(&mut self, operation: &Operation, cache: &mut CacheOutcome) -> BackendResult<()> {
        let key = operation.cache_key();
        if let (Some(key), Some(conn)) = (&key, self.cache.as_mut()) {
            match conn.get(key).await {
                Ok(Some(_)) => {
                    *cache = CacheOutcome::Hit;
                    return Ok(());
                }
                Ok(None) => *cache = CacheOutcome::Miss,
                Err(err) => {
                    tracing::debug!(worker = self.worker, error = %err, "cache lookup failed");
                    *cache = CacheOutcome::Miss;
                }
            }
        }

        let response = self.execute_store(operation).await?;

        let Some(conn) = self.cache.as_mut() else {
            return Ok(());
        };
        match (key, response) {
            (Some(key), Response::Rows(rows)) => {
                if let Err(err) = conn.set(&key, &rows, self.settings.cache_ttl).await {
                    tracing::debug!(worker = self.worker, error = %err, "cache population failed");
                }
            }
            (None, Response::Written(_)) if self.settings.invalidation == Invalidation::Delete => {
                let keys = operation.affected_cache_keys();
                if let Err(err) = conn.delete(&keys).await {
                    tracing::debug!(worker = self.worker, error = %err, "cache invalidation failed");
                }
            }
            _ => {}
        }

        Ok(())
    }

    async fn execute_store(&mut self, operation: &Operation) -> BackendResult<Response> {
        let mut retries = self.settings.transient_retries;
        loop {
            let mut conn = match self.store.take() {
                Some(conn) => conn,
                None => reconnect(self.backend.store.as_ref()).await?,
            };

            match conn.execute(operation).await {
                Ok(response) => {
                    self.store = Some(conn);
                    return Ok(response);
                }
                Err(err) => {
                    if !err.is_connection() {
                        self.store = Some(conn);
                    }
                    if err.is_transient() && retries > 0 {
                        retries -= 1;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }
}

async fn reconnect(store: &dyn Store) -> BackendResult<BoxedStoreConnection> {
    store.connect().await.map_err(|err| match err {
        err @ BackendError::Connection { .. } => err,
        err => BackendError::connection("reconnecting to store", err),
    })
}
