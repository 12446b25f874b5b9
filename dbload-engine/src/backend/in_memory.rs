//! In-memory backends for tests and dry runs.
//!
//! Both backends are [`Clone`] so tests can hold a handle for direct inspection while the run
//! owns another copy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;

use super::common::{
    BackendError, BackendResult, BoxedCacheConnection, BoxedStoreConnection, Cache,
    CacheConnection, Response, Store, StoreConnection,
};
use crate::operation::{Operation, user_email};

#[derive(Debug, Default)]
struct Table {
    /// Users that were updated, with their latest score.
    scores: HashMap<u64, u32>,
    /// Number of inserted users.
    inserted: u64,
}

/// A store that simulates a fixed service time per operation.
#[derive(Clone, Debug)]
pub struct InMemoryStore {
    rows: u64,
    latency: Duration,
    reachable: bool,
    table: Arc<Mutex<Table>>,
    executed: Arc<AtomicU64>,
}

impl InMemoryStore {
    /// Creates a store pre-loaded with `rows` users and no service time.
    pub fn new(rows: u64) -> Self {
        Self {
            rows,
            latency: Duration::ZERO,
            reachable: true,
            table: Arc::default(),
            executed: Arc::default(),
        }
    }

    /// Creates a store that refuses every connection attempt.
    pub fn unreachable() -> Self {
        Self {
            reachable: false,
            ..Self::new(0)
        }
    }

    /// Makes every operation take `latency` to complete.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// The number of operations executed across all connections.
    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    /// The number of users inserted across all connections.
    pub fn inserted(&self) -> u64 {
        self.table.lock().unwrap().inserted
    }

    /// The latest score written for the given user, if it was updated.
    pub fn score(&self, user_id: u64) -> Option<u32> {
        self.table.lock().unwrap().scores.get(&user_id).copied()
    }
}

#[async_trait::async_trait]
impl Store for InMemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> BackendResult<BoxedStoreConnection> {
        if !self.reachable {
            return Err(BackendError::connection(
                "connecting to in-memory store",
                "store is unreachable",
            ));
        }
        Ok(Box::new(self.clone()))
    }
}

#[async_trait::async_trait]
impl StoreConnection for InMemoryStore {
    async fn execute(&mut self, operation: &Operation) -> BackendResult<Response> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.executed.fetch_add(1, Ordering::Relaxed);

        let response = match *operation {
            Operation::PointReadPrimary { user_id } | Operation::PointReadSecondary { user_id } => {
                let rows = if (1..=self.rows).contains(&user_id) {
                    let score = self.score(user_id);
                    json!([{ "user_id": user_id, "email": user_email(user_id), "score": score }])
                } else {
                    json!([])
                };
                Response::Rows(rows.to_string())
            }
            Operation::RangeRead { start_day, end_day } => {
                Response::Rows(json!([{ "start_day": start_day, "end_day": end_day }]).to_string())
            }
            Operation::Insert { .. } => {
                self.table.lock().unwrap().inserted += 1;
                Response::Written(1)
            }
            Operation::Update { user_id, score } => {
                if !(1..=self.rows).contains(&user_id) {
                    return Ok(Response::Written(0));
                }
                self.table.lock().unwrap().scores.insert(user_id, score);
                Response::Written(1)
            }
        };

        Ok(response)
    }
}

/// A cache backed by a `HashMap` with per-entry expiry.
#[derive(Clone, Debug, Default)]
pub struct InMemoryCache {
    entries: Arc<Mutex<HashMap<String, (String, Instant)>>>,
}

impl InMemoryCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the cache holds an unexpired entry for `key`.
    pub fn contains(&self, key: &str) -> bool {
        let entries = self.entries.lock().unwrap();
        entries
            .get(key)
            .is_some_and(|(_, expires)| *expires > Instant::now())
    }
}

#[async_trait::async_trait]
impl Cache for InMemoryCache {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> BackendResult<BoxedCacheConnection> {
        Ok(Box::new(self.clone()))
    }
}

#[async_trait::async_trait]
impl CacheConnection for InMemoryCache {
    async fn get(&mut self, key: &str) -> BackendResult<Option<String>> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&mut self, key: &str, value: &str, ttl: Duration) -> BackendResult<()> {
        let expires = Instant::now() + ttl;
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_owned(), (value.to_owned(), expires));
        Ok(())
    }

    async fn delete(&mut self, keys: &[String]) -> BackendResult<()> {
        let mut entries = self.entries.lock().unwrap();
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn store_simulates_latency() {
        let store = InMemoryStore::new(10).with_latency(Duration::from_millis(25));
        let mut conn = store.connect().await.unwrap();

        let start = Instant::now();
        let response = conn
            .execute(&Operation::PointReadPrimary { user_id: 3 })
            .await
            .unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(25));
        assert!(matches!(response, Response::Rows(ref rows) if rows.contains("user3@example.com")));

        let missing = conn
            .execute(&Operation::PointReadPrimary { user_id: 11 })
            .await
            .unwrap();
        assert_eq!(missing, Response::Rows("[]".into()));
        assert_eq!(store.executed(), 2);
    }

    #[tokio::test]
    async fn store_applies_writes() {
        let store = InMemoryStore::new(10);
        let mut conn = store.connect().await.unwrap();

        let update = Operation::Update { user_id: 4, score: 77 };
        assert_eq!(conn.execute(&update).await.unwrap(), Response::Written(1));
        assert_eq!(store.score(4), Some(77));

        let insert = Operation::Insert {
            worker: 0,
            seq: 1,
            created_day: 3,
            score: 5,
        };
        conn.execute(&insert).await.unwrap();
        assert_eq!(store.inserted(), 1);
    }

    #[tokio::test]
    async fn unreachable_store_fails_to_connect() {
        let err = InMemoryStore::unreachable().connect().await.err().unwrap();
        assert!(err.is_connection());
    }

    #[tokio::test(start_paused = true)]
    async fn cache_entries_expire() {
        let cache = InMemoryCache::new();
        let mut conn = cache.connect().await.unwrap();

        conn.set("user:id:1", "{}", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(conn.get("user:id:1").await.unwrap().as_deref(), Some("{}"));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(conn.get("user:id:1").await.unwrap(), None);
        assert!(!cache.contains("user:id:1"));
    }

    #[tokio::test]
    async fn cache_deletes_keys() {
        let cache = InMemoryCache::new();
        let mut conn = cache.connect().await.unwrap();
        conn.set("a", "1", Duration::from_secs(60)).await.unwrap();
        conn.set("b", "2", Duration::from_secs(60)).await.unwrap();

        conn.delete(&["a".into(), "missing".into()]).await.unwrap();
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
    }
}
