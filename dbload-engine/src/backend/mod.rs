//! Storage and cache backends targeted by the load generator.

use std::sync::Arc;

mod common;
mod in_memory;
mod postgres;
mod redis;

pub use common::{
    BackendError, BackendResult, BoxedCacheConnection, BoxedStoreConnection, Cache,
    CacheConnection, Response, Store, StoreConnection,
};
pub use in_memory::{InMemoryCache, InMemoryStore};
pub use postgres::{PostgresConfig, PostgresStore};
pub use redis::RedisCache;

/// The system under test: a store, optionally fronted by a cache.
#[derive(Clone, Debug)]
pub struct Backend {
    /// The authoritative data store.
    pub store: Arc<dyn Store>,
    /// The cache consulted for reads, if enabled.
    pub cache: Option<Arc<dyn Cache>>,
}

impl Backend {
    /// Creates a backend without a cache.
    pub fn new(store: impl Store) -> Self {
        Self {
            store: Arc::new(store),
            cache: None,
        }
    }

    /// Puts the given cache in front of the store.
    pub fn with_cache(mut self, cache: impl Cache) -> Self {
        self.cache = Some(Arc::new(cache));
        self
    }

    /// A short description of the backend, used in logs and reports.
    pub fn describe(&self) -> String {
        match &self.cache {
            Some(cache) => format!("{}+{}", self.store.name(), cache.name()),
            None => self.store.name().to_owned(),
        }
    }
}
