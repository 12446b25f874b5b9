//! Redis cache.

use std::time::Duration;

use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;

use super::common::{BackendError, BackendResult, BoxedCacheConnection, Cache, CacheConnection};

/// A Redis cache. Each worker opens its own multiplexed connection.
#[derive(Debug)]
pub struct RedisCache {
    client: redis::Client,
}

impl RedisCache {
    /// Creates the client without connecting.
    pub fn new(url: &str) -> BackendResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|err| BackendError::connection("parsing redis url", err))?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl Cache for RedisCache {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn connect(&self) -> BackendResult<BoxedCacheConnection> {
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| BackendError::connection("connecting to redis", err))?;
        Ok(Box::new(RedisConnection { conn }))
    }
}

struct RedisConnection {
    conn: MultiplexedConnection,
}

fn classify(context: &str, err: redis::RedisError) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout {
            context: context.to_owned(),
        }
    } else if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        BackendError::connection(context, err)
    } else {
        BackendError::query(crate::record::ErrorKind::Query, context, err)
    }
}

#[async_trait::async_trait]
impl CacheConnection for RedisConnection {
    async fn get(&mut self, key: &str) -> BackendResult<Option<String>> {
        self.conn
            .get(key)
            .await
            .map_err(|err| classify("cache lookup", err))
    }

    async fn set(&mut self, key: &str, value: &str, ttl: Duration) -> BackendResult<()> {
        let seconds = ttl.as_secs().max(1);
        self.conn
            .set_ex(key, value, seconds)
            .await
            .map_err(|err| classify("cache population", err))
    }

    async fn delete(&mut self, keys: &[String]) -> BackendResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        self.conn
            .del(keys)
            .await
            .map_err(|err| classify("cache invalidation", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_url() {
        assert!(RedisCache::new("not-a-url").is_err());
        assert!(RedisCache::new("redis://127.0.0.1:6379").is_ok());
    }
}
