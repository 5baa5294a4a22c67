use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, aio::MultiplexedConnection};
use tracing::info;

use crate::ports::kv_store::{KeyValueStore, StoreResult};

/// [`KeyValueStore`] backed by Redis over one multiplexed connection.
///
/// The connection handle is cheap to clone; every call clones it so concurrent
/// requests pipeline over the same socket.
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
}

impl RedisStore {
    /// Open a client for `url` and establish the shared connection.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!("Connected to key-value store at {}", redacted(url));
        Ok(Self { conn })
    }
}

// Hide credentials when logging a redis URL.
fn redacted(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) if parsed.password().is_some() => {
            let _ = parsed.set_password(Some("***"));
            parsed.to_string()
        }
        Ok(parsed) => parsed.to_string(),
        Err(_) => "<unparsable url>".to_string(),
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: () = conn.del(keys).await?;
        Ok(())
    }

    async fn increment(&self, key: &str, by: i64, expire_at: DateTime<Utc>) -> StoreResult<i64> {
        let mut conn = self.conn.clone();
        let (value,): (i64,) = redis::pipe()
            .atomic()
            .incr(key, by)
            .expire_at(key, expire_at.timestamp())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn hash_increment(
        &self,
        key: &str,
        field: &str,
        by: i64,
        expire_at: DateTime<Utc>,
    ) -> StoreResult<i64> {
        let mut conn = self.conn.clone();
        let (value,): (i64,) = redis::pipe()
            .atomic()
            .hincr(key, field, by)
            .expire_at(key, expire_at.timestamp())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        let values: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(values)
    }

    async fn list_range(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let values: Vec<String> = conn.lrange(key, 0, -1).await?;
        Ok(values)
    }

    async fn list_replace(&self, key: &str, values: &[String]) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic().del(key).ignore();
        if !values.is_empty() {
            pipe.rpush(key, values).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}
