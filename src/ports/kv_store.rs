use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Error type for key-value store operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StoreError {
    /// The store could not be reached or the connection dropped
    #[error("Store connection error: {0}")]
    Connection(String),

    /// The store rejected or failed a command
    #[error("Store command '{command}' failed: {message}")]
    Command { command: String, message: String },

    /// A stored value did not have the expected shape
    #[error("Corrupt value under key '{key}': {message}")]
    Corrupt { key: String, message: String },
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Command {
                command: err.code().unwrap_or("UNKNOWN").to_string(),
                message: err.to_string(),
            }
        }
    }
}

/// Result type for key-value store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// KeyValueStore defines the port for the external network key-value store.
///
/// Every increment both bumps the value and (re)sets the key's absolute
/// expiry; the store owns atomicity, callers never wrap calls in a local
/// transaction.
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    /// Read a string value
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Write a string value without expiry
    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Delete keys of any type; missing keys are ignored
    async fn delete(&self, keys: &[String]) -> StoreResult<()>;

    /// Atomically add `by` to an integer counter and set its expiry
    async fn increment(&self, key: &str, by: i64, expire_at: DateTime<Utc>) -> StoreResult<i64>;

    /// Atomically add `by` to a hash field and set the hash's expiry
    async fn hash_increment(
        &self,
        key: &str,
        field: &str,
        by: i64,
        expire_at: DateTime<Utc>,
    ) -> StoreResult<i64>;

    /// Read every field of a hash; an absent key yields an empty map
    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    /// Read a whole list in order; an absent key yields an empty list
    async fn list_range(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Atomically replace a list with `values`
    async fn list_replace(&self, key: &str, values: &[String]) -> StoreResult<()>;
}
