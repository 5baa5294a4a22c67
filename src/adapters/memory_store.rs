use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::ports::kv_store::{KeyValueStore, StoreError, StoreResult};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    List(Vec<String>),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::Hash(_) => "hash",
            Value::List(_) => "list",
        }
    }
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expire_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_at.is_some_and(|at| at <= now)
    }
}

/// In-process [`KeyValueStore`] for single-node deployments and tests.
///
/// An expired key is dropped the next time it is touched, and every
/// [`SWEEP_INTERVAL`] expiring writes the whole map is swept.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    expiring_writes: AtomicUsize,
}

/// Expiring writes between two sweeps of expired keys
pub const SWEEP_INTERVAL: usize = 256;

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys
    pub async fn len(&self) -> usize {
        let now = Utc::now();
        let entries = self.entries.lock().await;
        entries.values().filter(|e| !e.is_expired(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    // Bucket keys age out without being read again, so lazy expiry alone never
    // frees them.
    fn after_expiring_write(&self, entries: &mut HashMap<String, Entry>, now: DateTime<Utc>) {
        let writes = self.expiring_writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % SWEEP_INTERVAL == 0 {
            entries.retain(|_, e| !e.is_expired(now));
        }
    }
}

fn wrong_type(key: &str, command: &str, found: &Value) -> StoreError {
    StoreError::Command {
        command: command.to_string(),
        message: format!("key '{}' holds a {}", key, found.kind()),
    }
}

// Remove `key` if it has expired, then return the live entry, if any.
fn live<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
    now: DateTime<Utc>,
) -> Option<&'a mut Entry> {
    if entries.get(key).is_some_and(|e| e.is_expired(now)) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut entries = self.entries.lock().await;
        match live(&mut entries, key, Utc::now()) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(other) => Err(wrong_type(key, "GET", &other.value)),
        }
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expire_at: None,
            },
        );
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<()> {
        let mut entries = self.entries.lock().await;
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }

    async fn increment(&self, key: &str, by: i64, expire_at: DateTime<Utc>) -> StoreResult<i64> {
        let mut entries = self.entries.lock().await;
        let now = Utc::now();
        let current = match live(&mut entries, key, now) {
            None => 0,
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => s.parse::<i64>().map_err(|_| StoreError::Command {
                command: "INCRBY".to_string(),
                message: format!("value under '{}' is not an integer", key),
            })?,
            Some(other) => return Err(wrong_type(key, "INCRBY", &other.value)),
        };
        let next = current.checked_add(by).ok_or_else(|| StoreError::Command {
            command: "INCRBY".to_string(),
            message: "increment would overflow".to_string(),
        })?;
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(next.to_string()),
                expire_at: Some(expire_at),
            },
        );
        self.after_expiring_write(&mut entries, now);
        Ok(next)
    }

    async fn hash_increment(
        &self,
        key: &str,
        field: &str,
        by: i64,
        expire_at: DateTime<Utc>,
    ) -> StoreResult<i64> {
        let mut entries = self.entries.lock().await;
        let now = Utc::now();
        live(&mut entries, key, now);
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Hash(HashMap::new()),
            expire_at: None,
        });
        let hash = match &mut entry.value {
            Value::Hash(hash) => hash,
            other => return Err(wrong_type(key, "HINCRBY", other)),
        };
        let current = match hash.get(field) {
            None => 0,
            Some(raw) => raw.parse::<i64>().map_err(|_| StoreError::Command {
                command: "HINCRBY".to_string(),
                message: format!("hash value under '{}.{}' is not an integer", key, field),
            })?,
        };
        let next = current + by;
        hash.insert(field.to_string(), next.to_string());
        entry.expire_at = Some(expire_at);
        self.after_expiring_write(&mut entries, now);
        Ok(next)
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut entries = self.entries.lock().await;
        match live(&mut entries, key, Utc::now()) {
            None => Ok(HashMap::new()),
            Some(Entry {
                value: Value::Hash(h),
                ..
            }) => Ok(h.clone()),
            Some(other) => Err(wrong_type(key, "HGETALL", &other.value)),
        }
    }

    async fn list_range(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut entries = self.entries.lock().await;
        match live(&mut entries, key, Utc::now()) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::List(l),
                ..
            }) => Ok(l.clone()),
            Some(other) => Err(wrong_type(key, "LRANGE", &other.value)),
        }
    }

    async fn list_replace(&self, key: &str, values: &[String]) -> StoreResult<()> {
        let mut entries = self.entries.lock().await;
        if values.is_empty() {
            entries.remove(key);
        } else {
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::List(values.to_vec()),
                    expire_at: None,
                },
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_increment_sets_expiry() {
        let store = MemoryStore::new();
        let later = Utc::now() + Duration::minutes(5);
        assert_eq!(store.increment("k", 2, later).await.unwrap(), 2);
        assert_eq!(store.increment("k", 3, later).await.unwrap(), 5);
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("5"));
    }

    #[tokio::test]
    async fn test_expired_keys_disappear() {
        let store = MemoryStore::new();
        let past = Utc::now() - Duration::seconds(1);
        store.increment("gone", 1, past).await.unwrap();
        store.hash_increment("gone-hash", "f", 1, past).await.unwrap();
        assert_eq!(store.get("gone").await.unwrap(), None);
        assert!(store.hash_get_all("gone-hash").await.unwrap().is_empty());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_unread_expired_keys_are_swept() {
        let store = MemoryStore::new();
        let past = Utc::now() - Duration::seconds(1);
        for i in 0..1000 {
            store.increment(&format!("bucket:{i}"), 1, past).await.unwrap();
        }
        let held = store.entries.lock().await.len();
        assert!(held < SWEEP_INTERVAL, "{held} expired keys still held");

        let later = Utc::now() + Duration::minutes(5);
        for i in 0..SWEEP_INTERVAL {
            store.increment(&format!("live:{i}"), 1, later).await.unwrap();
        }
        assert_eq!(store.len().await, SWEEP_INTERVAL);
    }

    #[tokio::test]
    async fn test_hash_and_list_operations() {
        let store = MemoryStore::new();
        let later = Utc::now() + Duration::minutes(5);
        store.hash_increment("h", "a", 1, later).await.unwrap();
        store.hash_increment("h", "a", 1, later).await.unwrap();
        store.hash_increment("h", "b", 1, later).await.unwrap();
        let hash = store.hash_get_all("h").await.unwrap();
        assert_eq!(hash.get("a").map(String::as_str), Some("2"));
        assert_eq!(hash.get("b").map(String::as_str), Some("1"));

        let ids = vec!["one".to_string(), "two".to_string()];
        store.list_replace("l", &ids).await.unwrap();
        assert_eq!(store.list_range("l").await.unwrap(), ids);
        store.list_replace("l", &[]).await.unwrap();
        assert!(store.list_range("l").await.unwrap().is_empty());

        store.delete(&["h".to_string()]).await.unwrap();
        assert!(store.hash_get_all("h").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_type_mismatch_is_a_command_error() {
        let store = MemoryStore::new();
        store.set("s", "text").await.unwrap();
        let err = store.hash_get_all("s").await.unwrap_err();
        assert!(matches!(err, StoreError::Command { .. }));
    }
}
