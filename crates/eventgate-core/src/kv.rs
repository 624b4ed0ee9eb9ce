//! Shared keyed-KV abstraction
//!
//! Idempotency records, retry counters, breaker state, and the DLQ
//! backup list all live behind this trait. The production
//! implementation is redis; [`InMemoryKv`] backs unit tests.
//!
//! Counter and set-if-absent operations are atomic; callers must treat
//! an existing idempotency key as the authoritative decision.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

/// Key prefix for idempotency records (TTL 24h).
pub const IDEMPOTENCY_PREFIX: &str = "idempotency:";

/// Key prefix for per-event retry counters (TTL 24h).
pub const RETRY_COUNT_PREFIX: &str = "retry:count:";

/// Key prefix for circuit-breaker state per queue type.
pub const BREAKER_PREFIX: &str = "circuit:queue:";

/// Backup list for dead letters when the broker DLQ is unreachable.
pub const DLQ_BACKUP_KEY: &str = "events:dlq:backup";

/// TTL for idempotency records and retry counters.
pub const DAY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("kv backend error: {0}")]
    Backend(String),
}

/// Keyed KV with atomic counters, write-if-absent and a capped list
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Write-if-absent with TTL. Returns true when the write happened,
    /// false when the key already existed.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError>;

    /// Atomic increment; the TTL is applied when the key is created.
    async fn incr_ex(&self, key: &str, ttl: Duration) -> Result<i64, KvError>;

    async fn del(&self, key: &str) -> Result<(), KvError>;

    /// Push onto the head of a list and trim it to `max_len`.
    /// Returns the resulting length.
    async fn lpush_trim(&self, key: &str, value: &str, max_len: usize) -> Result<i64, KvError>;

    /// Pop up to `count` values from the tail of a list (oldest first).
    async fn rpop_count(&self, key: &str, count: usize) -> Result<Vec<String>, KvError>;

    async fn llen(&self, key: &str) -> Result<i64, KvError>;
}

#[derive(Debug)]
enum Entry {
    Value {
        value: String,
        expires_at: Option<Instant>,
    },
    List(Vec<String>),
}

/// In-memory KV for tests; honors TTLs against a monotonic clock
#[derive(Default)]
pub struct InMemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_value(entry: &Entry) -> Option<&str> {
        match entry {
            Entry::Value { value, expires_at } => {
                if expires_at.is_some_and(|at| at <= Instant::now()) {
                    None
                } else {
                    Some(value)
                }
            }
            Entry::List(_) => None,
        }
    }
}

#[async_trait]
impl KvStore for InMemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .and_then(Self::live_value)
            .map(str::to_string))
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut entries = self.entries.lock().await;
        if entries.get(key).and_then(Self::live_value).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry::Value {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn incr_ex(&self, key: &str, ttl: Duration) -> Result<i64, KvError> {
        let mut entries = self.entries.lock().await;
        let current: i64 = entries
            .get(key)
            .and_then(Self::live_value)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let next = current + 1;
        entries.insert(
            key.to_string(),
            Entry::Value {
                value: next.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(next)
    }

    async fn del(&self, key: &str) -> Result<(), KvError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn lpush_trim(&self, key: &str, value: &str, max_len: usize) -> Result<i64, KvError> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::List(Vec::new()));
        if !matches!(entry, Entry::List(_)) {
            *entry = Entry::List(Vec::new());
        }
        let Entry::List(list) = entry else {
            unreachable!()
        };
        list.insert(0, value.to_string());
        list.truncate(max_len);
        Ok(list.len() as i64)
    }

    async fn rpop_count(&self, key: &str, count: usize) -> Result<Vec<String>, KvError> {
        let mut entries = self.entries.lock().await;
        let Some(Entry::List(list)) = entries.get_mut(key) else {
            return Ok(Vec::new());
        };
        let take = count.min(list.len());
        let split_at = list.len() - take;
        let mut popped = list.split_off(split_at);
        popped.reverse();
        Ok(popped)
    }

    async fn llen(&self, key: &str) -> Result<i64, KvError> {
        let entries = self.entries.lock().await;
        Ok(match entries.get(key) {
            Some(Entry::List(list)) => list.len() as i64,
            _ => 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_nx_is_write_if_absent() {
        let kv = InMemoryKv::new();
        assert!(kv.set_nx_ex("k", "first", DAY_TTL).await.unwrap());
        assert!(!kv.set_nx_ex("k", "second", DAY_TTL).await.unwrap());
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let kv = InMemoryKv::new();
        kv.set_nx_ex("k", "v", Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
        // expired key can be written again
        assert!(kv.set_nx_ex("k", "v2", DAY_TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_incr_counts_up() {
        let kv = InMemoryKv::new();
        assert_eq!(kv.incr_ex("n", DAY_TTL).await.unwrap(), 1);
        assert_eq!(kv.incr_ex("n", DAY_TTL).await.unwrap(), 2);
        kv.del("n").await.unwrap();
        assert_eq!(kv.incr_ex("n", DAY_TTL).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_list_push_trim_and_pop() {
        let kv = InMemoryKv::new();
        for i in 0..5 {
            kv.lpush_trim("list", &i.to_string(), 3).await.unwrap();
        }
        assert_eq!(kv.llen("list").await.unwrap(), 3);

        // oldest surviving entries come out first
        let popped = kv.rpop_count("list", 2).await.unwrap();
        assert_eq!(popped, vec!["2".to_string(), "3".to_string()]);
        assert_eq!(kv.llen("list").await.unwrap(), 1);

        let rest = kv.rpop_count("list", 10).await.unwrap();
        assert_eq!(rest, vec!["4".to_string()]);
        assert!(kv.rpop_count("list", 1).await.unwrap().is_empty());
    }
}
