//! Redis-backed KV and breaker store

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use eventgate_core::kv::{KvError, KvStore, BREAKER_PREFIX};
use eventgate_reliability::{BreakerError, BreakerSnapshot, BreakerStore, CircuitState};

use crate::QueueError;

/// Redis implementation of the shared KV
///
/// `ConnectionManager` reconnects on its own; clones share the
/// underlying multiplexed connection.
#[derive(Clone)]
pub struct RedisKv {
    manager: ConnectionManager,
}

impl RedisKv {
    pub async fn connect(url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(url).map_err(QueueError::from)?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(QueueError::from)?;
        Ok(Self { manager })
    }

    pub fn from_manager(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> ConnectionManager {
        self.manager.clone()
    }

    pub async fn ping(&self) -> bool {
        let mut conn = self.manager.clone();
        let pong: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
        pong.is_ok()
    }
}

fn kv_err(e: redis::RedisError) -> KvError {
    KvError::Backend(e.to_string())
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.manager.clone();
        conn.get(key).await.map_err(kv_err)
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut conn = self.manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async(&mut conn)
            .await
            .map_err(kv_err)?;
        Ok(reply.is_some())
    }

    async fn incr_ex(&self, key: &str, ttl: Duration) -> Result<i64, KvError> {
        let mut conn = self.manager.clone();
        let count: i64 = conn.incr(key, 1).await.map_err(kv_err)?;
        if count == 1 {
            let _: bool = conn
                .expire(key, ttl.as_secs() as i64)
                .await
                .map_err(kv_err)?;
        }
        Ok(count)
    }

    async fn del(&self, key: &str) -> Result<(), KvError> {
        let mut conn = self.manager.clone();
        let _: i64 = conn.del(key).await.map_err(kv_err)?;
        Ok(())
    }

    async fn lpush_trim(&self, key: &str, value: &str, max_len: usize) -> Result<i64, KvError> {
        let mut conn = self.manager.clone();
        let (len, _): (i64, String) = redis::pipe()
            .atomic()
            .lpush(key, value)
            .ltrim(key, 0, max_len as isize - 1)
            .query_async(&mut conn)
            .await
            .map_err(kv_err)?;
        Ok(len.min(max_len as i64))
    }

    async fn rpop_count(&self, key: &str, count: usize) -> Result<Vec<String>, KvError> {
        let mut conn = self.manager.clone();
        let values: Vec<String> = conn
            .rpop(key, std::num::NonZeroUsize::new(count))
            .await
            .map_err(kv_err)?;
        Ok(values)
    }

    async fn llen(&self, key: &str) -> Result<i64, KvError> {
        let mut conn = self.manager.clone();
        conn.llen(key).await.map_err(kv_err)
    }
}

fn breaker_err(e: redis::RedisError) -> BreakerError {
    BreakerError::Store(e.to_string())
}

fn breaker_keys(resource: &str) -> [String; 6] {
    [
        format!("{BREAKER_PREFIX}{resource}:state"),
        format!("{BREAKER_PREFIX}{resource}:failure_count"),
        format!("{BREAKER_PREFIX}{resource}:success_count"),
        format!("{BREAKER_PREFIX}{resource}:opened_at"),
        format!("{BREAKER_PREFIX}{resource}:half_opened_at"),
        format!("{BREAKER_PREFIX}{resource}:updated_at"),
    ]
}

fn parse_time(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .filter(|v| !v.is_empty())
        .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn format_time(value: Option<DateTime<Utc>>) -> String {
    value.map(|t| t.to_rfc3339()).unwrap_or_default()
}

/// Breaker snapshots live under `circuit:queue:<resource>:*`; the save
/// is a single MULTI so readers never observe a torn snapshot.
#[async_trait]
impl BreakerStore for RedisKv {
    async fn load(&self, resource: &str) -> Result<Option<BreakerSnapshot>, BreakerError> {
        let keys = breaker_keys(resource);
        let mut conn = self.manager.clone();
        let (state, failure_count, success_count, opened_at, half_opened_at, updated_at): (
            Option<String>,
            Option<u32>,
            Option<u32>,
            Option<String>,
            Option<String>,
            Option<String>,
        ) = redis::cmd("MGET")
            .arg(&keys[0])
            .arg(&keys[1])
            .arg(&keys[2])
            .arg(&keys[3])
            .arg(&keys[4])
            .arg(&keys[5])
            .query_async(&mut conn)
            .await
            .map_err(breaker_err)?;

        let Some(state) = state else {
            return Ok(None);
        };
        let state: CircuitState = state
            .parse()
            .map_err(|e: String| BreakerError::Store(e))?;

        Ok(Some(BreakerSnapshot {
            state,
            failure_count: failure_count.unwrap_or(0),
            success_count: success_count.unwrap_or(0),
            opened_at: parse_time(opened_at),
            half_opened_at: parse_time(half_opened_at),
            updated_at: parse_time(updated_at).unwrap_or_else(Utc::now),
        }))
    }

    async fn save(&self, resource: &str, snapshot: &BreakerSnapshot) -> Result<(), BreakerError> {
        let keys = breaker_keys(resource);
        let mut conn = self.manager.clone();
        let _: () = redis::pipe()
            .atomic()
            .set(&keys[0], snapshot.state.to_string())
            .set(&keys[1], snapshot.failure_count)
            .set(&keys[2], snapshot.success_count)
            .set(&keys[3], format_time(snapshot.opened_at))
            .set(&keys[4], format_time(snapshot.half_opened_at))
            .set(&keys[5], format_time(Some(snapshot.updated_at)))
            .query_async(&mut conn)
            .await
            .map_err(breaker_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breaker_key_layout() {
        let keys = breaker_keys("rabbitmq");
        assert_eq!(keys[0], "circuit:queue:rabbitmq:state");
        assert_eq!(keys[1], "circuit:queue:rabbitmq:failure_count");
        assert_eq!(keys[2], "circuit:queue:rabbitmq:success_count");
        assert_eq!(keys[3], "circuit:queue:rabbitmq:opened_at");
    }

    #[test]
    fn test_time_round_trip() {
        let now = Utc::now();
        let parsed = parse_time(Some(format_time(Some(now)))).unwrap();
        assert_eq!(parsed.timestamp_millis(), now.timestamp_millis());
        assert_eq!(parse_time(Some(String::new())), None);
        assert_eq!(parse_time(None), None);
    }
}
