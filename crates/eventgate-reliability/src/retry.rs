//! Retry policy and per-event attempt tracking
//!
//! The policy computes the backoff schedule; the tracker counts
//! attempts per event id in the shared KV (TTL 24h) so the decision
//! survives worker restarts.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use eventgate_core::kv::{KvError, KvStore, DAY_TTL, RETRY_COUNT_PREFIX};

/// Attempts after which an event is dead-lettered.
pub const MAX_RETRIES: u32 = 5;

/// Exponential backoff with jitter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,

    /// Cap on the computed delay
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,

    /// Backoff multiplier per attempt
    pub backoff_factor: f64,

    /// Jitter factor (0.0-1.0); 0.2 means ±20% randomness
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(60_000),
            backoff_factor: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (1-based), jittered.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64 * self.backoff_factor.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);

        let jittered = if self.jitter > 0.0 {
            let mut rng = rand::thread_rng();
            let spread = capped * self.jitter;
            (capped + rng.gen_range(-spread..=spread)).max(0.0)
        } else {
            capped
        };

        Duration::from_millis(jittered as u64)
    }
}

/// Per-event attempt counters in the shared KV
pub struct RetryTracker {
    kv: Arc<dyn KvStore>,
    policy: RetryPolicy,
}

impl RetryTracker {
    pub fn new(kv: Arc<dyn KvStore>, policy: RetryPolicy) -> Self {
        Self { kv, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Attempts recorded so far for this event.
    pub async fn attempts(&self, event_id: &str) -> Result<u32, KvError> {
        let key = counter_key(event_id);
        Ok(self
            .kv
            .get(&key)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    /// True while the event has retries left.
    pub async fn should_retry(&self, event_id: &str) -> Result<bool, KvError> {
        Ok(self.attempts(event_id).await? < self.policy.max_retries)
    }

    /// Count one more attempt; returns the new total.
    pub async fn record_attempt(&self, event_id: &str) -> Result<u32, KvError> {
        let count = self.kv.incr_ex(&counter_key(event_id), DAY_TTL).await?;
        Ok(count.max(0) as u32)
    }

    /// Forget the event after a successful processing.
    pub async fn clear(&self, event_id: &str) -> Result<(), KvError> {
        self.kv.del(&counter_key(event_id)).await
    }

    /// Delay to apply before the given retry attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.policy.delay_for_attempt(attempt)
    }
}

fn counter_key(event_id: &str) -> String {
    format!("{RETRY_COUNT_PREFIX}{event_id}")
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
