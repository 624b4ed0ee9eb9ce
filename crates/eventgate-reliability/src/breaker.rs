//! Per-resource circuit breaker
//!
//! State is kept in a [`BreakerStore`] so every API worker and drain
//! worker sees the same breaker. Each read-modify-write goes through a
//! single store snapshot put; `is_available` may race with
//! `record_failure`, which at worst lets one extra call cross an OPEN
//! boundary.
//!
//! # State machine
//!
//! ```text
//! ┌─────────┐  failure threshold  ┌─────────┐   open_timeout   ┌──────────┐
//! │ Closed  │ ─────────────────► │  Open   │ ───────────────► │ HalfOpen │
//! └─────────┘                     └─────────┘                  └──────────┘
//!      ▲                               ▲                            │
//!      │        success threshold      └──────── any failure ───────┤
//!      └────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls allowed
    Closed,

    /// Failure threshold exceeded - calls rejected
    Open,

    /// Testing if the back-end recovered
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

impl std::str::FromStr for CircuitState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "closed" => Ok(Self::Closed),
            "open" => Ok(Self::Open),
            "half_open" => Ok(Self::HalfOpen),
            other => Err(format!("unknown circuit state: {other}")),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures required to open the circuit
    pub failure_threshold: u32,

    /// Successes required in half-open to close the circuit
    pub success_threshold: u32,

    /// Time to wait in open before probing again
    #[serde(with = "duration_millis")]
    pub open_timeout: Duration,

    /// Patience with a half-open circuit that sees no successes
    #[serde(with = "duration_millis")]
    pub half_open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            open_timeout: Duration::from_secs(60),
            half_open_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults for the queue back-ends, which tolerate more noise
    /// before tripping.
    pub fn for_queue() -> Self {
        Self {
            failure_threshold: 10,
            success_threshold: 5,
            ..Self::default()
        }
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    pub fn with_half_open_timeout(mut self, timeout: Duration) -> Self {
        self.half_open_timeout = timeout;
        self
    }
}

/// One breaker's persisted state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub half_opened_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl BreakerSnapshot {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
            half_opened_at: None,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BreakerError {
    #[error("breaker store error: {0}")]
    Store(String),
}

/// Storage for breaker snapshots, keyed by resource
#[async_trait]
pub trait BreakerStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<BreakerSnapshot>, BreakerError>;

    async fn save(&self, key: &str, snapshot: &BreakerSnapshot) -> Result<(), BreakerError>;
}

/// In-process breaker store for tests and single-node deployments
#[derive(Default)]
pub struct InMemoryBreakerStore {
    snapshots: RwLock<HashMap<String, BreakerSnapshot>>,
}

impl InMemoryBreakerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BreakerStore for InMemoryBreakerStore {
    async fn load(&self, key: &str) -> Result<Option<BreakerSnapshot>, BreakerError> {
        Ok(self.snapshots.read().await.get(key).cloned())
    }

    async fn save(&self, key: &str, snapshot: &BreakerSnapshot) -> Result<(), BreakerError> {
        self.snapshots
            .write()
            .await
            .insert(key.to_string(), snapshot.clone());
        Ok(())
    }
}

/// A circuit breaker for one resource
pub struct CircuitBreaker {
    key: String,
    config: CircuitBreakerConfig,
    store: Arc<dyn BreakerStore>,
}

impl CircuitBreaker {
    pub fn new(
        key: impl Into<String>,
        config: CircuitBreakerConfig,
        store: Arc<dyn BreakerStore>,
    ) -> Self {
        Self {
            key: key.into(),
            config,
            store,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Whether a call should be attempted right now.
    ///
    /// In OPEN, this is also where the OPEN -> HALF_OPEN transition
    /// happens once `open_timeout` has elapsed. A HALF_OPEN breaker
    /// that has sat without a single success for `half_open_timeout`
    /// reverts to OPEN.
    pub async fn is_available(&self) -> Result<bool, BreakerError> {
        let snapshot = self.load_or_init().await?;

        match snapshot.state {
            CircuitState::Closed => Ok(true),
            CircuitState::Open => {
                if elapsed_since(snapshot.opened_at) >= self.config.open_timeout {
                    let mut next = snapshot;
                    next.state = CircuitState::HalfOpen;
                    next.failure_count = 0;
                    next.success_count = 0;
                    next.half_opened_at = Some(Utc::now());
                    next.updated_at = Utc::now();
                    self.store.save(&self.key, &next).await?;
                    info!(resource = %self.key, "Circuit half-open, probing");
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            CircuitState::HalfOpen => {
                if snapshot.success_count == 0
                    && elapsed_since(snapshot.half_opened_at) >= self.config.half_open_timeout
                {
                    self.open(snapshot).await?;
                    return Ok(false);
                }
                Ok(true)
            }
        }
    }

    pub async fn record_success(&self) -> Result<(), BreakerError> {
        let mut snapshot = self.load_or_init().await?;

        match snapshot.state {
            CircuitState::Closed => {
                if snapshot.failure_count > 0 {
                    snapshot.failure_count = 0;
                    snapshot.updated_at = Utc::now();
                    self.store.save(&self.key, &snapshot).await?;
                }
                Ok(())
            }
            CircuitState::HalfOpen => {
                snapshot.success_count += 1;
                if snapshot.success_count >= self.config.success_threshold {
                    info!(resource = %self.key, "Circuit closed");
                    self.store.save(&self.key, &BreakerSnapshot::closed()).await
                } else {
                    snapshot.updated_at = Utc::now();
                    self.store.save(&self.key, &snapshot).await
                }
            }
            // a success cannot arrive while open; nothing to record
            CircuitState::Open => Ok(()),
        }
    }

    pub async fn record_failure(&self) -> Result<(), BreakerError> {
        let mut snapshot = self.load_or_init().await?;

        match snapshot.state {
            CircuitState::Closed => {
                snapshot.failure_count += 1;
                if snapshot.failure_count >= self.config.failure_threshold {
                    warn!(
                        resource = %self.key,
                        failures = snapshot.failure_count,
                        "Circuit opened"
                    );
                    self.open(snapshot).await
                } else {
                    snapshot.updated_at = Utc::now();
                    self.store.save(&self.key, &snapshot).await
                }
            }
            CircuitState::HalfOpen => {
                warn!(resource = %self.key, "Probe failed, circuit re-opened");
                self.open(snapshot).await
            }
            CircuitState::Open => Ok(()),
        }
    }

    /// Operator escape hatch: reject all calls until forced closed or
    /// the open timeout runs its course.
    pub async fn force_open(&self, reason: &str) -> Result<(), BreakerError> {
        warn!(resource = %self.key, reason, "Circuit forced open");
        let snapshot = self.load_or_init().await?;
        self.open(snapshot).await
    }

    /// Operator escape hatch: resume normal operation immediately.
    pub async fn force_close(&self, reason: &str) -> Result<(), BreakerError> {
        info!(resource = %self.key, reason, "Circuit forced closed");
        self.store.save(&self.key, &BreakerSnapshot::closed()).await
    }

    pub async fn snapshot(&self) -> Result<BreakerSnapshot, BreakerError> {
        self.load_or_init().await
    }

    pub async fn state(&self) -> Result<CircuitState, BreakerError> {
        Ok(self.load_or_init().await?.state)
    }

    async fn open(&self, mut snapshot: BreakerSnapshot) -> Result<(), BreakerError> {
        snapshot.state = CircuitState::Open;
        snapshot.success_count = 0;
        snapshot.opened_at = Some(Utc::now());
        snapshot.half_opened_at = None;
        snapshot.updated_at = Utc::now();
        self.store.save(&self.key, &snapshot).await
    }

    async fn load_or_init(&self) -> Result<BreakerSnapshot, BreakerError> {
        match self.store.load(&self.key).await? {
            Some(snapshot) => Ok(snapshot),
            None => {
                let snapshot = BreakerSnapshot::closed();
                self.store.save(&self.key, &snapshot).await?;
                Ok(snapshot)
            }
        }
    }
}

fn elapsed_since(at: Option<DateTime<Utc>>) -> Duration {
    at.and_then(|at| Utc::now().signed_duration_since(at).to_std().ok())
        .unwrap_or(Duration::ZERO)
}

/// One breaker per back-end, sharing a store
pub struct BreakerRegistry {
    breakers: HashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(
        store: Arc<dyn BreakerStore>,
        config: CircuitBreakerConfig,
        resources: &[&str],
    ) -> Self {
        let breakers = resources
            .iter()
            .map(|resource| {
                (
                    resource.to_string(),
                    Arc::new(CircuitBreaker::new(
                        *resource,
                        config.clone(),
                        store.clone(),
                    )),
                )
            })
            .collect();
        Self { breakers }
    }

    pub fn breaker(&self, resource: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(resource).cloned()
    }

    pub async fn snapshots(&self) -> Vec<(String, BreakerSnapshot)> {
        let mut out = Vec::with_capacity(self.breakers.len());
        for (key, breaker) in &self.breakers {
            if let Ok(snapshot) = breaker.snapshot().await {
                out.push((key.clone(), snapshot));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
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

#[cfg(test)]
mod tests {
    use super::*;

    fn test_breaker(open_timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "rabbitmq",
            CircuitBreakerConfig::default()
                .with_failure_threshold(3)
                .with_success_threshold(2)
                .with_open_timeout(open_timeout)
                .with_half_open_timeout(Duration::from_secs(30)),
            Arc::new(InMemoryBreakerStore::new()),
        )
    }

    async fn trip(breaker: &CircuitBreaker) {
        for _ in 0..3 {
            breaker.record_failure().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_starts_closed_and_available() {
        let breaker = test_breaker(Duration::from_secs(60));
        assert!(breaker.is_available().await.unwrap());
        assert_eq!(breaker.state().await.unwrap(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_opens_after_consecutive_failures() {
        let breaker = test_breaker(Duration::from_secs(60));
        trip(&breaker).await;
        assert_eq!(breaker.state().await.unwrap(), CircuitState::Open);
        assert!(!breaker.is_available().await.unwrap());
    }

    #[tokio::test]
    async fn test_success_resets_failure_streak() {
        let breaker = test_breaker(Duration::from_secs(60));
        breaker.record_failure().await.unwrap();
        breaker.record_failure().await.unwrap();
        breaker.record_success().await.unwrap();
        breaker.record_failure().await.unwrap();
        breaker.record_failure().await.unwrap();
        // only two consecutive failures, still closed
        assert_eq!(breaker.state().await.unwrap(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_open_to_half_open_after_timeout() {
        let breaker = test_breaker(Duration::from_millis(50));
        trip(&breaker).await;
        assert!(!breaker.is_available().await.unwrap());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(breaker.is_available().await.unwrap());
        assert_eq!(breaker.state().await.unwrap(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_half_open_closes_after_successes() {
        let breaker = test_breaker(Duration::from_millis(50));
        trip(&breaker).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(breaker.is_available().await.unwrap());

        breaker.record_success().await.unwrap();
        assert_eq!(breaker.state().await.unwrap(), CircuitState::HalfOpen);
        breaker.record_success().await.unwrap();
        assert_eq!(breaker.state().await.unwrap(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = test_breaker(Duration::from_millis(50));
        trip(&breaker).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(breaker.is_available().await.unwrap());

        breaker.record_failure().await.unwrap();
        assert_eq!(breaker.state().await.unwrap(), CircuitState::Open);
        assert!(!breaker.is_available().await.unwrap());
    }

    #[tokio::test]
    async fn test_force_open_and_close() {
        let breaker = test_breaker(Duration::from_secs(60));
        breaker.force_open("maintenance").await.unwrap();
        assert!(!breaker.is_available().await.unwrap());

        breaker.force_close("maintenance done").await.unwrap();
        assert!(breaker.is_available().await.unwrap());
        assert_eq!(breaker.state().await.unwrap(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_registry_snapshots() {
        let store = Arc::new(InMemoryBreakerStore::new());
        let registry = BreakerRegistry::new(
            store,
            CircuitBreakerConfig::for_queue(),
            &["rabbitmq", "redis"],
        );

        let rabbit = registry.breaker("rabbitmq").unwrap();
        rabbit.record_failure().await.unwrap();

        let snapshots = registry.snapshots().await;
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].0, "rabbitmq");
        assert_eq!(snapshots[0].1.failure_count, 1);
        assert!(registry.breaker("kafka").is_none());
    }
}
