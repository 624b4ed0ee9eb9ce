//! Reliability primitives for the queue back-ends
//!
//! - Circuit breakers isolate a failing back-end so the intake path
//!   can fail over instead of blocking on it.
//! - The retry policy computes the exponential-backoff-with-jitter
//!   schedule; the retry tracker counts attempts per event in the
//!   shared KV.

pub mod breaker;
pub mod retry;

pub use breaker::{
    BreakerError, BreakerRegistry, BreakerSnapshot, BreakerStore, CircuitBreaker,
    CircuitBreakerConfig, CircuitState, InMemoryBreakerStore,
};
pub use retry::{RetryPolicy, RetryTracker, MAX_RETRIES};
