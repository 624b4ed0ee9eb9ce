// Queue back-ends for eventgate
//
// Two substrates carry events between intake and the drain workers:
// - broker: AMQP with per-message priority, DLX and per-message TTL
// - stream: redis streams with one shared consumer group
//
// The dead-letter manager cascades failures through broker DLX ->
// KV backup list -> local file, and owns its own broker channel so DLQ
// writes survive consumer-channel cancellation.

pub mod broker;
pub mod config;
pub mod dlq;
pub mod kv;
pub mod stream;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use eventgate_core::{Event, QueueKind};

pub use broker::{BrokerAdapter, BrokerConsumer};
pub use config::{BrokerConfig, StreamConfig};
pub use dlq::{DeadLetterManager, DlqStats};
pub use kv::RedisKv;
pub use stream::{StreamAdapter, StreamConsumer};

/// Error type for queue operations
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("broker error: {0}")]
    Broker(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("publish to {backend} failed: {reason}")]
    Publish { backend: QueueKind, reason: String },

    #[error("message decode error: {0}")]
    Decode(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<lapin::Error> for QueueError {
    fn from(e: lapin::Error) -> Self {
        Self::Broker(e.to_string())
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(e: redis::RedisError) -> Self {
        Self::Stream(e.to_string())
    }
}

/// Per-delivery callback invoked by the consumers. The error string is
/// recorded as `last_error` on retries and DLQ entries.
pub type DeliveryHandler =
    Arc<dyn Fn(Event) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// A back-end the intake façade can push to
#[async_trait]
pub trait EventPublisher: Send + Sync {
    fn kind(&self) -> QueueKind;

    /// Publish one event; returns the back-end message id.
    async fn publish(&self, event: &Event) -> Result<String, QueueError>;

    async fn health(&self) -> bool;
}

/// Consumer identity, stable per process so cancellation and pending
/// attribution are deterministic.
pub fn consumer_id(prefix: &str) -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("{prefix}_{host}_{}", std::process::id())
}
