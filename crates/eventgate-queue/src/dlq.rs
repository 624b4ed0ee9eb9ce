//! Dead-letter manager
//!
//! Failures cascade through three sinks: the broker DLX, a capped KV
//! backup list, and finally a local append-only file. The manager owns
//! its own broker channel so dead-letter writes stay available while a
//! consumer channel is being cancelled.
//!
//! The retry queue doubles as the delay mechanism: messages published
//! there carry a per-message TTL equal to the backoff delay, and the
//! queue dead-letters expired messages back onto the originating work
//! queue.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use lapin::options::BasicPublishOptions;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

use eventgate_core::kv::{KvStore, DLQ_BACKUP_KEY};
use eventgate_reliability::RetryPolicy;

use crate::broker::{DEAD_ROUTING_KEY, DLX_EXCHANGE, RETRY_EXCHANGE};
use crate::config::BrokerConfig;
use crate::QueueError;

/// Cap on the KV backup list.
pub const BACKUP_MAX_LEN: usize = 10_000;

/// Messages republished per restore call.
pub const RESTORE_BATCH: usize = 100;

/// Default file sink for the last cascade tier.
pub const BACKUP_FILE: &str = "dlq_backup.log";

/// A dead letter as stored in the KV backup / file tiers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub original_queue: String,
    pub error: String,
    pub retry_count: u32,
    pub failed_at: String,
    /// Original message body, lossily decoded
    pub body: String,
}

impl DeadLetter {
    fn new(original_queue: &str, body: &[u8], error: &str, retry_count: u32) -> Self {
        Self {
            original_queue: original_queue.to_string(),
            error: error.to_string(),
            retry_count,
            failed_at: Utc::now().to_rfc3339(),
            body: String::from_utf8_lossy(body).into_owned(),
        }
    }
}

/// Depth of each dead-letter tier
#[derive(Debug, Clone, Serialize)]
pub struct DlqStats {
    pub dead_letter_queue: u32,
    pub retry_queue: u32,
    pub kv_backup: i64,
}

/// Dead-letter manager with its own broker connection
pub struct DeadLetterManager {
    connection: Connection,
    channel: Channel,
    kv: Arc<dyn KvStore>,
    policy: RetryPolicy,
    backup_file: PathBuf,
}

impl DeadLetterManager {
    pub async fn connect(
        config: &BrokerConfig,
        kv: Arc<dyn KvStore>,
        policy: RetryPolicy,
    ) -> Result<Self, QueueError> {
        let connection = Connection::connect(
            &config.amqp_uri(),
            ConnectionProperties::default().with_connection_name("eventgate-dlq".into()),
        )
        .await?;
        let channel = connection.create_channel().await?;
        channel.confirm_select(Default::default()).await?;

        Ok(Self {
            connection,
            channel,
            kv,
            policy,
            backup_file: PathBuf::from(BACKUP_FILE),
        })
    }

    pub fn with_backup_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.backup_file = path.into();
        self
    }

    /// Dead-letter a message, falling through the cascade on sink
    /// failure. Never returns an error: the file tier is the floor.
    pub async fn send_to_dlq(
        &self,
        original_queue: &str,
        body: &[u8],
        error: &str,
        retry_count: u32,
    ) {
        let mut headers = FieldTable::default();
        headers.insert(
            "x-original-queue".into(),
            AMQPValue::LongString(original_queue.into()),
        );
        headers.insert("x-error".into(), AMQPValue::LongString(error.into()));
        headers.insert("x-retry-count".into(), AMQPValue::LongInt(retry_count as i32));

        let published = self
            .publish(DLX_EXCHANGE, DEAD_ROUTING_KEY, body, {
                BasicProperties::default()
                    .with_delivery_mode(2)
                    .with_headers(headers)
            })
            .await;

        if let Err(e) = published {
            warn!(original_queue, error = %e, "Broker DLQ unreachable, using KV backup");
            let letter = DeadLetter::new(original_queue, body, error, retry_count);
            self.send_to_kv_backup(&letter).await;
        }
    }

    /// Schedule a delayed redelivery: publish to the retry exchange
    /// with TTL = the backoff delay and routing key = the originating
    /// queue, which the retry queue dead-letters back to on expiry.
    pub async fn send_to_retry_queue(&self, original_queue: &str, body: &[u8], retry_count: u32) {
        let delay = self.policy.delay_for_attempt(retry_count);

        let mut headers = FieldTable::default();
        headers.insert("x-retry-count".into(), AMQPValue::LongInt(retry_count as i32));

        let published = self
            .publish(RETRY_EXCHANGE, original_queue, body, {
                BasicProperties::default()
                    .with_delivery_mode(2)
                    .with_expiration(ShortString::from(delay.as_millis().to_string()))
                    .with_headers(headers)
            })
            .await;

        if let Err(e) = published {
            // no delay tier left; treat as dead
            warn!(original_queue, error = %e, "Retry queue unreachable, dead-lettering");
            self.send_to_dlq(original_queue, body, "Retry publish failed", retry_count)
                .await;
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), QueueError> {
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await?
            .await?;
        Ok(())
    }

    async fn send_to_kv_backup(&self, letter: &DeadLetter) {
        let serialized = match serde_json::to_string(letter) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "Dead letter not serializable");
                return;
            }
        };
        match self
            .kv
            .lpush_trim(DLQ_BACKUP_KEY, &serialized, BACKUP_MAX_LEN)
            .await
        {
            Ok(len) => info!(backup_len = len, "Dead letter stored in KV backup"),
            Err(e) => {
                warn!(error = %e, "KV backup unreachable, appending to file");
                self.append_to_file(&serialized).await;
            }
        }
    }

    async fn append_to_file(&self, line: &str) {
        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.backup_file)
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
            file.flush().await
        }
        .await;

        if let Err(e) = result {
            // last tier failed; the error log is all that remains
            error!(path = %self.backup_file.display(), error = %e, "Dead letter lost: file sink failed");
        }
    }

    /// Republish KV-backed-up dead letters to the broker DLQ.
    /// Returns how many were restored.
    pub async fn restore_from_backup(&self) -> Result<usize, QueueError> {
        let entries = self
            .kv
            .rpop_count(DLQ_BACKUP_KEY, RESTORE_BATCH)
            .await
            .map_err(|e| QueueError::Stream(e.to_string()))?;

        let mut restored = 0;
        for serialized in entries {
            let letter: DeadLetter = match serde_json::from_str(&serialized) {
                Ok(letter) => letter,
                Err(e) => {
                    warn!(error = %e, "Skipping undecodable backup entry");
                    continue;
                }
            };

            let mut headers = FieldTable::default();
            headers.insert(
                "x-original-queue".into(),
                AMQPValue::LongString(letter.original_queue.as_str().into()),
            );
            headers.insert(
                "x-error".into(),
                AMQPValue::LongString(letter.error.as_str().into()),
            );
            headers.insert(
                "x-retry-count".into(),
                AMQPValue::LongInt(letter.retry_count as i32),
            );
            headers.insert("x-restored".into(), AMQPValue::Boolean(true));

            self.publish(DLX_EXCHANGE, DEAD_ROUTING_KEY, letter.body.as_bytes(), {
                BasicProperties::default()
                    .with_delivery_mode(2)
                    .with_headers(headers)
            })
            .await?;
            restored += 1;
        }

        if restored > 0 {
            info!(restored, "Restored dead letters from KV backup");
        }
        Ok(restored)
    }

    /// Depths of the broker sinks and the KV backup.
    pub async fn stats(&self) -> Result<DlqStats, QueueError> {
        use lapin::options::QueueDeclareOptions;

        let passive = QueueDeclareOptions {
            passive: true,
            ..Default::default()
        };
        let dead = self
            .channel
            .queue_declare(
                crate::broker::DEAD_LETTER_QUEUE,
                passive,
                FieldTable::default(),
            )
            .await?;
        let retry = self
            .channel
            .queue_declare(crate::broker::RETRY_QUEUE, passive, FieldTable::default())
            .await?;
        let kv_backup = self
            .kv
            .llen(DLQ_BACKUP_KEY)
            .await
            .map_err(|e| QueueError::Stream(e.to_string()))?;

        Ok(DlqStats {
            dead_letter_queue: dead.message_count(),
            retry_queue: retry.message_count(),
            kv_backup,
        })
    }

    pub async fn close(&self) -> Result<(), QueueError> {
        self.connection.close(200, "shutdown").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dead_letter_serialization() {
        let letter = DeadLetter::new("events.normal", br#"{"id":"x"}"#, "handler blew up", 3);
        let json = serde_json::to_string(&letter).unwrap();
        let parsed: DeadLetter = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.original_queue, "events.normal");
        assert_eq!(parsed.retry_count, 3);
        assert_eq!(parsed.body, r#"{"id":"x"}"#);
        assert!(!parsed.failed_at.is_empty());
    }
}
