//! Redis streams adapter
//!
//! Log-structured back-end with one shared consumer group. Entries
//! carry the event snapshot plus an application-level `attempts`
//! counter; a failed entry is re-appended with the counter bumped
//! (fresh entry id; retry identity rides `attempts`, not the id) and
//! promoted to the DLQ stream at [`MAX_STREAM_ATTEMPTS`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimOptions, StreamClaimReply, StreamId, StreamMaxlen, StreamPendingCountReply,
    StreamReadOptions, StreamReadReply,
};
use redis::AsyncCommands;
use tracing::{debug, info, instrument, warn};

use eventgate_core::{Event, EventSource, QueueKind, HIGH_PRIORITY_THRESHOLD};
use eventgate_observability::MetricsSink;

use crate::config::StreamConfig;
use crate::{consumer_id, DeliveryHandler, EventPublisher, QueueError};

pub const NORMAL_STREAM: &str = "events_stream";
pub const HIGH_PRIORITY_STREAM: &str = "events_high_priority";
pub const DLQ_STREAM: &str = "events_dlq_stream";
pub const CONSUMER_GROUP: &str = "event_processors";

/// Failures tolerated per entry before DLQ promotion.
pub const MAX_STREAM_ATTEMPTS: u32 = 3;

/// Stream adapter: publishes and reads as a group member
#[derive(Clone)]
pub struct StreamAdapter {
    config: StreamConfig,
    manager: ConnectionManager,
    consumer: String,
}

impl StreamAdapter {
    pub async fn connect(config: StreamConfig) -> Result<Self, QueueError> {
        let client = redis::Client::open(config.url.as_str())?;
        let manager = client.get_connection_manager().await?;
        let adapter = Self {
            config,
            manager,
            consumer: consumer_id("redis_consumer"),
        };
        adapter.ensure_groups().await?;
        Ok(adapter)
    }

    pub fn from_manager(config: StreamConfig, manager: ConnectionManager) -> Self {
        Self {
            config,
            manager,
            consumer: consumer_id("redis_consumer"),
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer
    }

    /// Create the consumer group on both work streams; an existing
    /// group is fine.
    pub async fn ensure_groups(&self) -> Result<(), QueueError> {
        let mut conn = self.manager.clone();
        for stream in [NORMAL_STREAM, HIGH_PRIORITY_STREAM] {
            let created: redis::RedisResult<String> = conn
                .xgroup_create_mkstream(stream, CONSUMER_GROUP, "0")
                .await;
            match created {
                Ok(_) => info!(stream, group = CONSUMER_GROUP, "Consumer group created"),
                Err(e) if e.to_string().contains("BUSYGROUP") => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Append one event; returns the assigned entry id.
    #[instrument(skip(self, event), fields(event_id = %event.id))]
    pub async fn publish_event(&self, event: &Event) -> Result<String, QueueError> {
        let stream = stream_for(event.priority);
        let payload =
            serde_json::to_string(event).map_err(|e| QueueError::Decode(e.to_string()))?;
        let timestamp = Utc::now().timestamp().to_string();

        let mut conn = self.manager.clone();
        let entry_id: String = conn
            .xadd_maxlen(
                stream,
                StreamMaxlen::Approx(self.config.max_len),
                "*",
                &[
                    ("event", payload.as_str()),
                    ("timestamp", timestamp.as_str()),
                    ("attempts", "0"),
                ],
            )
            .await
            .map_err(|e| QueueError::Publish {
                backend: QueueKind::Stream,
                reason: e.to_string(),
            })?;

        debug!(stream, entry_id, "Appended to stream");
        Ok(entry_id)
    }

    pub async fn stream_depths(&self) -> Result<Vec<(String, i64)>, QueueError> {
        let mut conn = self.manager.clone();
        let mut depths = Vec::new();
        for stream in [NORMAL_STREAM, HIGH_PRIORITY_STREAM, DLQ_STREAM] {
            let len: i64 = conn.xlen(stream).await?;
            depths.push((stream.to_string(), len));
        }
        Ok(depths)
    }

    pub async fn ping(&self) -> bool {
        let mut conn = self.manager.clone();
        let pong: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
        pong.is_ok()
    }

    /// Start a group consumer on one stream.
    pub fn consumer(
        &self,
        stream: &str,
        handler: DeliveryHandler,
        metrics: Arc<MetricsSink>,
    ) -> StreamConsumer {
        StreamConsumer {
            adapter: self.clone(),
            stream: stream.to_string(),
            handler,
            metrics,
        }
    }

    async fn append_dlq_entry(
        &self,
        original_id: &str,
        original_stream: &str,
        body: &str,
        error: &str,
        attempts: u32,
    ) -> Result<(), QueueError> {
        let mut conn = self.manager.clone();
        let failed_at = Utc::now().to_rfc3339();
        let attempts = attempts.to_string();
        let _: String = conn
            .xadd_maxlen(
                DLQ_STREAM,
                StreamMaxlen::Approx(self.config.max_len),
                "*",
                &[
                    ("original_message_id", original_id),
                    ("original_stream", original_stream),
                    ("event", body),
                    ("error", error),
                    ("failed_at", failed_at.as_str()),
                    ("attempts", attempts.as_str()),
                ],
            )
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl EventPublisher for StreamAdapter {
    fn kind(&self) -> QueueKind {
        QueueKind::Stream
    }

    async fn publish(&self, event: &Event) -> Result<String, QueueError> {
        self.publish_event(event).await
    }

    async fn health(&self) -> bool {
        self.ping().await
    }
}

pub fn stream_for(priority: u8) -> &'static str {
    if priority >= HIGH_PRIORITY_THRESHOLD {
        HIGH_PRIORITY_STREAM
    } else {
        NORMAL_STREAM
    }
}

/// What to do with a failed stream entry
#[derive(Debug, PartialEq, Eq)]
pub enum RetryDisposition {
    /// Re-append with the bumped attempt count
    Reappend { attempts: u32 },
    /// Promote to the DLQ stream
    DeadLetter { attempts: u32 },
}

/// Failure policy: the entry's previous attempt count decides between
/// re-append and DLQ.
pub fn disposition_after_failure(previous_attempts: u32) -> RetryDisposition {
    let attempts = previous_attempts + 1;
    if attempts >= MAX_STREAM_ATTEMPTS {
        RetryDisposition::DeadLetter { attempts }
    } else {
        RetryDisposition::Reappend { attempts }
    }
}

/// Group member draining one stream
pub struct StreamConsumer {
    adapter: StreamAdapter,
    stream: String,
    handler: DeliveryHandler,
    metrics: Arc<MetricsSink>,
}

impl StreamConsumer {
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Read and process one batch of new entries. Every entry read
    /// here is ACKed: processed, re-appended for retry, or promoted to
    /// the DLQ stream.
    pub async fn drain_batch(
        &self,
        batch_size: usize,
        block: Duration,
    ) -> Result<usize, QueueError> {
        let opts = StreamReadOptions::default()
            .group(CONSUMER_GROUP, &self.adapter.consumer)
            .count(batch_size.min(self.adapter.config.batch_size))
            .block(block.as_millis() as usize);

        let mut conn = self.adapter.manager.clone();
        let reply: StreamReadReply = conn
            .xread_options(&[self.stream.as_str()], &[">"], &opts)
            .await?;

        let mut drained = 0;
        for key in reply.keys {
            for entry in key.ids {
                self.process_entry(&entry).await?;
                drained += 1;
            }
        }
        Ok(drained)
    }

    /// Claim entries another consumer left pending for at least
    /// `claim_idle`, then run them through the normal processing path.
    /// Entries already delivered [`MAX_STREAM_ATTEMPTS`] times go
    /// straight to the DLQ stream. Recovers deliveries from crashed
    /// consumers.
    pub async fn claim_pending(&self, limit: usize) -> Result<usize, QueueError> {
        let idle = self.adapter.config.claim_idle;
        // bound the whole pass; a stuck claim must not wedge the loop
        let deadline = 2 * idle;
        tokio::time::timeout(deadline, self.claim_pending_inner(limit, idle))
            .await
            .map_err(|_| QueueError::Stream("claim pass timed out".to_string()))?
    }

    async fn claim_pending_inner(&self, limit: usize, idle: Duration) -> Result<usize, QueueError> {
        let mut conn = self.adapter.manager.clone();
        let pending: StreamPendingCountReply = conn
            .xpending_count(self.stream.as_str(), CONSUMER_GROUP, "-", "+", limit)
            .await?;

        let mut stale_ids = Vec::new();
        let mut exhausted = Vec::new();
        for entry in pending.ids {
            if (entry.last_delivered_ms as u64) < idle.as_millis() as u64 {
                continue;
            }
            if entry.times_delivered as u64 >= MAX_STREAM_ATTEMPTS as u64 {
                exhausted.push(entry.id);
            } else {
                stale_ids.push(entry.id);
            }
        }

        let mut recovered = 0;

        if !stale_ids.is_empty() {
            // FORCE also claims entries that were never delivered
            let opts = StreamClaimOptions::default().with_force();
            let claimed: StreamClaimReply = conn
                .xclaim_options(
                    self.stream.as_str(),
                    CONSUMER_GROUP,
                    &self.adapter.consumer,
                    idle.as_millis() as usize,
                    &stale_ids,
                    opts,
                )
                .await?;

            for entry in claimed.ids {
                debug!(stream = %self.stream, entry_id = %entry.id, "Claimed pending entry");
                self.process_entry(&entry).await?;
                recovered += 1;
            }
        }

        for id in exhausted {
            warn!(stream = %self.stream, entry_id = %id, "Entry reclaimed too often, dead-lettering");
            let body = self.read_entry_body(&mut conn, &id).await.unwrap_or_default();
            self.adapter
                .append_dlq_entry(
                    &id,
                    &self.stream,
                    &body,
                    "Exceeded redelivery budget",
                    MAX_STREAM_ATTEMPTS,
                )
                .await?;
            let _: i64 = conn
                .xack(self.stream.as_str(), CONSUMER_GROUP, &[&id])
                .await?;
            self.count("dead_lettered");
        }

        Ok(recovered)
    }

    async fn process_entry(&self, entry: &StreamId) -> Result<(), QueueError> {
        let mut conn = self.adapter.manager.clone();

        let Some(body) = field_string(entry, "event") else {
            warn!(stream = %self.stream, entry_id = %entry.id, "Entry without event field");
            self.adapter
                .append_dlq_entry(&entry.id, &self.stream, "", "Missing event field", 0)
                .await?;
            self.ack(&mut conn, &entry.id).await?;
            self.count("decode_error");
            return Ok(());
        };

        let attempts: u32 = field_string(entry, "attempts")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let mut event: Event = match serde_json::from_str(&body) {
            Ok(event) => event,
            Err(e) => {
                warn!(stream = %self.stream, entry_id = %entry.id, error = %e, "Undecodable entry");
                self.adapter
                    .append_dlq_entry(&entry.id, &self.stream, &body, "Invalid JSON", attempts)
                    .await?;
                self.ack(&mut conn, &entry.id).await?;
                self.count("decode_error");
                return Ok(());
            }
        };
        event.source = EventSource::Stream;
        event.queue_info = Some(entry.id.clone());
        event.retry_count = attempts;

        match (self.handler)(event).await {
            Ok(()) => {
                self.ack(&mut conn, &entry.id).await?;
                self.count("processed");
            }
            Err(reason) => match disposition_after_failure(attempts) {
                RetryDisposition::DeadLetter { attempts } => {
                    self.adapter
                        .append_dlq_entry(&entry.id, &self.stream, &body, &reason, attempts)
                        .await?;
                    self.ack(&mut conn, &entry.id).await?;
                    self.count("dead_lettered");
                }
                RetryDisposition::Reappend { attempts } => {
                    let attempts_str = attempts.to_string();
                    let timestamp = Utc::now().timestamp().to_string();
                    let _: String = conn
                        .xadd_maxlen(
                            self.stream.as_str(),
                            StreamMaxlen::Approx(self.adapter.config.max_len),
                            "*",
                            &[
                                ("event", body.as_str()),
                                ("timestamp", timestamp.as_str()),
                                ("attempts", attempts_str.as_str()),
                                ("last_error", reason.as_str()),
                            ],
                        )
                        .await?;
                    self.ack(&mut conn, &entry.id).await?;
                    self.count("retried");
                }
            },
        }
        Ok(())
    }

    async fn ack(&self, conn: &mut ConnectionManager, entry_id: &str) -> Result<(), QueueError> {
        let _: i64 = conn
            .xack(self.stream.as_str(), CONSUMER_GROUP, &[entry_id])
            .await?;
        Ok(())
    }

    async fn read_entry_body(&self, conn: &mut ConnectionManager, entry_id: &str) -> Option<String> {
        let reply: redis::streams::StreamRangeReply = conn
            .xrange(self.stream.as_str(), entry_id, entry_id)
            .await
            .ok()?;
        reply
            .ids
            .first()
            .and_then(|entry| field_string(entry, "event"))
    }

    fn count(&self, outcome: &str) {
        self.metrics.increment(
            "stream_entries_total",
            &[("stream", self.stream.as_str()), ("outcome", outcome)],
            1,
        );
    }
}

fn field_string(entry: &StreamId, field: &str) -> Option<String> {
    entry
        .map
        .get(field)
        .and_then(|value| redis::from_redis_value(value).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_selection_boundary() {
        assert_eq!(stream_for(8), HIGH_PRIORITY_STREAM);
        assert_eq!(stream_for(10), HIGH_PRIORITY_STREAM);
        assert_eq!(stream_for(7), NORMAL_STREAM);
        assert_eq!(stream_for(1), NORMAL_STREAM);
    }

    #[test]
    fn test_disposition_after_failure() {
        assert_eq!(
            disposition_after_failure(0),
            RetryDisposition::Reappend { attempts: 1 }
        );
        assert_eq!(
            disposition_after_failure(1),
            RetryDisposition::Reappend { attempts: 2 }
        );
        // third failure promotes to the DLQ stream with attempts=3
        assert_eq!(
            disposition_after_failure(2),
            RetryDisposition::DeadLetter { attempts: 3 }
        );
        assert_eq!(
            disposition_after_failure(7),
            RetryDisposition::DeadLetter { attempts: 8 }
        );
    }
}
