//! AMQP broker adapter
//!
//! Durable priority queue back-end. Topology is declared idempotently
//! at startup:
//!
//! - exchange `events` (direct) with queues `events.high_priority`
//!   (x-max-priority 10) and `events.normal`
//! - DLX `events.dlx` routing `events.dead` into `events.dead_letter`
//! - retry exchange `events.retry` whose queue dead-letters expired
//!   messages back onto the originating queue via the default exchange

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tracing::{debug, error, info, instrument, warn};

use eventgate_core::{Event, EventSource, QueueKind, HIGH_PRIORITY_THRESHOLD};
use eventgate_observability::MetricsSink;
use eventgate_reliability::RetryTracker;

use crate::config::BrokerConfig;
use crate::dlq::DeadLetterManager;
use crate::{consumer_id, DeliveryHandler, EventPublisher, QueueError};

pub const EVENTS_EXCHANGE: &str = "events";
pub const DLX_EXCHANGE: &str = "events.dlx";
pub const RETRY_EXCHANGE: &str = "events.retry";

pub const HIGH_PRIORITY_QUEUE: &str = "events.high_priority";
pub const NORMAL_QUEUE: &str = "events.normal";
pub const DEAD_LETTER_QUEUE: &str = "events.dead_letter";
pub const RETRY_QUEUE: &str = "events.retry";

pub const DEAD_ROUTING_KEY: &str = "events.dead";
pub const HIGH_ROUTING_KEY: &str = "high";
pub const NORMAL_ROUTING_KEY: &str = "normal";

const HIGH_PRIORITY_TTL_MS: i64 = 86_400_000;
const NORMAL_TTL_MS: i64 = 604_800_000;

/// Broker adapter: one connection, one publish channel
pub struct BrokerAdapter {
    config: BrokerConfig,
    connection: Connection,
    channel: Channel,
}

impl BrokerAdapter {
    /// Connect and declare the full topology.
    pub async fn connect(config: BrokerConfig) -> Result<Self, QueueError> {
        let connection = Connection::connect(
            &config.amqp_uri(),
            ConnectionProperties::default().with_connection_name("eventgate".into()),
        )
        .await?;
        let channel = connection.create_channel().await?;
        channel.confirm_select(Default::default()).await?;

        let adapter = Self {
            config,
            connection,
            channel,
        };
        adapter.declare_topology().await?;
        Ok(adapter)
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    async fn declare_topology(&self) -> Result<(), QueueError> {
        let durable = ExchangeDeclareOptions {
            durable: true,
            ..Default::default()
        };
        for exchange in [EVENTS_EXCHANGE, DLX_EXCHANGE, RETRY_EXCHANGE] {
            self.channel
                .exchange_declare(
                    exchange,
                    ExchangeKind::Direct,
                    durable,
                    FieldTable::default(),
                )
                .await?;
        }

        let durable_queue = QueueDeclareOptions {
            durable: true,
            ..Default::default()
        };

        let mut high_args = FieldTable::default();
        high_args.insert("x-max-priority".into(), AMQPValue::LongInt(10));
        high_args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(DLX_EXCHANGE.into()),
        );
        high_args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(DEAD_ROUTING_KEY.into()),
        );
        high_args.insert("x-message-ttl".into(), AMQPValue::LongInt(HIGH_PRIORITY_TTL_MS as i32));
        high_args.insert("x-queue-mode".into(), AMQPValue::LongString("lazy".into()));
        self.channel
            .queue_declare(HIGH_PRIORITY_QUEUE, durable_queue, high_args)
            .await?;

        let mut normal_args = FieldTable::default();
        normal_args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(DLX_EXCHANGE.into()),
        );
        normal_args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(DEAD_ROUTING_KEY.into()),
        );
        normal_args.insert("x-message-ttl".into(), AMQPValue::LongInt(NORMAL_TTL_MS as i32));
        self.channel
            .queue_declare(NORMAL_QUEUE, durable_queue, normal_args)
            .await?;

        let mut dead_args = FieldTable::default();
        dead_args.insert("x-queue-mode".into(), AMQPValue::LongString("lazy".into()));
        self.channel
            .queue_declare(DEAD_LETTER_QUEUE, durable_queue, dead_args)
            .await?;

        // Expired retry messages fall through the default exchange and
        // land back on the queue named by their routing key.
        let mut retry_args = FieldTable::default();
        retry_args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString("".into()),
        );
        self.channel
            .queue_declare(RETRY_QUEUE, durable_queue, retry_args)
            .await?;

        for (queue, exchange, key) in [
            (HIGH_PRIORITY_QUEUE, EVENTS_EXCHANGE, HIGH_ROUTING_KEY),
            (NORMAL_QUEUE, EVENTS_EXCHANGE, NORMAL_ROUTING_KEY),
            (DEAD_LETTER_QUEUE, DLX_EXCHANGE, DEAD_ROUTING_KEY),
            (RETRY_QUEUE, RETRY_EXCHANGE, HIGH_PRIORITY_QUEUE),
            (RETRY_QUEUE, RETRY_EXCHANGE, NORMAL_QUEUE),
        ] {
            self.channel
                .queue_bind(
                    queue,
                    exchange,
                    key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }

        info!("Broker topology declared");
        Ok(())
    }

    /// Messages for the work queues, message id = event id.
    #[instrument(skip(self, event), fields(event_id = %event.id))]
    pub async fn publish_event(&self, event: &Event) -> Result<String, QueueError> {
        let routing_key = routing_key_for(event.priority);
        let payload =
            serde_json::to_vec(event).map_err(|e| QueueError::Decode(e.to_string()))?;

        let mut headers = FieldTable::default();
        headers.insert(
            "x-event-type".into(),
            AMQPValue::LongString(event.event_type.clone().into()),
        );
        headers.insert("x-priority".into(), AMQPValue::LongInt(event.priority as i32));
        headers.insert(
            "x-user-id".into(),
            AMQPValue::LongString(event.user_id.to_string().into()),
        );

        let confirm = self
            .channel
            .basic_publish(
                EVENTS_EXCHANGE,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default()
                    .with_delivery_mode(2)
                    .with_priority(event.priority)
                    .with_message_id(ShortString::from(event.id.to_string()))
                    .with_headers(headers),
            )
            .await
            .map_err(|e| QueueError::Publish {
                backend: QueueKind::Broker,
                reason: e.to_string(),
            })?;
        confirm.await.map_err(|e| QueueError::Publish {
            backend: QueueKind::Broker,
            reason: e.to_string(),
        })?;

        debug!(routing_key, "Published to broker");
        Ok(event.id.to_string())
    }

    /// Start a consumer on one of the work queues.
    pub async fn consumer(
        &self,
        queue: &str,
        handler: DeliveryHandler,
        retries: Arc<RetryTracker>,
        dlq: Arc<DeadLetterManager>,
        metrics: Arc<MetricsSink>,
    ) -> Result<BrokerConsumer, QueueError> {
        let channel = self.connection.create_channel().await?;
        channel
            .basic_qos(self.config.prefetch, BasicQosOptions::default())
            .await?;

        let tag = consumer_id("event_consumer");
        let consumer = channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        info!(queue, tag, "Broker consumer started");

        Ok(BrokerConsumer {
            channel,
            consumer,
            tag,
            queue: queue.to_string(),
            handler,
            retries,
            dlq,
            metrics,
        })
    }

    /// Message counts per queue, via passive declare.
    pub async fn queue_depths(&self) -> Result<Vec<(String, u32)>, QueueError> {
        let passive = QueueDeclareOptions {
            passive: true,
            ..Default::default()
        };
        let mut depths = Vec::new();
        for queue in [
            HIGH_PRIORITY_QUEUE,
            NORMAL_QUEUE,
            DEAD_LETTER_QUEUE,
            RETRY_QUEUE,
        ] {
            let declared = self
                .channel
                .queue_declare(queue, passive, FieldTable::default())
                .await?;
            depths.push((queue.to_string(), declared.message_count()));
        }
        Ok(depths)
    }

    pub async fn close(&self) -> Result<(), QueueError> {
        self.connection.close(200, "shutdown").await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl EventPublisher for BrokerAdapter {
    fn kind(&self) -> QueueKind {
        QueueKind::Broker
    }

    async fn publish(&self, event: &Event) -> Result<String, QueueError> {
        self.publish_event(event).await
    }

    async fn health(&self) -> bool {
        self.connection.status().connected()
    }
}

pub fn routing_key_for(priority: u8) -> &'static str {
    if priority >= HIGH_PRIORITY_THRESHOLD {
        HIGH_ROUTING_KEY
    } else {
        NORMAL_ROUTING_KEY
    }
}

/// One consuming channel on one queue
pub struct BrokerConsumer {
    channel: Channel,
    consumer: lapin::Consumer,
    tag: String,
    queue: String,
    handler: DeliveryHandler,
    retries: Arc<RetryTracker>,
    dlq: Arc<DeadLetterManager>,
    metrics: Arc<MetricsSink>,
}

impl BrokerConsumer {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Drain up to `batch_size` deliveries, blocking up to `block` for
    /// the first one. Every delivery taken here terminates in an ACK:
    /// processed, re-queued for retry, or dead-lettered.
    pub async fn drain_batch(
        &mut self,
        batch_size: usize,
        block: Duration,
    ) -> Result<usize, QueueError> {
        let mut drained = 0;
        for i in 0..batch_size {
            let wait = if i == 0 { block } else { Duration::from_millis(50) };
            let delivery = match tokio::time::timeout(wait, self.consumer.next()).await {
                Err(_) => break,
                Ok(None) => break,
                Ok(Some(Err(e))) => return Err(QueueError::Broker(e.to_string())),
                Ok(Some(Ok(delivery))) => delivery,
            };
            self.handle_delivery(delivery).await?;
            drained += 1;
        }
        Ok(drained)
    }

    async fn handle_delivery(&self, delivery: Delivery) -> Result<(), QueueError> {
        let mut event = match decode_event(&delivery.data) {
            Ok(event) => event,
            Err(e) => {
                warn!(queue = %self.queue, error = %e, "Undecodable delivery, dead-lettering");
                self.dlq
                    .send_to_dlq(&self.queue, &delivery.data, "Invalid JSON", 0)
                    .await;
                self.metrics.increment(
                    "queue_messages_total",
                    &[("queue", self.queue.as_str()), ("outcome", "decode_error")],
                    1,
                );
                delivery.ack(BasicAckOptions::default()).await?;
                return Ok(());
            }
        };
        event.source = EventSource::Broker;
        event.queue_info = message_id(&delivery);

        let retry_count = header_retry_count(&delivery);
        let event_id = event.id.to_string();

        if retry_count > 0 && !self.should_retry(&event_id).await {
            self.dlq
                .send_to_dlq(
                    &self.queue,
                    &delivery.data,
                    "Retry budget exhausted",
                    retry_count,
                )
                .await;
            self.metrics.increment(
                "queue_messages_total",
                &[("queue", self.queue.as_str()), ("outcome", "dead_lettered")],
                1,
            );
            delivery.ack(BasicAckOptions::default()).await?;
            return Ok(());
        }

        match (self.handler)(event).await {
            Ok(()) => {
                if retry_count > 0 {
                    if let Err(e) = self.retries.clear(&event_id).await {
                        warn!(event_id, error = %e, "Failed to clear retry counter");
                    }
                }
                self.metrics.increment(
                    "queue_messages_total",
                    &[("queue", self.queue.as_str()), ("outcome", "processed")],
                    1,
                );
            }
            Err(reason) => {
                self.fail_delivery(&delivery, &event_id, &reason).await;
            }
        }
        delivery.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn fail_delivery(&self, delivery: &Delivery, event_id: &str, reason: &str) {
        if self.should_retry(event_id).await {
            let attempt = self
                .retries
                .record_attempt(event_id)
                .await
                .unwrap_or(u32::MAX);
            debug!(event_id, attempt, reason, "Scheduling delayed retry");
            self.dlq
                .send_to_retry_queue(&self.queue, &delivery.data, attempt)
                .await;
            self.metrics.increment(
                "queue_messages_total",
                &[("queue", self.queue.as_str()), ("outcome", "retried")],
                1,
            );
        } else {
            warn!(event_id, reason, "Retries exhausted, dead-lettering");
            let attempts = self.retries.attempts(event_id).await.unwrap_or(0);
            self.dlq
                .send_to_dlq(&self.queue, &delivery.data, reason, attempts)
                .await;
            self.metrics.increment(
                "queue_messages_total",
                &[("queue", self.queue.as_str()), ("outcome", "dead_lettered")],
                1,
            );
        }
    }

    async fn should_retry(&self, event_id: &str) -> bool {
        match self.retries.should_retry(event_id).await {
            Ok(decision) => decision,
            Err(e) => {
                // counter unreachable: retrying is the safe default
                error!(event_id, error = %e, "Retry counter unavailable");
                true
            }
        }
    }

    /// Cancel the consumer and close the channel; in-flight callbacks
    /// have completed by the time drain_batch returns.
    pub async fn shutdown(self) -> Result<(), QueueError> {
        self.channel
            .basic_cancel(&self.tag, BasicCancelOptions::default())
            .await?;
        self.channel.close(200, "shutdown").await?;
        Ok(())
    }
}

fn decode_event(body: &[u8]) -> Result<Event, serde_json::Error> {
    serde_json::from_slice(body)
}

fn message_id(delivery: &Delivery) -> Option<String> {
    delivery
        .properties
        .message_id()
        .as_ref()
        .map(|id| id.to_string())
}

fn header_retry_count(delivery: &Delivery) -> u32 {
    delivery
        .properties
        .headers()
        .as_ref()
        .and_then(|table| {
            table
                .inner()
                .iter()
                .find(|(name, _)| name.as_str() == "x-retry-count")
                .map(|(_, value)| match value {
                    AMQPValue::LongInt(n) => *n as u32,
                    AMQPValue::ShortInt(n) => *n as u32,
                    AMQPValue::LongLongInt(n) => *n as u32,
                    AMQPValue::LongString(s) => s.to_string().parse().unwrap_or(0),
                    _ => 0,
                })
        })
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use eventgate_core::NewEvent;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn test_routing_key_boundary() {
        assert_eq!(routing_key_for(8), "high");
        assert_eq!(routing_key_for(10), "high");
        assert_eq!(routing_key_for(7), "normal");
        assert_eq!(routing_key_for(0), "normal");
    }

    #[test]
    fn test_decode_event_round_trip() {
        let event = Event::from_intake(NewEvent {
            user_id: Uuid::new_v4(),
            event_type: "payment".to_string(),
            timestamp: Utc::now(),
            payload: json!({"amount": 12.5, "currency": "EUR"}),
            metadata: None,
            priority: None,
            idempotency_key: None,
        });
        let body = serde_json::to_vec(&event).unwrap();
        let decoded = decode_event(&body).unwrap();
        assert_eq!(decoded.id, event.id);
        assert_eq!(decoded.priority, 9);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_event(b"{not json").is_err());
        assert!(decode_event(b"[1,2,3]").is_err());
    }
}
