//! Event processor
//!
//! Consumes decoded events from either back-end and persists them:
//! idempotency check, then one store transaction covering the insert,
//! the handler fan-out and the processed mark, then the idempotency
//! record. Handler failures are recorded per handler and never fail
//! the event (log-and-continue policy).

use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tracing::{debug, instrument, warn};

use eventgate_core::kv::{KvStore, DAY_TTL, IDEMPOTENCY_PREFIX};
use eventgate_core::{Event, HandlerRegistry};
use eventgate_observability::MetricsSink;
use eventgate_queue::DeliveryHandler;
use eventgate_storage::{DispatchFuture, EventStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// How one delivery terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Processed,
    /// Idempotency key or row already seen; delivery is a no-op
    Duplicate,
}

pub struct EventProcessor {
    store: Arc<dyn EventStore>,
    registry: Arc<HandlerRegistry>,
    kv: Arc<dyn KvStore>,
    metrics: Arc<MetricsSink>,
}

impl EventProcessor {
    pub fn new(
        store: Arc<dyn EventStore>,
        registry: Arc<HandlerRegistry>,
        kv: Arc<dyn KvStore>,
        metrics: Arc<MetricsSink>,
    ) -> Self {
        Self {
            store,
            registry,
            kv,
            metrics,
        }
    }

    #[instrument(skip(self, event), fields(event_id = %event.id, event_type = %event.event_type))]
    pub async fn process_event(&self, event: Event) -> Result<ProcessOutcome, ProcessError> {
        let started = Instant::now();

        if let Some(key) = &event.idempotency_key {
            let idem_key = format!("{IDEMPOTENCY_PREFIX}{key}");
            match self.kv.get(&idem_key).await {
                Ok(Some(_)) => {
                    debug!("Duplicate idempotency key, skipping");
                    self.count(&event, "duplicate");
                    return Ok(ProcessOutcome::Duplicate);
                }
                Ok(None) => {}
                Err(e) => {
                    // KV down: fall through to the store, whose unique
                    // index is the authoritative guard
                    warn!(error = %e, "Idempotency KV unavailable");
                }
            }
        }

        let dispatch: DispatchFuture = {
            let registry = self.registry.clone();
            let event = event.clone();
            async move { registry.dispatch_all(&event).await }.boxed()
        };

        let report = match self.store.persist_with_dispatch(&event, dispatch).await {
            Ok(report) => report,
            Err(StoreError::Duplicate(_)) => {
                debug!("Row already persisted, skipping");
                self.count(&event, "duplicate");
                return Ok(ProcessOutcome::Duplicate);
            }
            Err(e) => return Err(e.into()),
        };

        for failure in &report.handler_failures {
            self.metrics.increment(
                "handler_errors_total",
                &[
                    ("event_type", event.event_type.as_str()),
                    ("handler", failure.handler.as_str()),
                ],
                1,
            );
        }

        if let Some(key) = &event.idempotency_key {
            let idem_key = format!("{IDEMPOTENCY_PREFIX}{key}");
            if let Err(e) = self
                .kv
                .set_nx_ex(&idem_key, &event.id.to_string(), DAY_TTL)
                .await
            {
                warn!(error = %e, "Failed to record idempotency key");
            }
        }

        let priority = event.priority.to_string();
        let source = event.source.to_string();
        self.metrics.histogram(
            "event_processing_duration_seconds",
            &[
                ("event_type", event.event_type.as_str()),
                ("priority", priority.as_str()),
                ("source", source.as_str()),
            ],
            started.elapsed().as_secs_f64(),
        );
        self.count(&event, "processed");

        Ok(ProcessOutcome::Processed)
    }

    /// Adapter-facing callback; duplicates count as success.
    pub fn delivery_handler(self: Arc<Self>) -> DeliveryHandler {
        Arc::new(move |event| {
            let processor = self.clone();
            async move {
                processor
                    .process_event(event)
                    .await
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            }
            .boxed()
        })
    }

    fn count(&self, event: &Event, status: &str) {
        let source = event.source.to_string();
        self.metrics.increment(
            "event_processed_total",
            &[
                ("type", event.event_type.as_str()),
                ("status", status),
                ("source", source.as_str()),
            ],
            1,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use eventgate_core::kv::InMemoryKv;
    use eventgate_core::{EventHandler, HandlerError, NewEvent};
    use eventgate_storage::InMemoryEventStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct FlakyHandler {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl EventHandler for FlakyHandler {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn handle(&self, _event: &Event) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(HandlerError::new("downstream 500"))
            } else {
                Ok(())
            }
        }
    }

    fn purchase(idempotency_key: Option<String>) -> Event {
        Event::from_intake(NewEvent {
            user_id: Uuid::new_v4(),
            event_type: "purchase".to_string(),
            timestamp: Utc::now(),
            payload: json!({"amount": 50, "currency": "USD"}),
            metadata: None,
            priority: None,
            idempotency_key,
        })
    }

    fn processor_with(
        store: Arc<InMemoryEventStore>,
        registry: HandlerRegistry,
    ) -> Arc<EventProcessor> {
        Arc::new(EventProcessor::new(
            store,
            Arc::new(registry),
            Arc::new(InMemoryKv::new()),
            Arc::new(MetricsSink::new("eventgate")),
        ))
    }

    #[tokio::test]
    async fn test_round_trip_marks_processed() {
        let store = Arc::new(InMemoryEventStore::new());
        let handler = Arc::new(FlakyHandler {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let mut registry = HandlerRegistry::new();
        registry.register("purchase", handler.clone());

        let processor = processor_with(store.clone(), registry);
        let event = purchase(None);
        let outcome = processor.process_event(event.clone()).await.unwrap();

        assert_eq!(outcome, ProcessOutcome::Processed);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        let row = store.get_event(event.id).await.unwrap().unwrap();
        assert_eq!(row.status, "processed");
        assert_eq!(row.payload, event.payload);
        assert_eq!(row.user_id, event.user_id);
    }

    #[tokio::test]
    async fn test_idempotency_key_short_circuits() {
        let store = Arc::new(InMemoryEventStore::new());
        let processor = processor_with(store.clone(), HandlerRegistry::new());
        let key = "c".repeat(64);

        let first = purchase(Some(key.clone()));
        assert_eq!(
            processor.process_event(first).await.unwrap(),
            ProcessOutcome::Processed
        );

        // same key, different event id: dropped before any store write
        let second = purchase(Some(key));
        assert_eq!(
            processor.process_event(second).await.unwrap(),
            ProcessOutcome::Duplicate
        );
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_duplicate_row_is_not_an_error() {
        let store = Arc::new(InMemoryEventStore::new());
        let processor = processor_with(store.clone(), HandlerRegistry::new());

        let event = purchase(None);
        processor.process_event(event.clone()).await.unwrap();

        // redelivery of the same event id
        let outcome = processor.process_event(event).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Duplicate);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_handler_failure_still_processes() {
        let store = Arc::new(InMemoryEventStore::new());
        let mut registry = HandlerRegistry::new();
        registry.register(
            "purchase",
            Arc::new(FlakyHandler {
                calls: AtomicUsize::new(0),
                fail: true,
            }),
        );

        let processor = processor_with(store.clone(), registry);
        let event = purchase(None);
        let outcome = processor.process_event(event.clone()).await.unwrap();

        assert_eq!(outcome, ProcessOutcome::Processed);
        let row = store.get_event(event.id).await.unwrap().unwrap();
        assert_eq!(row.status, "processed");
        assert!(row.last_error.as_deref().unwrap().contains("downstream 500"));
    }

    #[tokio::test]
    async fn test_delivery_handler_maps_outcomes() {
        let store = Arc::new(InMemoryEventStore::new());
        let processor = processor_with(store, HandlerRegistry::new());
        let handler = processor.delivery_handler();

        assert!(handler(purchase(None)).await.is_ok());
    }
}
