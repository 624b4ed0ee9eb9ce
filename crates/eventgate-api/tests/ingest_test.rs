//! Ingest façade tests against in-memory back-ends
//!
//! The queue back-ends are fakes; the store, KV and breakers are the
//! in-memory implementations, so the full request path runs without
//! external services.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tower::ServiceExt;

use eventgate_api::events::{self, AppState};
use eventgate_core::kv::{InMemoryKv, KvStore};
use eventgate_core::{Event, PriorityRouter, QueueKind};
use eventgate_observability::MetricsSink;
use eventgate_queue::{EventPublisher, QueueError};
use eventgate_reliability::{BreakerRegistry, CircuitBreakerConfig, InMemoryBreakerStore};
use eventgate_storage::{EventStore, InMemoryEventStore};

struct FakePublisher {
    kind: QueueKind,
    fail: AtomicBool,
    published: Mutex<Vec<Event>>,
}

impl FakePublisher {
    fn new(kind: QueueKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            fail: AtomicBool::new(false),
            published: Mutex::new(Vec::new()),
        })
    }

    async fn published_count(&self) -> usize {
        self.published.lock().await.len()
    }
}

#[async_trait]
impl EventPublisher for FakePublisher {
    fn kind(&self) -> QueueKind {
        self.kind
    }

    async fn publish(&self, event: &Event) -> Result<String, QueueError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(QueueError::Publish {
                backend: self.kind,
                reason: "connection refused".to_string(),
            });
        }
        self.published.lock().await.push(event.clone());
        Ok(format!("msg-{}", event.id))
    }

    async fn health(&self) -> bool {
        !self.fail.load(Ordering::SeqCst)
    }
}

struct Harness {
    app: Router,
    store: Arc<InMemoryEventStore>,
    broker: Arc<FakePublisher>,
    stream: Arc<FakePublisher>,
    metrics: Arc<MetricsSink>,
    breakers: Arc<BreakerRegistry>,
}

fn harness() -> Harness {
    let store = Arc::new(InMemoryEventStore::new());
    let broker = FakePublisher::new(QueueKind::Broker);
    let stream = FakePublisher::new(QueueKind::Stream);
    let metrics = Arc::new(MetricsSink::new("eventgate"));
    let breakers = Arc::new(BreakerRegistry::new(
        Arc::new(InMemoryBreakerStore::new()),
        CircuitBreakerConfig::for_queue(),
        &["rabbitmq", "redis"],
    ));

    let state = AppState {
        store: store.clone() as Arc<dyn EventStore>,
        kv: Arc::new(InMemoryKv::new()) as Arc<dyn KvStore>,
        broker: broker.clone() as Arc<dyn EventPublisher>,
        stream: stream.clone() as Arc<dyn EventPublisher>,
        breakers: breakers.clone(),
        metrics: metrics.clone(),
        router: PriorityRouter::new(),
    };

    Harness {
        app: events::routes(state),
        store,
        broker,
        stream,
        metrics,
        breakers,
    }
}

async fn post_event(app: &Router, body: Value) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/events")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn purchase_body(amount: f64) -> Value {
    json!({
        "user_id": "11111111-1111-7111-8111-111111111111",
        "event_type": "purchase",
        "timestamp": "2025-01-01T00:00:00Z",
        "payload": {"amount": amount, "currency": "USD"}
    })
}

#[tokio::test]
async fn test_idempotent_purchase_replay() {
    let h = harness();
    let mut body = purchase_body(50.0);
    body["idempotency_key"] = json!("a".repeat(64));

    let (status, first) = post_event(&h.app, body.clone()).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(first["success"], json!(true));
    let event_id = first["event_id"].as_str().unwrap().to_string();
    assert!(first["queue_message_id"].is_string());

    let (status, second) = post_event(&h.app, body).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["cached"], json!(true));
    assert_eq!(second["event_id"].as_str().unwrap(), event_id);

    // exactly one publish reached a back-end
    assert_eq!(h.broker.published_count().await, 1);
    assert_eq!(h.stream.published_count().await, 0);
}

#[tokio::test]
async fn test_validation_failure_is_400_with_field_messages() {
    let h = harness();
    let body = json!({
        "user_id": "11111111-1111-7111-8111-111111111111",
        "event_type": "purchase",
        "timestamp": "2025-01-01T00:00:00Z",
        "payload": {}
    });

    let (status, response) = post_event(&h.app, body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response["error"], json!("validation_failed"));
    let fields: Vec<&str> = response["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["field"].as_str().unwrap())
        .collect();
    assert!(fields.contains(&"payload.amount"));
    assert!(fields.contains(&"payload.currency"));

    // nothing persisted, nothing published
    assert!(h.store.is_empty().await);
    assert_eq!(h.broker.published_count().await, 0);
    assert_eq!(h.stream.published_count().await, 0);
}

#[tokio::test]
async fn test_routing_boundary() {
    let h = harness();

    // amount 100 with explicit low priority still goes high
    let mut high = purchase_body(100.0);
    high["priority"] = json!(1);
    let (status, body) = post_event(&h.app, high).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["queue"], json!("rabbitmq"));
    assert_eq!(h.broker.published_count().await, 1);

    // amount 99 with explicit low priority rides the stream
    let mut normal = purchase_body(99.0);
    normal["priority"] = json!(1);
    let (status, body) = post_event(&h.app, normal).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["queue"], json!("redis"));
    assert_eq!(h.stream.published_count().await, 1);
}

#[tokio::test]
async fn test_failover_when_broker_breaker_open() {
    let h = harness();
    h.breakers
        .breaker("rabbitmq")
        .unwrap()
        .force_open("test")
        .await
        .unwrap();

    let (status, body) = post_event(&h.app, purchase_body(50.0)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["queue"], json!("redis"));
    assert_eq!(h.broker.published_count().await, 0);
    assert_eq!(h.stream.published_count().await, 1);

    let rendered = h.metrics.render();
    assert!(rendered
        .contains(r#"eventgate_queue_failover_total{from="rabbitmq",to="redis"} 1"#));
}

#[tokio::test]
async fn test_emergency_fallback_persists_failed_row() {
    let h = harness();
    h.broker.fail.store(true, Ordering::SeqCst);
    h.stream.fail.store(true, Ordering::SeqCst);

    // a normal-priority event targets the stream, which refuses it;
    // the event must still be durable
    let (status, body) = post_event(
        &h.app,
        json!({
            "user_id": "11111111-1111-7111-8111-111111111111",
            "event_type": "click",
            "timestamp": "2025-01-01T00:00:00Z",
            "payload": {"button": "buy_now"}
        }),
    )
    .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["success"], json!(true));
    assert!(body["queue_message_id"].is_null());

    let event_id = body["event_id"].as_str().unwrap().parse().unwrap();
    let row = h.store.get_event(event_id).await.unwrap().unwrap();
    assert_eq!(row.status, "failed");
    assert!(row.last_error.as_deref().unwrap().contains("refused"));
}

#[tokio::test]
async fn test_status_endpoint() {
    let h = harness();
    h.stream.fail.store(true, Ordering::SeqCst);
    h.broker.fail.store(true, Ordering::SeqCst);

    let (_, body) = post_event(
        &h.app,
        json!({
            "user_id": "11111111-1111-7111-8111-111111111111",
            "event_type": "view",
            "timestamp": "2025-01-01T00:00:00Z",
            "payload": {}
        }),
    )
    .await;
    let event_id = body["event_id"].as_str().unwrap();

    let response = h
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/events/{event_id}/status"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let status_body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(status_body["status"], json!("failed"));

    let missing = h
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/events/00000000-0000-7000-8000-000000000000/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}
