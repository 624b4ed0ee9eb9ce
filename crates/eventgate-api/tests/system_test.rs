//! Health and diagnostics endpoint tests

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tower::ServiceExt;

use eventgate_api::system::{self, AppState};
use eventgate_core::{Event, QueueKind};
use eventgate_observability::MetricsSink;
use eventgate_queue::{EventPublisher, QueueError};
use eventgate_reliability::{BreakerRegistry, CircuitBreakerConfig, InMemoryBreakerStore};
use eventgate_storage::{EventStore, InMemoryEventStore};

struct StubPublisher {
    kind: QueueKind,
    down: AtomicBool,
}

#[async_trait]
impl EventPublisher for StubPublisher {
    fn kind(&self) -> QueueKind {
        self.kind
    }

    async fn publish(&self, event: &Event) -> Result<String, QueueError> {
        Ok(event.id.to_string())
    }

    async fn health(&self) -> bool {
        !self.down.load(Ordering::SeqCst)
    }
}

fn harness() -> (Router, Arc<StubPublisher>, Arc<BreakerRegistry>, Arc<MetricsSink>) {
    let broker = Arc::new(StubPublisher {
        kind: QueueKind::Broker,
        down: AtomicBool::new(false),
    });
    let stream = Arc::new(StubPublisher {
        kind: QueueKind::Stream,
        down: AtomicBool::new(false),
    });
    let breakers = Arc::new(BreakerRegistry::new(
        Arc::new(InMemoryBreakerStore::new()),
        CircuitBreakerConfig::for_queue(),
        &["rabbitmq", "redis"],
    ));
    let metrics = Arc::new(MetricsSink::new("eventgate"));

    let state = AppState {
        store: Arc::new(InMemoryEventStore::new()) as Arc<dyn EventStore>,
        broker: broker.clone() as Arc<dyn EventPublisher>,
        stream: stream as Arc<dyn EventPublisher>,
        broker_adapter: None,
        stream_adapter: None,
        dlq: None,
        breakers: breakers.clone(),
        metrics: metrics.clone(),
        started_at: Instant::now(),
    };
    (system::routes(state), broker, breakers, metrics)
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Value, Option<String>) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let content_type = response
        .headers()
        .get("content-type")
        .map(|v| v.to_str().unwrap().to_string());
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value, content_type)
}

#[tokio::test]
async fn test_health_reports_ok_then_degraded() {
    let (app, broker, _, _) = harness();

    let (status, body, _) = get(&app, "/api/v1/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    broker.down.store(true, Ordering::SeqCst);
    let (status, body, _) = get(&app, "/api/v1/health").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["checks"]["broker"], false);
    assert_eq!(body["checks"]["stream"], true);
    assert_eq!(body["checks"]["event_store"], true);
}

#[tokio::test]
async fn test_metrics_exposition_content_type() {
    let (app, _, _, metrics) = harness();
    metrics.increment("events_routed_total", &[("priority", "high"), ("event_type", "purchase")], 1);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/plain; version=0.0.4"
    );
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("eventgate_events_routed_total"));
}

#[tokio::test]
async fn test_circuit_breaker_snapshots() {
    let (app, _, breakers, _) = harness();
    breakers
        .breaker("rabbitmq")
        .unwrap()
        .force_open("maintenance")
        .await
        .unwrap();

    let (status, body, _) = get(&app, "/api/v1/system/circuit-breakers").await;
    assert_eq!(status, StatusCode::OK);
    let list = body.as_array().unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0]["resource"], "rabbitmq");
    assert_eq!(list[0]["state"], "open");
    assert_eq!(list[1]["resource"], "redis");
    assert_eq!(list[1]["state"], "closed");
}

#[tokio::test]
async fn test_queue_stats_without_adapters() {
    let (app, _, _, _) = harness();
    let (status, body, _) = get(&app, "/api/v1/system/queue-stats").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["broker_queues"].as_array().unwrap().is_empty());
    assert!(body["streams"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_system_info() {
    let (app, _, _, _) = harness();
    let (status, body, _) = get(&app, "/api/v1/system/info").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["version"].is_string());
    assert!(body["uptime_s"].is_u64());
}

#[tokio::test]
async fn test_dlq_restore_unavailable_without_manager() {
    let (app, _, _, _) = harness();
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/system/dlq/restore")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}
