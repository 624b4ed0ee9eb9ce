//! Health, metrics exposition and diagnostics

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::error;
use utoipa::ToSchema;

use eventgate_observability::MetricsSink;
use eventgate_queue::{BrokerAdapter, DeadLetterManager, EventPublisher, StreamAdapter};
use eventgate_reliability::BreakerRegistry;
use eventgate_storage::EventStore;

/// App state for health and diagnostics routes
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EventStore>,
    pub broker: Arc<dyn EventPublisher>,
    pub stream: Arc<dyn EventPublisher>,
    /// Concrete adapters for depth statistics; absent in degraded mode
    pub broker_adapter: Option<Arc<BrokerAdapter>>,
    pub stream_adapter: Option<Arc<StreamAdapter>>,
    pub dlq: Option<Arc<DeadLetterManager>>,
    pub breakers: Arc<BreakerRegistry>,
    pub metrics: Arc<MetricsSink>,
    pub started_at: Instant,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthChecks {
    pub event_store: bool,
    pub broker: bool,
    pub stream: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub checks: HealthChecks,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SystemInfoResponse {
    pub version: String,
    pub uptime_s: u64,
    pub backends: HealthChecks,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BreakerStatus {
    pub resource: String,
    pub state: String,
    pub failure_count: u32,
    pub success_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct QueueStatsResponse {
    pub broker_queues: Vec<DepthEntry>,
    pub streams: Vec<DepthEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_letters: Option<eventgate_queue::DlqStats>,
    pub store: Vec<eventgate_storage::StatusCount>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DepthEntry {
    pub name: String,
    pub messages: i64,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/metrics", get(metrics))
        .route("/api/v1/system/info", get(system_info))
        .route("/api/v1/system/queue-stats", get(queue_stats))
        .route("/api/v1/system/circuit-breakers", get(circuit_breakers))
        .route("/api/v1/system/dlq/restore", post(dlq_restore))
        .with_state(state)
}

async fn run_checks(state: &AppState) -> HealthChecks {
    HealthChecks {
        event_store: state.store.ping().await.is_ok(),
        broker: state.broker.health().await,
        stream: state.stream.health().await,
    }
}

/// GET /api/v1/health
#[utoipa::path(
    get,
    path = "/api/v1/health",
    responses(
        (status = 200, description = "All back-ends reachable", body = HealthResponse),
        (status = 503, description = "At least one back-end down", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health(State(state): State<AppState>) -> Response {
    let checks = run_checks(&state).await;
    let healthy = checks.event_store && checks.broker && checks.stream;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            status: if healthy { "ok" } else { "degraded" }.to_string(),
            checks,
        }),
    )
        .into_response()
}

/// GET /api/v1/metrics - Prometheus exposition
#[utoipa::path(
    get,
    path = "/api/v1/metrics",
    responses((status = 200, description = "Metrics in text exposition format")),
    tag = "system"
)]
pub async fn metrics(State(state): State<AppState>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response()
}

/// GET /api/v1/system/info
#[utoipa::path(
    get,
    path = "/api/v1/system/info",
    responses((status = 200, description = "Service info", body = SystemInfoResponse)),
    tag = "system"
)]
pub async fn system_info(State(state): State<AppState>) -> Json<SystemInfoResponse> {
    Json(SystemInfoResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_s: state.started_at.elapsed().as_secs(),
        backends: run_checks(&state).await,
    })
}

/// GET /api/v1/system/queue-stats
#[utoipa::path(
    get,
    path = "/api/v1/system/queue-stats",
    responses((status = 200, description = "Depths per queue, stream and store status")),
    tag = "system"
)]
pub async fn queue_stats(State(state): State<AppState>) -> Response {
    let broker_queues = match &state.broker_adapter {
        Some(adapter) => match adapter.queue_depths().await {
            Ok(depths) => depths
                .into_iter()
                .map(|(name, messages)| DepthEntry {
                    name,
                    messages: messages as i64,
                })
                .collect(),
            Err(e) => {
                error!(error = %e, "Broker depth query failed");
                Vec::new()
            }
        },
        None => Vec::new(),
    };

    let streams = match &state.stream_adapter {
        Some(adapter) => match adapter.stream_depths().await {
            Ok(depths) => depths
                .into_iter()
                .map(|(name, messages)| DepthEntry { name, messages })
                .collect(),
            Err(e) => {
                error!(error = %e, "Stream depth query failed");
                Vec::new()
            }
        },
        None => Vec::new(),
    };

    let dead_letters = match &state.dlq {
        Some(dlq) => dlq.stats().await.ok(),
        None => None,
    };

    let store = match state.store.status_counts().await {
        Ok(counts) => counts,
        Err(e) => {
            error!(error = %e, "Status count query failed");
            Vec::new()
        }
    };

    Json(QueueStatsResponse {
        broker_queues,
        streams,
        dead_letters,
        store,
    })
    .into_response()
}

/// GET /api/v1/system/circuit-breakers
#[utoipa::path(
    get,
    path = "/api/v1/system/circuit-breakers",
    responses((status = 200, description = "Breaker snapshots", body = Vec<BreakerStatus>)),
    tag = "system"
)]
pub async fn circuit_breakers(State(state): State<AppState>) -> Json<Vec<BreakerStatus>> {
    let snapshots = state.breakers.snapshots().await;
    Json(
        snapshots
            .into_iter()
            .map(|(resource, snapshot)| BreakerStatus {
                resource,
                state: snapshot.state.to_string(),
                failure_count: snapshot.failure_count,
                success_count: snapshot.success_count,
                opened_at: snapshot.opened_at,
            })
            .collect(),
    )
}

/// POST /api/v1/system/dlq/restore - Republish KV-backed-up dead letters
#[utoipa::path(
    post,
    path = "/api/v1/system/dlq/restore",
    responses(
        (status = 200, description = "Restore batch republished"),
        (status = 503, description = "Dead-letter manager unavailable")
    ),
    tag = "system"
)]
pub async fn dlq_restore(State(state): State<AppState>) -> Response {
    let Some(dlq) = &state.dlq else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"error": "dlq_unavailable"})),
        )
            .into_response();
    };

    match dlq.restore_from_backup().await {
        Ok(restored) => Json(serde_json::json!({"restored": restored})).into_response(),
        Err(e) => {
            error!(error = %e, "DLQ restore failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "internal_error"})),
            )
                .into_response()
        }
    }
}
