//! Ingest façade
//!
//! The synchronous intake path: validate, dedupe, route, push with the
//! breaker gating, and fall back to persisting the event as `failed`
//! when both back-ends refuse it. A valid event is never bounced after
//! acceptance: the response is 202 (accepted), 200 (idempotent
//! replay) or 400 (validation); queueing trouble is absorbed here.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tracing::{error, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use eventgate_core::kv::{KvStore, DAY_TTL, IDEMPOTENCY_PREFIX};
use eventgate_core::validate::validate;
use eventgate_core::{Event, FieldError, NewEvent, PriorityRouter, QueueKind};
use eventgate_observability::MetricsSink;
use eventgate_queue::EventPublisher;
use eventgate_reliability::BreakerRegistry;
use eventgate_storage::EventStore;

/// App state for the ingest routes
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EventStore>,
    pub kv: Arc<dyn KvStore>,
    pub broker: Arc<dyn EventPublisher>,
    pub stream: Arc<dyn EventPublisher>,
    pub breakers: Arc<BreakerRegistry>,
    pub metrics: Arc<MetricsSink>,
    pub router: PriorityRouter,
}

impl AppState {
    fn publisher(&self, kind: QueueKind) -> Arc<dyn EventPublisher> {
        match kind {
            QueueKind::Broker => self.broker.clone(),
            QueueKind::Stream => self.stream.clone(),
        }
    }

    async fn breaker_available(&self, kind: QueueKind) -> bool {
        match self.breakers.breaker(&kind.to_string()) {
            // a broken breaker store must not take the intake down
            Some(breaker) => breaker.is_available().await.unwrap_or(true),
            None => true,
        }
    }

    async fn record_breaker(&self, kind: QueueKind, success: bool) {
        if let Some(breaker) = self.breakers.breaker(&kind.to_string()) {
            let result = if success {
                breaker.record_success().await
            } else {
                breaker.record_failure().await
            };
            if let Err(e) = result {
                warn!(resource = %kind, error = %e, "Breaker update failed");
            }
        }
    }

    async fn store_idempotency(&self, event: &Event) {
        if let Some(key) = &event.idempotency_key {
            let idem_key = format!("{IDEMPOTENCY_PREFIX}{key}");
            if let Err(e) = self
                .kv
                .set_nx_ex(&idem_key, &event.id.to_string(), DAY_TTL)
                .await
            {
                warn!(error = %e, "Failed to store idempotency record");
            }
        }
    }
}

/// Body of the accept / replay responses
#[derive(Debug, Serialize, ToSchema)]
pub struct IngestResponse {
    pub success: bool,
    pub event_id: Uuid,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached: Option<bool>,
}

/// Body of the 400 validation response
#[derive(Debug, Serialize, ToSchema)]
pub struct ValidationResponse {
    pub error: String,
    pub messages: Vec<FieldError>,
}

/// Body of the status response
#[derive(Debug, Serialize, ToSchema)]
pub struct EventStatusResponse {
    pub event_id: Uuid,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_time: Option<u64>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/events", post(ingest_event))
        .route("/api/v1/events/:event_id/status", get(event_status))
        .with_state(state)
}

/// POST /api/v1/events - Accept one event
#[utoipa::path(
    post,
    path = "/api/v1/events",
    request_body = NewEvent,
    responses(
        (status = 202, description = "Event accepted", body = IngestResponse),
        (status = 200, description = "Idempotent replay", body = IngestResponse),
        (status = 400, description = "Validation failure", body = ValidationResponse),
        (status = 500, description = "Internal error")
    ),
    tag = "events"
)]
pub async fn ingest_event(State(state): State<AppState>, Json(new): Json<NewEvent>) -> Response {
    if let Err(errors) = validate(&new) {
        state.metrics.increment("api_validation_errors_total", &[], 1);
        return (
            StatusCode::BAD_REQUEST,
            Json(ValidationResponse {
                error: "validation_failed".to_string(),
                messages: errors.errors,
            }),
        )
            .into_response();
    }

    let event = Event::from_intake(new);

    if let Some(key) = &event.idempotency_key {
        let idem_key = format!("{IDEMPOTENCY_PREFIX}{key}");
        if let Ok(Some(existing)) = state.kv.get(&idem_key).await {
            if let Ok(existing_id) = Uuid::parse_str(&existing) {
                return (
                    StatusCode::OK,
                    Json(IngestResponse {
                        success: true,
                        event_id: existing_id,
                        message: "Event already accepted".to_string(),
                        queue_message_id: None,
                        queue: None,
                        cached: Some(true),
                    }),
                )
                    .into_response();
            }
        }
    }

    let route_started = Instant::now();
    let decision = state.router.route(&event);
    state.metrics.histogram(
        "event_routing_duration_seconds",
        &[],
        route_started.elapsed().as_secs_f64(),
    );
    state.metrics.increment(
        "events_routed_total",
        &[
            ("priority", decision.priority_class),
            ("event_type", event.event_type.as_str()),
        ],
        1,
    );

    let primary = decision.target;
    let target = if state.breaker_available(primary).await {
        primary
    } else {
        let fallback = primary.opposite();
        if state.breaker_available(fallback).await {
            let from = primary.to_string();
            let to = fallback.to_string();
            warn!(from = %from, to = %to, event_id = %event.id, "Breaker open, failing over");
            state.metrics.increment(
                "queue_failover_total",
                &[("from", from.as_str()), ("to", to.as_str())],
                1,
            );
            fallback
        } else {
            // both open: still attempt the primary
            primary
        }
    };

    match state.publisher(target).publish(&event).await {
        Ok(message_id) => {
            state.record_breaker(target, true).await;
            state.store_idempotency(&event).await;
            (
                StatusCode::ACCEPTED,
                Json(IngestResponse {
                    success: true,
                    event_id: event.id,
                    message: "Event accepted".to_string(),
                    queue_message_id: Some(message_id),
                    queue: Some(target.to_string()),
                    cached: None,
                }),
            )
                .into_response()
        }
        Err(push_err) => {
            state.record_breaker(target, false).await;
            error!(event_id = %event.id, error = %push_err, "Queue push failed, persisting as failed");

            match state.store.insert_failed(&event, &push_err.to_string()).await {
                Ok(_) => {
                    state.store_idempotency(&event).await;
                    state
                        .metrics
                        .increment("events_emergency_persisted_total", &[], 1);
                    (
                        StatusCode::ACCEPTED,
                        Json(IngestResponse {
                            success: true,
                            event_id: event.id,
                            message: "Event persisted for deferred delivery".to_string(),
                            queue_message_id: None,
                            queue: None,
                            cached: None,
                        }),
                    )
                        .into_response()
                }
                Err(store_err) => {
                    error!(event_id = %event.id, error = %store_err, "Emergency persist failed");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(serde_json::json!({"error": "internal_error"})),
                    )
                        .into_response()
                }
            }
        }
    }
}

/// GET /api/v1/events/{event_id}/status
#[utoipa::path(
    get,
    path = "/api/v1/events/{event_id}/status",
    params(("event_id" = Uuid, Path, description = "Event ID")),
    responses(
        (status = 200, description = "Event status", body = EventStatusResponse),
        (status = 404, description = "Unknown event"),
        (status = 500, description = "Internal error")
    ),
    tag = "events"
)]
pub async fn event_status(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
) -> Response {
    match state.store.get_event(event_id).await {
        Ok(Some(row)) => {
            let estimated_time = match row.status.as_str() {
                "pending" | "processing" => Some(if row.priority >= 8 { 5 } else { 60 }),
                _ => None,
            };
            (
                StatusCode::OK,
                Json(EventStatusResponse {
                    event_id: row.id,
                    status: row.status,
                    estimated_time,
                }),
            )
                .into_response()
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "not_found"})),
        )
            .into_response(),
        Err(e) => {
            error!(event_id = %event_id, error = %e, "Status lookup failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "internal_error"})),
            )
                .into_response()
        }
    }
}
