//! Row models for the event store

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use eventgate_core::{Event, EventStatus};

/// A persisted event row
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct EventRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub priority: i32,
    pub payload: Value,
    pub metadata: Option<Value>,
    pub processed_at: Option<DateTime<Utc>>,
    pub status: String,
    pub idempotency_key: Option<String>,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EventRow {
    pub fn status(&self) -> Option<EventStatus> {
        self.status.parse().ok()
    }

    /// Build the row an insert would produce, for the in-memory store.
    pub(crate) fn from_event(event: &Event, status: EventStatus, last_error: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            id: event.id,
            user_id: event.user_id,
            event_type: event.event_type.clone(),
            timestamp: event.timestamp,
            priority: event.priority as i32,
            payload: event.payload.clone(),
            metadata: event.metadata.clone(),
            processed_at: None,
            status: status.to_string(),
            idempotency_key: event.idempotency_key.clone(),
            retry_count: event.retry_count as i32,
            last_error: last_error.map(str::to_string),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Row count per lifecycle status, for the queue-stats endpoint
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct StatusCount {
    pub status: String,
    pub count: i64,
}
