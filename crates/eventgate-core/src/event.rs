//! The event model
//!
//! An [`Event`] is the unit of work: it is born at intake (or decoded
//! from a queue delivery), routed onto one of the two back-ends, and
//! eventually persisted. `event_type` is carried as a string: the
//! intake validator enforces the closed set, but events decoded from a
//! back-end keep whatever type they were published with.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

/// Event types accepted at the HTTP intake.
pub const ALLOWED_EVENT_TYPES: &[&str] = &[
    "click",
    "view",
    "purchase",
    "login",
    "logout",
    "signup",
    "subscription",
    "payment",
    "custom",
];

/// Metadata platforms accepted at the HTTP intake.
pub const ALLOWED_PLATFORMS: &[&str] = &["ios", "android", "web"];

/// Where an event entered the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Api,
    Broker,
    Stream,
}

impl std::fmt::Display for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Api => write!(f, "api"),
            Self::Broker => write!(f, "broker"),
            Self::Stream => write!(f, "stream"),
        }
    }
}

/// Event lifecycle status
///
/// A row transitions `pending -> processing -> processed | failed`;
/// `processed` is terminal unless the event is replayed from a DLQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Processed => write!(f, "processed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "processed" => Ok(Self::Processed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown event status: {other}")),
        }
    }
}

/// Intake request body for `POST /api/v1/events`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewEvent {
    pub user_id: Uuid,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

/// The unit of work
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Event {
    pub id: Uuid,
    pub user_id: Uuid,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub metadata: Option<Value>,
    pub priority: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub source: EventSource,
    /// Message id / stream entry id assigned by the back-end, once known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_info: Option<String>,
    pub status: EventStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
}

impl Event {
    /// Build a pending event from a validated intake request.
    ///
    /// Assigns a time-ordered id and derives the priority from the
    /// event type when the caller did not supply one.
    pub fn from_intake(new: NewEvent) -> Self {
        let priority = new
            .priority
            .unwrap_or_else(|| derived_priority(&new.event_type));
        Self {
            id: Uuid::now_v7(),
            user_id: new.user_id,
            event_type: new.event_type,
            timestamp: new.timestamp,
            payload: new.payload,
            metadata: new.metadata,
            priority,
            idempotency_key: new.idempotency_key,
            source: EventSource::Api,
            queue_info: None,
            status: EventStatus::Pending,
            retry_count: 0,
            last_error: None,
            processed_at: None,
        }
    }

    /// High-priority events go to the broker's priority queue or the
    /// high-priority stream, never the normal path.
    pub fn is_high_priority(&self) -> bool {
        self.priority >= HIGH_PRIORITY_THRESHOLD
    }
}

/// Priority at or above this routes to the high-priority path.
pub const HIGH_PRIORITY_THRESHOLD: u8 = 8;

/// Default priority for an event type when the caller omits one.
pub fn derived_priority(event_type: &str) -> u8 {
    match event_type {
        "purchase" | "subscription" | "payment" => 9,
        "login" | "logout" | "signup" => 5,
        _ => 1,
    }
}
