//! Priority routing
//!
//! Classifies each event as high or normal priority and names the
//! back-end that should carry it. The router inspects the raw type
//! string so events decoded from a back-end route correctly even when
//! their type is outside the intake set.
//!
//! Revenue-bearing types (purchase, subscription, payment) take the
//! high path through their derived priority of 9; an explicit lower
//! priority on such an event is honored unless the purchase amount
//! crosses [`HIGH_VALUE_PURCHASE_THRESHOLD`].

use serde::Serialize;
use utoipa::ToSchema;

use crate::event::{Event, HIGH_PRIORITY_THRESHOLD};

/// Event types that take the high-priority path regardless of the
/// priority field. These never appear at the HTTP intake, only in
/// messages decoded from a back-end.
pub const ALWAYS_HIGH_TYPES: &[&str] = &["refund", "credit_card_added"];

/// Purchases at or above this amount take the high-priority path even
/// when explicitly deprioritized.
pub const HIGH_VALUE_PURCHASE_THRESHOLD: f64 = 100.0;

/// The two message substrates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    /// Durable priority broker (AMQP)
    Broker,
    /// Log-structured stream with consumer groups (redis streams)
    Stream,
}

impl std::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Broker => write!(f, "rabbitmq"),
            Self::Stream => write!(f, "redis"),
        }
    }
}

impl QueueKind {
    /// The other back-end, used for failover at intake.
    pub fn opposite(self) -> Self {
        match self {
            Self::Broker => Self::Stream,
            Self::Stream => Self::Broker,
        }
    }
}

/// Outcome of routing one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteDecision {
    pub target: QueueKind,
    /// "high" or "normal", for metric labels
    pub priority_class: &'static str,
}

/// Classifies events onto the two back-ends.
///
/// High-priority events land on the broker; everything else goes to
/// the stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct PriorityRouter;

impl PriorityRouter {
    pub fn new() -> Self {
        Self
    }

    pub fn route(&self, event: &Event) -> RouteDecision {
        if self.is_high_priority(event) {
            RouteDecision {
                target: QueueKind::Broker,
                priority_class: "high",
            }
        } else {
            RouteDecision {
                target: QueueKind::Stream,
                priority_class: "normal",
            }
        }
    }

    fn is_high_priority(&self, event: &Event) -> bool {
        if event.priority >= HIGH_PRIORITY_THRESHOLD {
            return true;
        }
        if ALWAYS_HIGH_TYPES.contains(&event.event_type.as_str()) {
            return true;
        }
        if event.event_type == "purchase" {
            if let Some(amount) = event.payload.get("amount").and_then(|v| v.as_f64()) {
                if amount >= HIGH_VALUE_PURCHASE_THRESHOLD {
                    return true;
                }
            }
        }
        false
    }
}
