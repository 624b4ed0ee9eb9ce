//! Handler registry
//!
//! Business handlers are registered per event type at process start;
//! the registry is immutable afterwards. Dispatch is best-effort
//! fan-out: every handler runs, failures are collected, and an unknown
//! event type simply dispatches to nothing.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::event::Event;

/// Error returned by a business handler
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A failure recorded during fan-out, attributed to one handler
#[derive(Debug, Clone)]
pub struct HandlerFailure {
    pub handler: String,
    pub error: String,
}

/// A business handler for one or more event types
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Stable name, used for failure attribution and metrics.
    fn name(&self) -> &str;

    async fn handle(&self, event: &Event) -> Result<(), HandlerError>;
}

/// Per-type ordered handler lists, populated at startup
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Vec<Arc<dyn EventHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) {
        self.handlers
            .entry(event_type.into())
            .or_default()
            .push(handler);
    }

    pub fn handlers_for(&self, event_type: &str) -> &[Arc<dyn EventHandler>] {
        self.handlers
            .get(event_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn registered_types(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    /// Run every handler registered for the event's type.
    ///
    /// Handler failures never abort the fan-out; they are logged and
    /// returned for bookkeeping.
    pub async fn dispatch_all(&self, event: &Event) -> Vec<HandlerFailure> {
        let mut failures = Vec::new();
        for handler in self.handlers_for(&event.event_type) {
            if let Err(e) = handler.handle(event).await {
                warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    handler = handler.name(),
                    error = %e,
                    "Handler failed"
                );
                failures.push(HandlerFailure {
                    handler: handler.name().to_string(),
                    error: e.to_string(),
                });
            }
        }
        failures
    }
}
