//! EventStore trait definition

use async_trait::async_trait;
use futures::future::BoxFuture;
use uuid::Uuid;

use eventgate_core::HandlerFailure;
use eventgate_core::Event;

use crate::models::{EventRow, StatusCount};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Unique constraint hit: the event id or idempotency key already
    /// has a row
    #[error("event already persisted: {0}")]
    Duplicate(Uuid),

    /// Event not found
    #[error("event not found: {0}")]
    NotFound(Uuid),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Handler fan-out, boxed so it can run inside a store transaction
pub type DispatchFuture = BoxFuture<'static, Vec<HandlerFailure>>;

/// Result of the processing transaction
#[derive(Debug)]
pub struct ProcessReport {
    pub row: EventRow,
    pub handler_failures: Vec<HandlerFailure>,
}

/// Persistence seam for event rows
///
/// Implementations must be thread-safe; the API and every drain worker
/// share one store.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// The processing transaction: insert the row with status
    /// `processing`, await the handler fan-out, then mark the row
    /// `processed`, all or nothing. Handler failures are collected
    /// and recorded, never aborting the transaction.
    ///
    /// A crash mid-dispatch rolls the insert back, so a redelivery
    /// starts from a clean slate.
    async fn persist_with_dispatch(
        &self,
        event: &Event,
        dispatch: DispatchFuture,
    ) -> Result<ProcessReport, StoreError>;

    /// Emergency fallback at intake: persist the event with
    /// `status=failed` so it is durable and recoverable offline.
    async fn insert_failed(&self, event: &Event, error: &str) -> Result<EventRow, StoreError>;

    async fn get_event(&self, id: Uuid) -> Result<Option<EventRow>, StoreError>;

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<EventRow>, StoreError>;

    /// Record a terminal failure on an existing row.
    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), StoreError>;

    /// Row counts per lifecycle status.
    async fn status_counts(&self) -> Result<Vec<StatusCount>, StoreError>;

    /// Cheap connectivity probe for the health endpoint.
    async fn ping(&self) -> Result<(), StoreError>;
}
