//! In-memory event store for tests

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use eventgate_core::{Event, EventStatus};

use crate::models::{EventRow, StatusCount};
use crate::store::{DispatchFuture, EventStore, ProcessReport, StoreError};

/// Event store twin that keeps rows in a map; enforces the same
/// uniqueness constraints as the Postgres schema
#[derive(Default)]
pub struct InMemoryEventStore {
    rows: RwLock<HashMap<Uuid, EventRow>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }

    async fn check_unique(&self, event: &Event) -> Result<(), StoreError> {
        let rows = self.rows.read().await;
        if rows.contains_key(&event.id) {
            return Err(StoreError::Duplicate(event.id));
        }
        if let Some(key) = &event.idempotency_key {
            if rows
                .values()
                .any(|row| row.idempotency_key.as_deref() == Some(key))
            {
                return Err(StoreError::Duplicate(event.id));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn persist_with_dispatch(
        &self,
        event: &Event,
        dispatch: DispatchFuture,
    ) -> Result<ProcessReport, StoreError> {
        self.check_unique(event).await?;

        let handler_failures = dispatch.await;

        let mut row = EventRow::from_event(event, EventStatus::Processed, None);
        row.processed_at = Some(Utc::now());
        if !handler_failures.is_empty() {
            row.last_error = Some(
                handler_failures
                    .iter()
                    .map(|f| format!("{}: {}", f.handler, f.error))
                    .collect::<Vec<_>>()
                    .join("; "),
            );
        }

        self.rows.write().await.insert(event.id, row.clone());

        Ok(ProcessReport {
            row,
            handler_failures,
        })
    }

    async fn insert_failed(&self, event: &Event, error: &str) -> Result<EventRow, StoreError> {
        self.check_unique(event).await?;
        let row = EventRow::from_event(event, EventStatus::Failed, Some(error));
        self.rows.write().await.insert(event.id, row.clone());
        Ok(row)
    }

    async fn get_event(&self, id: Uuid) -> Result<Option<EventRow>, StoreError> {
        Ok(self.rows.read().await.get(&id).cloned())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<EventRow>, StoreError> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .find(|row| row.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let mut rows = self.rows.write().await;
        let row = rows.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        row.status = EventStatus::Failed.to_string();
        row.last_error = Some(error.to_string());
        row.retry_count += 1;
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn status_counts(&self) -> Result<Vec<StatusCount>, StoreError> {
        let rows = self.rows.read().await;
        let mut counts: HashMap<String, i64> = HashMap::new();
        for row in rows.values() {
            *counts.entry(row.status.clone()).or_default() += 1;
        }
        let mut out: Vec<StatusCount> = counts
            .into_iter()
            .map(|(status, count)| StatusCount { status, count })
            .collect();
        out.sort_by(|a, b| a.status.cmp(&b.status));
        Ok(out)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventgate_core::NewEvent;
    use futures::FutureExt;
    use serde_json::json;

    fn event_with_key(key: Option<&str>) -> Event {
        Event::from_intake(NewEvent {
            user_id: Uuid::new_v4(),
            event_type: "purchase".to_string(),
            timestamp: Utc::now(),
            payload: json!({"amount": 50, "currency": "USD"}),
            metadata: None,
            priority: None,
            idempotency_key: key.map(str::to_string),
        })
    }

    fn no_failures() -> DispatchFuture {
        async { Vec::new() }.boxed()
    }

    #[tokio::test]
    async fn test_persist_marks_processed() {
        let store = InMemoryEventStore::new();
        let event = event_with_key(None);

        let report = store
            .persist_with_dispatch(&event, no_failures())
            .await
            .unwrap();
        assert_eq!(report.row.status, "processed");
        assert!(report.row.processed_at.is_some());

        let row = store.get_event(event.id).await.unwrap().unwrap();
        assert_eq!(row.event_type, "purchase");
        assert_eq!(row.priority, 9);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let store = InMemoryEventStore::new();
        let event = event_with_key(None);

        store
            .persist_with_dispatch(&event, no_failures())
            .await
            .unwrap();
        let err = store
            .persist_with_dispatch(&event, no_failures())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(id) if id == event.id));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_duplicate_idempotency_key_rejected() {
        let store = InMemoryEventStore::new();
        let key = "a".repeat(64);
        let first = event_with_key(Some(&key));
        let second = event_with_key(Some(&key));

        store
            .persist_with_dispatch(&first, no_failures())
            .await
            .unwrap();
        let err = store
            .persist_with_dispatch(&second, no_failures())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));

        let found = store.find_by_idempotency_key(&key).await.unwrap().unwrap();
        assert_eq!(found.id, first.id);
    }

    #[tokio::test]
    async fn test_handler_failures_recorded_but_processed() {
        let store = InMemoryEventStore::new();
        let event = event_with_key(None);

        let dispatch: DispatchFuture = async {
            vec![eventgate_core::HandlerFailure {
                handler: "audit".to_string(),
                error: "downstream timeout".to_string(),
            }]
        }
        .boxed();

        let report = store.persist_with_dispatch(&event, dispatch).await.unwrap();
        assert_eq!(report.handler_failures.len(), 1);
        assert_eq!(report.row.status, "processed");
        assert!(report.row.last_error.as_deref().unwrap().contains("audit"));
    }

    #[tokio::test]
    async fn test_insert_failed_and_mark_failed() {
        let store = InMemoryEventStore::new();
        let event = event_with_key(None);

        let row = store.insert_failed(&event, "broker down").await.unwrap();
        assert_eq!(row.status, "failed");
        assert_eq!(row.last_error.as_deref(), Some("broker down"));

        store.mark_failed(event.id, "still down").await.unwrap();
        let row = store.get_event(event.id).await.unwrap().unwrap();
        assert_eq!(row.retry_count, 1);

        let missing = store.mark_failed(Uuid::new_v4(), "x").await.unwrap_err();
        assert!(matches!(missing, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_status_counts() {
        let store = InMemoryEventStore::new();
        store
            .persist_with_dispatch(&event_with_key(None), no_failures())
            .await
            .unwrap();
        store
            .insert_failed(&event_with_key(None), "x")
            .await
            .unwrap();
        store
            .insert_failed(&event_with_key(None), "y")
            .await
            .unwrap();

        let counts = store.status_counts().await.unwrap();
        assert_eq!(counts.len(), 2);
        assert_eq!(counts[0].status, "failed");
        assert_eq!(counts[0].count, 2);
        assert_eq!(counts[1].status, "processed");
        assert_eq!(counts[1].count, 1);
    }
}
