//! Postgres event store (sqlx)

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use eventgate_core::Event;

use crate::models::{EventRow, StatusCount};
use crate::store::{DispatchFuture, EventStore, ProcessReport, StoreError};

const EVENT_COLUMNS: &str = "id, user_id, event_type, timestamp, priority, payload, metadata, \
                             processed_at, status, idempotency_key, retry_count, last_error, \
                             created_at, updated_at";

/// Event store backed by Postgres
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the store from a connection URL.
    pub async fn from_url(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema. Idempotent.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(include_str!("../schema.sql"))
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }
}

fn map_insert_error(e: sqlx::Error, event_id: Uuid) -> StoreError {
    if let Some(db_err) = e.as_database_error() {
        // 23505 = unique_violation
        if db_err.code().as_deref() == Some("23505") {
            return StoreError::Duplicate(event_id);
        }
    }
    StoreError::Database(e.to_string())
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn persist_with_dispatch(
        &self,
        event: &Event,
        dispatch: DispatchFuture,
    ) -> Result<ProcessReport, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO events (id, user_id, event_type, timestamp, priority, payload, metadata,
                                status, idempotency_key, retry_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'processing', $8, $9)
            "#,
        )
        .bind(event.id)
        .bind(event.user_id)
        .bind(&event.event_type)
        .bind(event.timestamp)
        .bind(event.priority as i32)
        .bind(&event.payload)
        .bind(&event.metadata)
        .bind(&event.idempotency_key)
        .bind(event.retry_count as i32)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_insert_error(e, event.id))?;

        // Fan-out runs inside the transaction: a crash here rolls the
        // insert back and the redelivery starts clean.
        let handler_failures = dispatch.await;
        let last_error = if handler_failures.is_empty() {
            None
        } else {
            Some(
                handler_failures
                    .iter()
                    .map(|f| format!("{}: {}", f.handler, f.error))
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        };

        let row = sqlx::query_as::<_, EventRow>(&format!(
            r#"
            UPDATE events
            SET status = 'processed', processed_at = NOW(), last_error = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(event.id)
        .bind(last_error)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(ProcessReport {
            row,
            handler_failures,
        })
    }

    async fn insert_failed(&self, event: &Event, error: &str) -> Result<EventRow, StoreError> {
        let row = sqlx::query_as::<_, EventRow>(&format!(
            r#"
            INSERT INTO events (id, user_id, event_type, timestamp, priority, payload, metadata,
                                status, idempotency_key, retry_count, last_error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'failed', $8, $9, $10)
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(event.id)
        .bind(event.user_id)
        .bind(&event.event_type)
        .bind(event.timestamp)
        .bind(event.priority as i32)
        .bind(&event.payload)
        .bind(&event.metadata)
        .bind(&event.idempotency_key)
        .bind(event.retry_count as i32)
        .bind(error)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_insert_error(e, event.id))?;

        Ok(row)
    }

    async fn get_event(&self, id: Uuid) -> Result<Option<EventRow>, StoreError> {
        let row = sqlx::query_as::<_, EventRow>(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(row)
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<EventRow>, StoreError> {
        let row = sqlx::query_as::<_, EventRow>(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE idempotency_key = $1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(row)
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE events
            SET status = 'failed', last_error = $2, retry_count = retry_count + 1,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn status_counts(&self) -> Result<Vec<StatusCount>, StoreError> {
        let rows = sqlx::query_as::<_, StatusCount>(
            "SELECT status, COUNT(*) AS count FROM events GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(rows)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }
}
