//! Postgres-backed outbox store.
//!
//! Every status transition is one conditional `UPDATE` scoped to a single id,
//! so concurrent publishers (and command handlers inserting rows) never need
//! explicit locks. The claim is `WHERE status = 'PENDING'`: whichever
//! publisher updates the row first wins, the others see zero affected rows.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | OutboxStoreError |
//! |------------|----------------------|------------------|
//! | Database (unique violation on insert) | `23505` | `AlreadyExists` |
//! | Database (check constraint violation) | `23514` | `InvalidEvent` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / other | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use logistics_core::OutboxEventId;
use logistics_outbox::{
    NewOutboxEvent, OutboxEvent, OutboxStats, OutboxStatus, OutboxStore, OutboxStoreError,
    OutboxWriter,
};

const COLUMNS: &str = "id, event_type, event_data, status, routing_key, exchange, retry_count, \
                       processed_at, error_message, next_attempt_at, created_at, updated_at";

const SCHEMA: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS outbox_events (
        id UUID PRIMARY KEY,
        event_type TEXT NOT NULL,
        event_data JSONB NOT NULL,
        status TEXT NOT NULL DEFAULT 'PENDING'
            CHECK (status IN ('PENDING', 'PROCESSING', 'COMPLETED', 'FAILED')),
        routing_key TEXT NOT NULL,
        exchange TEXT NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
        processed_at TIMESTAMPTZ,
        error_message TEXT,
        next_attempt_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_outbox_events_status_created_at ON outbox_events (status, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_outbox_events_event_type ON outbox_events (event_type)",
];

/// Postgres outbox store over a shared connection pool.
#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: Arc<PgPool>,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `outbox_events` table and its indexes if missing.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), OutboxStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }

    /// Begin a transaction for a domain write plus its outbox rows.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>, OutboxStoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    /// Distinguish "row not in the expected state" from "row missing".
    async fn ensure_exists(&self, operation: &str, id: OutboxEventId) -> Result<(), OutboxStoreError> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM outbox_events WHERE id = $1)")
            .bind(id.as_uuid())
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        if exists {
            Ok(())
        } else {
            Err(OutboxStoreError::NotFound(id))
        }
    }

    async fn fetch_rows(
        &self,
        operation: &str,
        query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        let rows = query
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        rows.iter().map(decode_row).collect()
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    #[instrument(skip(self, event), fields(event_id = %event.id, event_type = %event.event_type), err)]
    async fn save(&self, event: OutboxEvent) -> Result<OutboxEvent, OutboxStoreError> {
        let sql = format!(
            r#"
            INSERT INTO outbox_events ({COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW())
            ON CONFLICT (id) DO UPDATE SET
                event_type = EXCLUDED.event_type,
                event_data = EXCLUDED.event_data,
                status = EXCLUDED.status,
                routing_key = EXCLUDED.routing_key,
                exchange = EXCLUDED.exchange,
                retry_count = EXCLUDED.retry_count,
                processed_at = EXCLUDED.processed_at,
                error_message = EXCLUDED.error_message,
                next_attempt_at = EXCLUDED.next_attempt_at,
                updated_at = NOW()
            RETURNING {COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(event.id.as_uuid())
            .bind(&event.event_type)
            .bind(&event.event_data)
            .bind(event.status.as_str())
            .bind(&event.routing_key)
            .bind(&event.exchange)
            .bind(retry_count_param(event.retry_count))
            .bind(event.processed_at)
            .bind(&event.error_message)
            .bind(event.next_attempt_at)
            .bind(event.created_at)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("save", e))?;

        decode_row(&row)
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    async fn find_by_id(&self, id: OutboxEventId) -> Result<Option<OutboxEvent>, OutboxStoreError> {
        let sql = format!("SELECT {COLUMNS} FROM outbox_events WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_id", e))?;

        row.as_ref().map(decode_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn find_pending(&self) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM outbox_events WHERE status = 'PENDING' ORDER BY created_at ASC, id ASC"
        );
        self.fetch_rows("find_pending", sqlx::query(&sql)).await
    }

    #[instrument(skip(self), err)]
    async fn find_pending_batch(&self, limit: usize) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM outbox_events WHERE status = 'PENDING' \
             ORDER BY created_at ASC, id ASC LIMIT $1"
        );
        self.fetch_rows("find_pending_batch", sqlx::query(&sql).bind(limit_param(limit)))
            .await
    }

    #[instrument(skip(self), err)]
    async fn find_by_status(
        &self,
        status: OutboxStatus,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM outbox_events WHERE status = $1 \
             ORDER BY created_at ASC, id ASC LIMIT $2"
        );
        let query = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(limit_param(limit));
        self.fetch_rows("find_by_status", query).await
    }

    #[instrument(skip(self), err)]
    async fn find_by_event_type(&self, event_type: &str) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM outbox_events WHERE event_type = $1 \
             ORDER BY created_at DESC, id DESC"
        );
        self.fetch_rows("find_by_event_type", sqlx::query(&sql).bind(event_type))
            .await
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    async fn mark_as_processing(&self, id: OutboxEventId) -> Result<bool, OutboxStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'PROCESSING', updated_at = NOW()
            WHERE id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_as_processing", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        self.ensure_exists("mark_as_processing", id).await?;
        Ok(false)
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    async fn mark_as_completed(&self, id: OutboxEventId) -> Result<(), OutboxStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'COMPLETED',
                processed_at = GREATEST(NOW(), created_at),
                next_attempt_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status <> 'COMPLETED'
            "#,
        )
        .bind(id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_as_completed", e))?;

        if result.rows_affected() == 0 {
            self.ensure_exists("mark_as_completed", id).await?;
        }
        Ok(())
    }

    #[instrument(skip(self, message), fields(event_id = %id), err)]
    async fn mark_as_failed(&self, id: OutboxEventId, message: &str) -> Result<(), OutboxStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'FAILED', error_message = $2, updated_at = NOW()
            WHERE id = $1 AND status <> 'COMPLETED'
            "#,
        )
        .bind(id.as_uuid())
        .bind(message)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_as_failed", e))?;

        if result.rows_affected() == 0 {
            self.ensure_exists("mark_as_failed", id).await?;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    async fn complete_claimed(&self, id: OutboxEventId) -> Result<bool, OutboxStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'COMPLETED',
                processed_at = GREATEST(NOW(), created_at),
                next_attempt_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'PROCESSING'
            "#,
        )
        .bind(id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete_claimed", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        self.ensure_exists("complete_claimed", id).await?;
        Ok(false)
    }

    #[instrument(skip(self, message), fields(event_id = %id), err)]
    async fn fail_claimed(
        &self,
        id: OutboxEventId,
        message: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<Option<u32>, OutboxStoreError> {
        let count: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE outbox_events
            SET status = 'FAILED',
                error_message = $2,
                retry_count = retry_count + 1,
                next_attempt_at = $3,
                updated_at = NOW()
            WHERE id = $1 AND status = 'PROCESSING'
            RETURNING retry_count
            "#,
        )
        .bind(id.as_uuid())
        .bind(message)
        .bind(retry_at)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail_claimed", e))?;

        match count {
            Some(count) => Ok(Some(u32::try_from(count).unwrap_or_default())),
            None => {
                self.ensure_exists("fail_claimed", id).await?;
                Ok(None)
            }
        }
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    async fn release_claimed(&self, id: OutboxEventId) -> Result<bool, OutboxStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'PENDING', updated_at = NOW()
            WHERE id = $1 AND status = 'PROCESSING'
            "#,
        )
        .bind(id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release_claimed", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        self.ensure_exists("release_claimed", id).await?;
        Ok(false)
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    async fn increment_retry_count(&self, id: OutboxEventId) -> Result<u32, OutboxStoreError> {
        let count: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE outbox_events
            SET retry_count = retry_count + 1, updated_at = NOW()
            WHERE id = $1
            RETURNING retry_count
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("increment_retry_count", e))?;

        count
            .map(|c| u32::try_from(c).unwrap_or_default())
            .ok_or(OutboxStoreError::NotFound(id))
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    async fn schedule_retry(
        &self,
        id: OutboxEventId,
        at: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError> {
        let result = sqlx::query(
            "UPDATE outbox_events SET next_attempt_at = $2 WHERE id = $1 AND status = 'FAILED'",
        )
        .bind(id.as_uuid())
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("schedule_retry", e))?;

        if result.rows_affected() == 0 {
            self.ensure_exists("schedule_retry", id).await?;
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn find_retryable(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        let sql = format!(
            r#"
            SELECT {COLUMNS} FROM outbox_events
            WHERE status = 'FAILED'
              AND retry_count < $1
              AND (next_attempt_at IS NULL OR next_attempt_at <= $2)
            ORDER BY created_at ASC, id ASC
            LIMIT $3
            "#
        );
        let query = sqlx::query(&sql)
            .bind(i64::from(max_attempts))
            .bind(now)
            .bind(limit_param(limit));
        self.fetch_rows("find_retryable", query).await
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    async fn requeue(&self, id: OutboxEventId) -> Result<bool, OutboxStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'PENDING', next_attempt_at = NULL, updated_at = NOW()
            WHERE id = $1 AND status = 'FAILED'
            "#,
        )
        .bind(id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        self.ensure_exists("requeue", id).await?;
        Ok(false)
    }

    #[instrument(skip(self), err)]
    async fn reclaim_stale(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<OutboxEventId>, OutboxStoreError> {
        let ids: Vec<uuid::Uuid> = sqlx::query_scalar(
            r#"
            UPDATE outbox_events
            SET status = 'PENDING', updated_at = NOW()
            WHERE status = 'PROCESSING' AND updated_at < $1
            RETURNING id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reclaim_stale", e))?;

        let mut ids: Vec<OutboxEventId> = ids.into_iter().map(OutboxEventId::from_uuid).collect();
        ids.sort();
        Ok(ids)
    }

    #[instrument(skip(self), err)]
    async fn purge_completed(&self, older_than: DateTime<Utc>) -> Result<u64, OutboxStoreError> {
        let result = sqlx::query(
            "DELETE FROM outbox_events WHERE status = 'COMPLETED' AND processed_at < $1",
        )
        .bind(older_than)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("purge_completed", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<OutboxStats, OutboxStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM outbox_events GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = OutboxStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", e))?;
            let count: i64 = row.try_get("count").map_err(|e| map_sqlx_error("stats", e))?;
            let count = usize::try_from(count).unwrap_or_default();
            match status.parse::<OutboxStatus>()? {
                OutboxStatus::Pending => stats.pending = count,
                OutboxStatus::Processing => stats.processing = count,
                OutboxStatus::Completed => stats.completed = count,
                OutboxStatus::Failed => stats.failed = count,
            }
        }
        Ok(stats)
    }
}

/// Outbox writer bound to an open Postgres transaction.
///
/// Rows are inserted through the caller's transaction, so they commit or roll
/// back together with the domain write made on the same transaction.
pub struct PgOutboxWriter<'a, 'c> {
    tx: &'a mut Transaction<'c, Postgres>,
}

impl<'a, 'c> PgOutboxWriter<'a, 'c> {
    pub fn new(tx: &'a mut Transaction<'c, Postgres>) -> Self {
        Self { tx }
    }

    /// Insert an already built row (e.g. one staged in a `StagedOutbox`).
    pub async fn insert(&mut self, row: &OutboxEvent) -> Result<(), OutboxStoreError> {
        sqlx::query(
            r#"
            INSERT INTO outbox_events
                (id, event_type, event_data, status, routing_key, exchange, retry_count, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            "#,
        )
        .bind(row.id.as_uuid())
        .bind(&row.event_type)
        .bind(&row.event_data)
        .bind(row.status.as_str())
        .bind(&row.routing_key)
        .bind(&row.exchange)
        .bind(retry_count_param(row.retry_count))
        .bind(row.created_at)
        .execute(&mut **self.tx)
        .await
        .map_err(|e| map_insert_error("append", row.id, e))?;

        Ok(())
    }
}

#[async_trait]
impl OutboxWriter for PgOutboxWriter<'_, '_> {
    #[instrument(skip(self, event), fields(event_type = %event.event_type), err)]
    async fn append(&mut self, event: NewOutboxEvent) -> Result<OutboxEvent, OutboxStoreError> {
        event.validate()?;
        let row = OutboxEvent::pending(event);
        self.insert(&row).await?;
        Ok(row)
    }
}

/// Inserts know the id they tried to write; a unique violation there is a
/// duplicate row.
fn map_insert_error(operation: &str, id: OutboxEventId, err: sqlx::Error) -> OutboxStoreError {
    if is_unique_violation(&err) {
        OutboxStoreError::AlreadyExists(id)
    } else {
        map_sqlx_error(operation, err)
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505"))
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn retry_count_param(count: u32) -> i32 {
    i32::try_from(count).unwrap_or(i32::MAX)
}

/// Map SQLx errors to `OutboxStoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> OutboxStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23514") => OutboxStoreError::InvalidEvent(msg),
                _ => OutboxStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            OutboxStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => OutboxStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

// SQLx row types

#[derive(Debug)]
struct OutboxEventRow {
    id: uuid::Uuid,
    event_type: String,
    event_data: serde_json::Value,
    status: String,
    routing_key: String,
    exchange: String,
    retry_count: i32,
    processed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    next_attempt_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for OutboxEventRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(OutboxEventRow {
            id: row.try_get("id")?,
            event_type: row.try_get("event_type")?,
            event_data: row.try_get("event_data")?,
            status: row.try_get("status")?,
            routing_key: row.try_get("routing_key")?,
            exchange: row.try_get("exchange")?,
            retry_count: row.try_get("retry_count")?,
            processed_at: row.try_get("processed_at")?,
            error_message: row.try_get("error_message")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<OutboxEventRow> for OutboxEvent {
    type Error = OutboxStoreError;

    fn try_from(row: OutboxEventRow) -> Result<Self, Self::Error> {
        Ok(OutboxEvent {
            id: OutboxEventId::from_uuid(row.id),
            event_type: row.event_type,
            event_data: row.event_data,
            status: row.status.parse()?,
            routing_key: row.routing_key,
            exchange: row.exchange,
            retry_count: u32::try_from(row.retry_count).unwrap_or_default(),
            processed_at: row.processed_at,
            error_message: row.error_message,
            next_attempt_at: row.next_attempt_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn decode_row(row: &sqlx::postgres::PgRow) -> Result<OutboxEvent, OutboxStoreError> {
    use sqlx::FromRow;

    OutboxEventRow::from_row(row)
        .map_err(|e| OutboxStoreError::Storage(format!("failed to decode outbox row: {}", e)))?
        .try_into()
}
