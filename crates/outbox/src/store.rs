//! Outbox store abstraction.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use logistics_core::OutboxEventId;

use crate::types::{OutboxEvent, OutboxStatus};

/// Outbox store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OutboxStoreError {
    #[error("outbox event not found: {0}")]
    NotFound(OutboxEventId),
    #[error("outbox event already exists: {0}")]
    AlreadyExists(OutboxEventId),
    #[error("invalid outbox event: {0}")]
    InvalidEvent(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Row counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct OutboxStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl OutboxStats {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed
    }
}

/// Durable keyed storage of outbox rows with status-indexed retrieval.
///
/// Every status mutation is a single atomic update scoped to one id, so
/// command handlers appending rows and publishers updating rows never
/// contend on the same row. `mark_as_processing` is conditional on the row
/// still being PENDING: when several publishers poll the same store, exactly
/// one of them wins each claim.
///
/// A publisher settles its claims with the `*_claimed` operations, which only
/// apply while the row is still PROCESSING. A publisher whose claim was
/// reclaimed and handed to another instance therefore cannot overwrite that
/// instance's outcome. The unconditional `mark_as_*` operations are for
/// operators and tooling.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert or update a row by id. Stamps `updated_at`.
    async fn save(&self, event: OutboxEvent) -> Result<OutboxEvent, OutboxStoreError>;

    async fn find_by_id(&self, id: OutboxEventId) -> Result<Option<OutboxEvent>, OutboxStoreError>;

    /// All PENDING rows, oldest first (ties broken by id).
    async fn find_pending(&self) -> Result<Vec<OutboxEvent>, OutboxStoreError>;

    /// At most `limit` PENDING rows, oldest first.
    async fn find_pending_batch(&self, limit: usize) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        let mut pending = self.find_pending().await?;
        pending.truncate(limit);
        Ok(pending)
    }

    /// Rows in `status`, oldest first.
    async fn find_by_status(
        &self,
        status: OutboxStatus,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError>;

    /// Rows of one event type, newest first.
    async fn find_by_event_type(&self, event_type: &str) -> Result<Vec<OutboxEvent>, OutboxStoreError>;

    /// Claim a row: PENDING → PROCESSING. Returns `false` if the row was not
    /// PENDING anymore (claimed by someone else, or already handled).
    async fn mark_as_processing(&self, id: OutboxEventId) -> Result<bool, OutboxStoreError>;

    /// → COMPLETED with `processed_at`. A no-op on rows already COMPLETED.
    async fn mark_as_completed(&self, id: OutboxEventId) -> Result<(), OutboxStoreError>;

    /// → FAILED with `error_message`. A no-op on rows already COMPLETED.
    async fn mark_as_failed(&self, id: OutboxEventId, message: &str) -> Result<(), OutboxStoreError>;

    /// PROCESSING → COMPLETED. Returns `false` (changing nothing) if the row
    /// is not PROCESSING anymore.
    async fn complete_claimed(&self, id: OutboxEventId) -> Result<bool, OutboxStoreError>;

    /// PROCESSING → FAILED in one update: records `message`, adds one failed
    /// attempt and sets the earliest requeue time to `retry_at` (`None` when
    /// no retry is planned). Returns the new retry count, or `None` if the row
    /// is not PROCESSING anymore.
    async fn fail_claimed(
        &self,
        id: OutboxEventId,
        message: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<Option<u32>, OutboxStoreError>;

    /// PROCESSING → PENDING without counting an attempt. Returns `false` if the
    /// row is not PROCESSING anymore.
    async fn release_claimed(&self, id: OutboxEventId) -> Result<bool, OutboxStoreError>;

    /// Add one failed attempt; returns the new count.
    async fn increment_retry_count(&self, id: OutboxEventId) -> Result<u32, OutboxStoreError>;

    /// Set the earliest requeue time of a FAILED row.
    async fn schedule_retry(
        &self,
        id: OutboxEventId,
        at: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError>;

    /// FAILED rows with `retry_count < max_attempts` that are due at `now`,
    /// oldest first.
    async fn find_retryable(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError>;

    /// FAILED → PENDING. Returns `false` if the row was not FAILED.
    async fn requeue(&self, id: OutboxEventId) -> Result<bool, OutboxStoreError>;

    /// Move PROCESSING rows last touched before `cutoff` back to PENDING.
    async fn reclaim_stale(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<OutboxEventId>, OutboxStoreError>;

    /// Delete COMPLETED rows processed before `older_than`. Maintenance only;
    /// the publisher never deletes rows.
    async fn purge_completed(&self, older_than: DateTime<Utc>) -> Result<u64, OutboxStoreError>;

    async fn stats(&self) -> Result<OutboxStats, OutboxStoreError>;
}

#[async_trait]
impl<S> OutboxStore for Arc<S>
where
    S: OutboxStore + ?Sized,
{
    async fn save(&self, event: OutboxEvent) -> Result<OutboxEvent, OutboxStoreError> {
        (**self).save(event).await
    }

    async fn find_by_id(&self, id: OutboxEventId) -> Result<Option<OutboxEvent>, OutboxStoreError> {
        (**self).find_by_id(id).await
    }

    async fn find_pending(&self) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        (**self).find_pending().await
    }

    async fn find_pending_batch(&self, limit: usize) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        (**self).find_pending_batch(limit).await
    }

    async fn find_by_status(
        &self,
        status: OutboxStatus,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        (**self).find_by_status(status, limit).await
    }

    async fn find_by_event_type(&self, event_type: &str) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        (**self).find_by_event_type(event_type).await
    }

    async fn mark_as_processing(&self, id: OutboxEventId) -> Result<bool, OutboxStoreError> {
        (**self).mark_as_processing(id).await
    }

    async fn mark_as_completed(&self, id: OutboxEventId) -> Result<(), OutboxStoreError> {
        (**self).mark_as_completed(id).await
    }

    async fn mark_as_failed(&self, id: OutboxEventId, message: &str) -> Result<(), OutboxStoreError> {
        (**self).mark_as_failed(id, message).await
    }

    async fn complete_claimed(&self, id: OutboxEventId) -> Result<bool, OutboxStoreError> {
        (**self).complete_claimed(id).await
    }

    async fn fail_claimed(
        &self,
        id: OutboxEventId,
        message: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<Option<u32>, OutboxStoreError> {
        (**self).fail_claimed(id, message, retry_at).await
    }

    async fn release_claimed(&self, id: OutboxEventId) -> Result<bool, OutboxStoreError> {
        (**self).release_claimed(id).await
    }

    async fn increment_retry_count(&self, id: OutboxEventId) -> Result<u32, OutboxStoreError> {
        (**self).increment_retry_count(id).await
    }

    async fn schedule_retry(
        &self,
        id: OutboxEventId,
        at: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError> {
        (**self).schedule_retry(id, at).await
    }

    async fn find_retryable(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        (**self).find_retryable(now, max_attempts, limit).await
    }

    async fn requeue(&self, id: OutboxEventId) -> Result<bool, OutboxStoreError> {
        (**self).requeue(id).await
    }

    async fn reclaim_stale(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<OutboxEventId>, OutboxStoreError> {
        (**self).reclaim_stale(cutoff).await
    }

    async fn purge_completed(&self, older_than: DateTime<Utc>) -> Result<u64, OutboxStoreError> {
        (**self).purge_completed(older_than).await
    }

    async fn stats(&self) -> Result<OutboxStats, OutboxStoreError> {
        (**self).stats().await
    }
}
