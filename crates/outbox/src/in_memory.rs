//! In-memory outbox store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use logistics_core::OutboxEventId;

use crate::store::{OutboxStats, OutboxStore, OutboxStoreError};
use crate::types::{OutboxEvent, OutboxStatus};
use crate::writer::StagedOutbox;

/// In-memory outbox store.
///
/// All mutations happen under one write lock, which gives every operation the
/// single-update atomicity the Postgres store gets from `UPDATE ... WHERE`.
#[derive(Debug, Default)]
pub struct InMemoryOutboxStore {
    events: RwLock<HashMap<OutboxEventId, OutboxEvent>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Start collecting rows for a unit of work.
    pub fn stage(&self) -> StagedOutbox {
        StagedOutbox::new()
    }

    /// Make staged rows visible, all or nothing.
    ///
    /// Fails without inserting anything if any staged id is already present.
    pub fn commit_staged(&self, staged: StagedOutbox) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        let rows = staged.into_events();
        let mut events = self.write()?;

        if let Some(dup) = rows.iter().find(|e| events.contains_key(&e.id)) {
            return Err(OutboxStoreError::AlreadyExists(dup.id));
        }

        for row in &rows {
            events.insert(row.id, row.clone());
        }
        Ok(rows)
    }

    /// Number of rows, whatever their status.
    pub fn len(&self) -> usize {
        self.read().map(|events| events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<OutboxEventId, OutboxEvent>>, OutboxStoreError> {
        self.events
            .read()
            .map_err(|_| OutboxStoreError::Storage("outbox lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<OutboxEventId, OutboxEvent>>, OutboxStoreError> {
        self.events
            .write()
            .map_err(|_| OutboxStoreError::Storage("outbox lock poisoned".to_string()))
    }

    /// Apply `f` to the row `id` under the write lock.
    fn update<T>(
        &self,
        id: OutboxEventId,
        f: impl FnOnce(&mut OutboxEvent) -> T,
    ) -> Result<T, OutboxStoreError> {
        let mut events = self.write()?;
        let event = events.get_mut(&id).ok_or(OutboxStoreError::NotFound(id))?;
        Ok(f(event))
    }

    fn oldest_first(mut rows: Vec<OutboxEvent>) -> Vec<OutboxEvent> {
        rows.sort_by_key(|e| (e.created_at, e.id));
        rows
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn save(&self, mut event: OutboxEvent) -> Result<OutboxEvent, OutboxStoreError> {
        let mut events = self.write()?;
        event.updated_at = Utc::now().max(event.created_at);
        events.insert(event.id, event.clone());
        Ok(event)
    }

    async fn find_by_id(&self, id: OutboxEventId) -> Result<Option<OutboxEvent>, OutboxStoreError> {
        Ok(self.read()?.get(&id).cloned())
    }

    async fn find_pending(&self) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        let pending = self
            .read()?
            .values()
            .filter(|e| e.status == OutboxStatus::Pending)
            .cloned()
            .collect();
        Ok(Self::oldest_first(pending))
    }

    async fn find_by_status(
        &self,
        status: OutboxStatus,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        let rows = self
            .read()?
            .values()
            .filter(|e| e.status == status)
            .cloned()
            .collect();
        let mut rows = Self::oldest_first(rows);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn find_by_event_type(&self, event_type: &str) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        let rows = self
            .read()?
            .values()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect();
        let mut rows = Self::oldest_first(rows);
        rows.reverse();
        Ok(rows)
    }

    async fn mark_as_processing(&self, id: OutboxEventId) -> Result<bool, OutboxStoreError> {
        self.update(id, |e| e.claim(Utc::now()))
    }

    async fn mark_as_completed(&self, id: OutboxEventId) -> Result<(), OutboxStoreError> {
        self.update(id, |e| e.complete(Utc::now()))
    }

    async fn mark_as_failed(&self, id: OutboxEventId, message: &str) -> Result<(), OutboxStoreError> {
        self.update(id, |e| e.fail(message, Utc::now()))
    }

    async fn complete_claimed(&self, id: OutboxEventId) -> Result<bool, OutboxStoreError> {
        self.update(id, |e| {
            if e.status != OutboxStatus::Processing {
                return false;
            }
            e.complete(Utc::now());
            true
        })
    }

    async fn fail_claimed(
        &self,
        id: OutboxEventId,
        message: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<Option<u32>, OutboxStoreError> {
        self.update(id, |e| e.fail_attempt(message, retry_at, Utc::now()))
    }

    async fn release_claimed(&self, id: OutboxEventId) -> Result<bool, OutboxStoreError> {
        self.update(id, |e| e.release(Utc::now()))
    }

    async fn increment_retry_count(&self, id: OutboxEventId) -> Result<u32, OutboxStoreError> {
        self.update(id, |e| {
            e.retry_count = e.retry_count.saturating_add(1);
            e.updated_at = Utc::now();
            e.retry_count
        })
    }

    async fn schedule_retry(
        &self,
        id: OutboxEventId,
        at: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError> {
        self.update(id, |e| {
            if e.status == OutboxStatus::Failed {
                e.next_attempt_at = Some(at);
            }
        })
    }

    async fn find_retryable(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        let rows = self
            .read()?
            .values()
            .filter(|e| e.is_retryable(max_attempts, now))
            .cloned()
            .collect();
        let mut rows = Self::oldest_first(rows);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn requeue(&self, id: OutboxEventId) -> Result<bool, OutboxStoreError> {
        self.update(id, |e| e.requeue(Utc::now()))
    }

    async fn reclaim_stale(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<OutboxEventId>, OutboxStoreError> {
        let now = Utc::now();
        let mut events = self.write()?;
        let mut reclaimed = Vec::new();
        for event in events.values_mut() {
            if event.updated_at < cutoff && event.release(now) {
                reclaimed.push(event.id);
            }
        }
        reclaimed.sort();
        Ok(reclaimed)
    }

    async fn purge_completed(&self, older_than: DateTime<Utc>) -> Result<u64, OutboxStoreError> {
        let mut events = self.write()?;
        let before = events.len();
        events.retain(|_, e| {
            !(e.status == OutboxStatus::Completed
                && e.processed_at.is_some_and(|at| at < older_than))
        });
        Ok((before - events.len()) as u64)
    }

    async fn stats(&self) -> Result<OutboxStats, OutboxStoreError> {
        let events = self.read()?;
        let mut stats = OutboxStats::default();
        for event in events.values() {
            match event.status {
                OutboxStatus::Pending => stats.pending += 1,
                OutboxStatus::Processing => stats.processing += 1,
                OutboxStatus::Completed => stats.completed += 1,
                OutboxStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NewOutboxEvent;
    use crate::writer::OutboxWriter;
    use proptest::prelude::*;
    use serde_json::json;

    fn new_event(event_type: &str) -> NewOutboxEvent {
        NewOutboxEvent::new(event_type, json!({"type": event_type}), "shipment.created", "logistics")
    }

    async fn append(store: &InMemoryOutboxStore, event_type: &str) -> OutboxEvent {
        let mut staged = store.stage();
        let row = staged.append(new_event(event_type)).await.unwrap();
        store.commit_staged(staged).unwrap();
        row
    }

    #[tokio::test]
    async fn staged_rows_are_invisible_until_committed() {
        let store = InMemoryOutboxStore::new();
        let mut staged = store.stage();
        staged.append(new_event("ShipmentCreated")).await.unwrap();

        assert!(store.find_pending().await.unwrap().is_empty());

        store.commit_staged(staged).unwrap();
        assert_eq!(store.find_pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dropped_stage_leaves_no_rows() {
        let store = InMemoryOutboxStore::new();
        {
            let mut staged = store.stage();
            staged.append(new_event("ShipmentCreated")).await.unwrap();
        }
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn commit_is_all_or_nothing_on_duplicate_ids() {
        let store = InMemoryOutboxStore::new();
        let existing = append(&store, "ShipmentCreated").await;

        let mut staged = store.stage();
        staged.append(new_event("DriverCreated")).await.unwrap();
        staged.push(existing.clone());

        let err = store.commit_staged(staged).unwrap_err();
        assert_eq!(err, OutboxStoreError::AlreadyExists(existing.id));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn save_inserts_and_updates_by_id() {
        let store = InMemoryOutboxStore::new();
        let row = OutboxEvent::pending(new_event("ShipmentCreated"));
        let saved = store.save(row.clone()).await.unwrap();
        assert_eq!(saved.id, row.id);

        let mut changed = saved.clone();
        changed.routing_key = "shipment.updated".to_string();
        store.save(changed).await.unwrap();

        let loaded = store.find_by_id(row.id).await.unwrap().unwrap();
        assert_eq!(loaded.routing_key, "shipment.updated");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn claim_is_won_once() {
        let store = InMemoryOutboxStore::new();
        let row = append(&store, "ShipmentCreated").await;

        assert!(store.mark_as_processing(row.id).await.unwrap());
        assert!(!store.mark_as_processing(row.id).await.unwrap());
        assert!(store.find_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn completed_is_idempotent() {
        let store = InMemoryOutboxStore::new();
        let row = append(&store, "ShipmentCreated").await;
        store.mark_as_processing(row.id).await.unwrap();
        store.mark_as_completed(row.id).await.unwrap();
        let first = store.find_by_id(row.id).await.unwrap().unwrap();

        store.mark_as_completed(row.id).await.unwrap();
        let second = store.find_by_id(row.id).await.unwrap().unwrap();

        assert_eq!(second.status, OutboxStatus::Completed);
        assert_eq!(second.processed_at, first.processed_at);
        assert_eq!(second.updated_at, first.updated_at);
        assert!(second.processed_at.unwrap() >= second.created_at);
    }

    #[tokio::test]
    async fn failure_records_message_and_retry_count() {
        let store = InMemoryOutboxStore::new();
        let row = append(&store, "ShipmentAssigned").await;
        store.mark_as_processing(row.id).await.unwrap();
        store.mark_as_failed(row.id, "connection reset").await.unwrap();
        assert_eq!(store.increment_retry_count(row.id).await.unwrap(), 1);
        assert_eq!(store.increment_retry_count(row.id).await.unwrap(), 2);

        let loaded = store.find_by_id(row.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, OutboxStatus::Failed);
        assert_eq!(loaded.error_message.as_deref(), Some("connection reset"));
        assert_eq!(loaded.retry_count, 2);
    }

    #[tokio::test]
    async fn claimed_failure_is_a_single_update() {
        let store = InMemoryOutboxStore::new();
        let row = append(&store, "ShipmentAssigned").await;
        let retry_at = Utc::now() + chrono::Duration::minutes(1);
        store.mark_as_processing(row.id).await.unwrap();

        let count = store.fail_claimed(row.id, "rejected", Some(retry_at)).await.unwrap();
        assert_eq!(count, Some(1));

        let loaded = store.find_by_id(row.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, OutboxStatus::Failed);
        assert_eq!(loaded.retry_count, 1);
        assert_eq!(loaded.next_attempt_at, Some(retry_at));
        // never visible as FAILED-and-due before its schedule is set
        assert!(store.find_retryable(Utc::now(), 5, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn settling_a_lost_claim_changes_nothing() {
        let store = InMemoryOutboxStore::new();
        let row = append(&store, "ShipmentCreated").await;
        store.mark_as_processing(row.id).await.unwrap();
        // reclaimed, then claimed and completed by another publisher
        store.release_claimed(row.id).await.unwrap();
        store.mark_as_processing(row.id).await.unwrap();
        assert!(store.complete_claimed(row.id).await.unwrap());
        let completed = store.find_by_id(row.id).await.unwrap().unwrap();

        assert_eq!(store.fail_claimed(row.id, "late timeout", None).await.unwrap(), None);
        assert!(!store.complete_claimed(row.id).await.unwrap());
        assert!(!store.release_claimed(row.id).await.unwrap());
        assert_eq!(store.find_by_id(row.id).await.unwrap().unwrap(), completed);
    }

    #[tokio::test]
    async fn released_claims_are_pending_and_uncounted() {
        let store = InMemoryOutboxStore::new();
        let row = append(&store, "DriverCreated").await;
        store.mark_as_processing(row.id).await.unwrap();

        assert!(store.release_claimed(row.id).await.unwrap());

        let loaded = store.find_by_id(row.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, OutboxStatus::Pending);
        assert_eq!(loaded.retry_count, 0);
        assert!(loaded.error_message.is_none());
    }

    #[tokio::test]
    async fn targeted_updates_on_unknown_ids_fail() {
        let store = InMemoryOutboxStore::new();
        let id = OutboxEventId::new();
        assert_eq!(
            store.mark_as_completed(id).await.unwrap_err(),
            OutboxStoreError::NotFound(id)
        );
        assert!(store.find_by_id(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retryable_rows_follow_schedule_and_cap() {
        let store = InMemoryOutboxStore::new();
        let due = append(&store, "A").await;
        let later = append(&store, "B").await;
        let exhausted = append(&store, "C").await;
        let now = Utc::now();

        for row in [&due, &later, &exhausted] {
            store.mark_as_processing(row.id).await.unwrap();
            store.mark_as_failed(row.id, "boom").await.unwrap();
            store.increment_retry_count(row.id).await.unwrap();
        }
        store.increment_retry_count(exhausted.id).await.unwrap();
        store
            .schedule_retry(later.id, now + chrono::Duration::minutes(5))
            .await
            .unwrap();

        let retryable = store.find_retryable(now, 2, 10).await.unwrap();
        let ids: Vec<_> = retryable.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![due.id]);

        assert!(store.requeue(due.id).await.unwrap());
        assert!(!store.requeue(due.id).await.unwrap());
        let requeued = store.find_by_id(due.id).await.unwrap().unwrap();
        assert_eq!(requeued.status, OutboxStatus::Pending);
        assert_eq!(requeued.retry_count, 1);
    }

    #[tokio::test]
    async fn stale_processing_rows_are_reclaimed() {
        let store = InMemoryOutboxStore::new();
        let stuck = append(&store, "ShipmentCreated").await;
        let fresh = append(&store, "ShipmentCreated").await;
        store.mark_as_processing(stuck.id).await.unwrap();

        let reclaimed = store
            .reclaim_stale(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(reclaimed, vec![stuck.id]);

        let pending: Vec<_> = store.find_pending().await.unwrap().into_iter().map(|e| e.id).collect();
        assert!(pending.contains(&stuck.id));
        assert!(pending.contains(&fresh.id));

        store.mark_as_processing(fresh.id).await.unwrap();
        let none = store
            .reclaim_stale(Utc::now() - chrono::Duration::minutes(1))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn purge_only_removes_old_completed_rows() {
        let store = InMemoryOutboxStore::new();
        let done = append(&store, "A").await;
        let open = append(&store, "B").await;
        store.mark_as_completed(done.id).await.unwrap();

        let purged = store
            .purge_completed(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(store.find_by_id(done.id).await.unwrap().is_none());
        assert!(store.find_by_id(open.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stats_and_lookups() {
        let store = InMemoryOutboxStore::new();
        let a = append(&store, "ShipmentCreated").await;
        let b = append(&store, "ShipmentCreated").await;
        let c = append(&store, "DriverCreated").await;
        store.mark_as_processing(a.id).await.unwrap();
        store.mark_as_completed(a.id).await.unwrap();
        store.mark_as_processing(b.id).await.unwrap();
        store.mark_as_failed(b.id, "nope").await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(
            stats,
            OutboxStats {
                pending: 1,
                processing: 0,
                completed: 1,
                failed: 1,
            }
        );
        assert_eq!(stats.total(), 3);

        let created = store.find_by_event_type("ShipmentCreated").await.unwrap();
        assert_eq!(created.len(), 2);
        assert!(created[0].created_at >= created[1].created_at);

        let failed = store.find_by_status(OutboxStatus::Failed, 10).await.unwrap();
        assert_eq!(failed[0].id, b.id);
        assert_eq!(store.find_pending_batch(10).await.unwrap()[0].id, c.id);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        /// Property: whatever order rows are saved in, find_pending returns
        /// them in non-decreasing created_at order.
        #[test]
        fn find_pending_is_oldest_first(offsets in prop::collection::vec(-10_000i64..10_000i64, 1..40)) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let store = InMemoryOutboxStore::new();
                let base = Utc::now();
                for offset in &offsets {
                    let mut row = OutboxEvent::pending(new_event("ShipmentCreated"));
                    row.created_at = base + chrono::Duration::milliseconds(*offset);
                    store.save(row).await.unwrap();
                }

                let pending = store.find_pending().await.unwrap();
                prop_assert_eq!(pending.len(), offsets.len());
                for pair in pending.windows(2) {
                    prop_assert!(pair[0].created_at <= pair[1].created_at);
                }

                let batch = store.find_pending_batch(5).await.unwrap();
                prop_assert_eq!(batch.len(), offsets.len().min(5));
                prop_assert_eq!(&batch[..], &pending[..batch.len()]);
                Ok(())
            })?;
        }
    }
}
