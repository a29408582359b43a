//! Driver persistence: the repository seam and its in-memory store.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use logistics_core::DriverId;
use logistics_outbox::{InMemoryOutboxStore, OutboxEvent, StagedOutbox};

use crate::driver::{Driver, Location};
use crate::error::DriverError;

/// One position report kept in a driver's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverLocationRecord {
    pub driver_id: DriverId,
    pub location: Location,
    pub recorded_at: DateTime<Utc>,
}

/// Driver storage that commits a driver write, its location history and its
/// outbox rows in one unit of work.
#[async_trait]
pub trait DriverRepository: Send + Sync {
    async fn load(&self, id: DriverId) -> Result<Option<Driver>, DriverError>;

    async fn load_by_license_number(&self, license_number: &str) -> Result<Option<Driver>, DriverError>;

    /// Insert (version 1) or update (stored version + 1) `driver`, append
    /// `location` to its history and insert the rows staged in `outbox`, all
    /// or nothing.
    async fn save(
        &self,
        driver: Driver,
        location: Option<DriverLocationRecord>,
        outbox: StagedOutbox,
    ) -> Result<Vec<OutboxEvent>, DriverError>;
}

#[derive(Debug, Default)]
struct Tables {
    drivers: HashMap<DriverId, Driver>,
    history: HashMap<DriverId, Vec<DriverLocationRecord>>,
}

/// Drivers, their location history and the outbox they share a commit with.
#[derive(Debug)]
pub struct InMemoryDriverStore {
    tables: RwLock<Tables>,
    outbox: Arc<InMemoryOutboxStore>,
}

impl InMemoryDriverStore {
    pub fn new(outbox: Arc<InMemoryOutboxStore>) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            outbox,
        }
    }

    pub fn outbox(&self) -> &Arc<InMemoryOutboxStore> {
        &self.outbox
    }

    pub fn get(&self, id: DriverId) -> Result<Option<Driver>, DriverError> {
        Ok(self.read()?.drivers.get(&id).cloned())
    }

    pub fn find_by_license_number(&self, license_number: &str) -> Result<Option<Driver>, DriverError> {
        Ok(self
            .read()?
            .drivers
            .values()
            .find(|d| d.license_number == license_number)
            .cloned())
    }

    /// All drivers, newest first.
    pub fn list(&self) -> Result<Vec<Driver>, DriverError> {
        let mut drivers: Vec<Driver> = self.read()?.drivers.values().cloned().collect();
        drivers.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(drivers)
    }

    /// Position reports for `id`, most recent first, at most `limit`.
    pub fn location_history(&self, id: DriverId, limit: usize) -> Result<Vec<DriverLocationRecord>, DriverError> {
        Ok(self
            .read()?
            .history
            .get(&id)
            .map(|records| records.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    /// Open a unit of work. Nothing is visible until `commit`.
    pub fn begin(&self) -> DriverTransaction<'_> {
        DriverTransaction {
            store: self,
            writes: Vec::new(),
            history: Vec::new(),
            outbox: self.outbox.stage(),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, DriverError> {
        self.tables
            .read()
            .map_err(|_| DriverError::Storage("driver store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, DriverError> {
        self.tables
            .write()
            .map_err(|_| DriverError::Storage("driver store lock poisoned".to_string()))
    }
}

/// Unit of work over drivers, location history and outbox rows.
///
/// Dropping it without `commit` discards all three.
pub struct DriverTransaction<'a> {
    store: &'a InMemoryDriverStore,
    writes: Vec<Driver>,
    history: Vec<DriverLocationRecord>,
    outbox: StagedOutbox,
}

impl DriverTransaction<'_> {
    /// Stage an insert (version 1) or an update (stored version + 1).
    pub fn put(&mut self, driver: Driver) {
        self.writes.push(driver);
    }

    pub fn record_location(&mut self, record: DriverLocationRecord) {
        self.history.push(record);
    }

    pub fn outbox(&mut self) -> &mut StagedOutbox {
        &mut self.outbox
    }

    /// Apply every staged write, or none of them.
    pub fn commit(self) -> Result<Vec<OutboxEvent>, DriverError> {
        let mut tables = self.store.write()?;

        for write in &self.writes {
            let stored_version = tables.drivers.get(&write.id).map_or(0, |d| d.version);
            if write.version != stored_version + 1 {
                return Err(DriverError::Concurrency(write.id));
            }
            let taken = tables
                .drivers
                .values()
                .any(|d| d.id != write.id && d.license_number == write.license_number);
            if taken {
                return Err(DriverError::license_number_taken(&write.license_number));
            }
        }

        let rows = self.store.outbox.commit_staged(self.outbox)?;
        for write in self.writes {
            tables.drivers.insert(write.id, write);
        }
        for record in self.history {
            tables.history.entry(record.driver_id).or_default().push(record);
        }
        Ok(rows)
    }
}

#[async_trait]
impl DriverRepository for InMemoryDriverStore {
    async fn load(&self, id: DriverId) -> Result<Option<Driver>, DriverError> {
        self.get(id)
    }

    async fn load_by_license_number(&self, license_number: &str) -> Result<Option<Driver>, DriverError> {
        self.find_by_license_number(license_number)
    }

    async fn save(
        &self,
        driver: Driver,
        location: Option<DriverLocationRecord>,
        outbox: StagedOutbox,
    ) -> Result<Vec<OutboxEvent>, DriverError> {
        let mut tx = self.begin();
        tx.put(driver);
        if let Some(record) = location {
            tx.record_location(record);
        }
        tx.outbox().merge(outbox);
        tx.commit()
    }
}
