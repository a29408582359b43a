//! Shipment persistence: the repository seam and its in-memory store.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use logistics_core::ShipmentId;
use logistics_outbox::{InMemoryOutboxStore, OutboxEvent, StagedOutbox};

use crate::error::PlannerError;
use crate::shipment::Shipment;

/// Shipment storage that commits a shipment write together with its outbox
/// rows.
#[async_trait]
pub trait ShipmentRepository: Send + Sync {
    async fn load(&self, id: ShipmentId) -> Result<Option<Shipment>, PlannerError>;

    async fn load_by_tracking_number(&self, tracking_number: &str) -> Result<Option<Shipment>, PlannerError>;

    /// Insert (version 1) or update (stored version + 1) `shipment` and the
    /// rows staged in `outbox`, in one unit of work.
    ///
    /// Fails with a conflict when another shipment uses the tracking number,
    /// and with `Concurrency` when `shipment` was based on a stale version.
    /// Nothing is written on failure.
    async fn save(&self, shipment: Shipment, outbox: StagedOutbox) -> Result<Vec<OutboxEvent>, PlannerError>;
}

/// Shipments plus the outbox they share a commit with.
#[derive(Debug)]
pub struct InMemoryShipmentStore {
    shipments: RwLock<HashMap<ShipmentId, Shipment>>,
    outbox: Arc<InMemoryOutboxStore>,
}

impl InMemoryShipmentStore {
    pub fn new(outbox: Arc<InMemoryOutboxStore>) -> Self {
        Self {
            shipments: RwLock::new(HashMap::new()),
            outbox,
        }
    }

    pub fn outbox(&self) -> &Arc<InMemoryOutboxStore> {
        &self.outbox
    }

    pub fn get(&self, id: ShipmentId) -> Result<Option<Shipment>, PlannerError> {
        Ok(self.read()?.get(&id).cloned())
    }

    pub fn find_by_tracking_number(&self, tracking_number: &str) -> Result<Option<Shipment>, PlannerError> {
        Ok(self
            .read()?
            .values()
            .find(|s| s.tracking_number == tracking_number)
            .cloned())
    }

    /// All shipments, newest first.
    pub fn list(&self) -> Result<Vec<Shipment>, PlannerError> {
        let mut shipments: Vec<Shipment> = self.read()?.values().cloned().collect();
        shipments.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(shipments)
    }

    /// Open a unit of work. Nothing is visible until `commit`.
    pub fn begin(&self) -> ShipmentTransaction<'_> {
        ShipmentTransaction {
            store: self,
            writes: Vec::new(),
            outbox: self.outbox.stage(),
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<ShipmentId, Shipment>>, PlannerError> {
        self.shipments
            .read()
            .map_err(|_| PlannerError::Storage("shipment store lock poisoned".to_string()))
    }
}

/// Unit of work over shipments and outbox rows.
///
/// Dropping it without `commit` discards both.
pub struct ShipmentTransaction<'a> {
    store: &'a InMemoryShipmentStore,
    writes: Vec<Shipment>,
    outbox: StagedOutbox,
}

impl ShipmentTransaction<'_> {
    /// Stage an insert (version 1) or an update (stored version + 1).
    pub fn put(&mut self, shipment: Shipment) {
        self.writes.push(shipment);
    }

    /// Outbox writer bound to this unit of work.
    pub fn outbox(&mut self) -> &mut StagedOutbox {
        &mut self.outbox
    }

    /// Apply every staged write, or none of them.
    ///
    /// Fails with a conflict when another shipment already uses a staged
    /// tracking number, and with `Concurrency` when a staged update was based
    /// on a stale version.
    pub fn commit(self) -> Result<Vec<OutboxEvent>, PlannerError> {
        let mut shipments = self
            .store
            .shipments
            .write()
            .map_err(|_| PlannerError::Storage("shipment store lock poisoned".to_string()))?;

        for write in &self.writes {
            let stored_version = shipments.get(&write.id).map_or(0, |s| s.version);
            if write.version != stored_version + 1 {
                return Err(PlannerError::Concurrency(write.id));
            }
            let taken = shipments
                .values()
                .any(|s| s.id != write.id && s.tracking_number == write.tracking_number);
            if taken {
                return Err(PlannerError::tracking_number_taken(&write.tracking_number));
            }
        }

        let rows = self.store.outbox.commit_staged(self.outbox)?;
        for write in self.writes {
            shipments.insert(write.id, write);
        }
        Ok(rows)
    }
}

#[async_trait]
impl ShipmentRepository for InMemoryShipmentStore {
    async fn load(&self, id: ShipmentId) -> Result<Option<Shipment>, PlannerError> {
        self.get(id)
    }

    async fn load_by_tracking_number(&self, tracking_number: &str) -> Result<Option<Shipment>, PlannerError> {
        self.find_by_tracking_number(tracking_number)
    }

    async fn save(&self, shipment: Shipment, outbox: StagedOutbox) -> Result<Vec<OutboxEvent>, PlannerError> {
        let mut tx = self.begin();
        tx.put(shipment);
        tx.outbox().merge(outbox);
        tx.commit()
    }
}
