//! Shipment command handling.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument};

use logistics_outbox::{OutboxWriter, StagedOutbox, DEFAULT_EXCHANGE};

use crate::error::PlannerError;
use crate::shipment::{AssignShipment, CreateShipment, Shipment, ShipmentAssigned, ShipmentCreated};
use crate::store::{InMemoryShipmentStore, ShipmentRepository};

/// Runs shipment commands. Each command is one unit of work: the shipment
/// write and its outbox row commit together or not at all.
#[derive(Debug)]
pub struct ShipmentCommandHandler<R = InMemoryShipmentStore> {
    store: Arc<R>,
    exchange: String,
}

impl<R> Clone for ShipmentCommandHandler<R> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            exchange: self.exchange.clone(),
        }
    }
}

impl<R: ShipmentRepository> ShipmentCommandHandler<R> {
    pub fn new(store: Arc<R>) -> Self {
        Self {
            store,
            exchange: DEFAULT_EXCHANGE.to_string(),
        }
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    pub fn store(&self) -> &Arc<R> {
        &self.store
    }

    #[instrument(skip(self, cmd), fields(tracking_number = %cmd.tracking_number), err)]
    pub async fn create_shipment(&self, cmd: CreateShipment) -> Result<Shipment, PlannerError> {
        let shipment = Shipment::create(&cmd, Utc::now())?;

        if self
            .store
            .load_by_tracking_number(&shipment.tracking_number)
            .await?
            .is_some()
        {
            return Err(PlannerError::tracking_number_taken(&shipment.tracking_number));
        }

        let mut outbox = StagedOutbox::new();
        outbox
            .append_event(&ShipmentCreated::from(&shipment), &self.exchange)
            .await?;
        self.store.save(shipment.clone(), outbox).await?;

        info!(shipment_id = %shipment.id, tracking_number = %shipment.tracking_number, "shipment created");
        Ok(shipment)
    }

    #[instrument(skip(self), err)]
    pub async fn assign_shipment(&self, cmd: AssignShipment) -> Result<Shipment, PlannerError> {
        let mut shipment = self
            .store
            .load(cmd.shipment_id)
            .await?
            .ok_or_else(|| PlannerError::shipment_not_found(cmd.shipment_id))?;

        let now = Utc::now();
        shipment.assign(cmd.driver_id, now)?;

        let event = ShipmentAssigned {
            shipment_id: shipment.id,
            driver_id: cmd.driver_id,
            assigned_at: now,
        };
        let mut outbox = StagedOutbox::new();
        outbox.append_event(&event, &self.exchange).await?;
        self.store.save(shipment.clone(), outbox).await?;

        info!(shipment_id = %shipment.id, driver_id = %cmd.driver_id, "shipment assigned");
        Ok(shipment)
    }
}
