//! Driver command handling.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument};

use logistics_outbox::{OutboxWriter, StagedOutbox, DEFAULT_EXCHANGE};

use crate::driver::{CreateDriver, Driver, DriverCreated, DriverLocationUpdated, UpdateDriverLocation};
use crate::error::DriverError;
use crate::store::{DriverLocationRecord, DriverRepository, InMemoryDriverStore};

/// Runs driver commands, one unit of work per command.
#[derive(Debug)]
pub struct DriverCommandHandler<R = InMemoryDriverStore> {
    store: Arc<R>,
    exchange: String,
}

impl<R> Clone for DriverCommandHandler<R> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            exchange: self.exchange.clone(),
        }
    }
}

impl<R: DriverRepository> DriverCommandHandler<R> {
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

    #[instrument(skip(self, cmd), fields(license_number = %cmd.license_number), err)]
    pub async fn create_driver(&self, cmd: CreateDriver) -> Result<Driver, DriverError> {
        let driver = Driver::register(&cmd, Utc::now())?;

        if self
            .store
            .load_by_license_number(&driver.license_number)
            .await?
            .is_some()
        {
            return Err(DriverError::license_number_taken(&driver.license_number));
        }

        let mut outbox = StagedOutbox::new();
        outbox
            .append_event(&DriverCreated::from(&driver), &self.exchange)
            .await?;
        self.store.save(driver.clone(), None, outbox).await?;

        info!(driver_id = %driver.id, "driver created");
        Ok(driver)
    }

    #[instrument(skip(self, cmd), fields(driver_id = %cmd.driver_id), err)]
    pub async fn update_location(&self, cmd: UpdateDriverLocation) -> Result<Driver, DriverError> {
        let location = cmd.location()?;
        let mut driver = self
            .store
            .load(cmd.driver_id)
            .await?
            .ok_or_else(|| DriverError::driver_not_found(cmd.driver_id))?;

        let now = Utc::now();
        driver.move_to(location.clone(), now);

        let event = DriverLocationUpdated {
            driver_id: driver.id,
            latitude: location.latitude,
            longitude: location.longitude,
            address: location.address.clone(),
            timestamp: now,
        };
        let record = DriverLocationRecord {
            driver_id: driver.id,
            location,
            recorded_at: now,
        };
        let mut outbox = StagedOutbox::new();
        outbox.append_event(&event, &self.exchange).await?;
        self.store.save(driver.clone(), Some(record), outbox).await?;

        debug!(driver_id = %driver.id, latitude = event.latitude, longitude = event.longitude, "driver location updated");
        Ok(driver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logistics_core::{DomainError, DriverId};
    use logistics_outbox::{InMemoryOutboxStore, OutboxStore};

    fn handler() -> DriverCommandHandler {
        let store = Arc::new(InMemoryDriverStore::new(InMemoryOutboxStore::arc()));
        DriverCommandHandler::new(store)
    }

    #[tokio::test]
    async fn create_writes_driver_and_outbox_row() {
        let handler = handler();
        let driver = handler
            .create_driver(CreateDriver::new("Ana Silva", "DL-100"))
            .await
            .unwrap();

        let rows = handler.store().outbox().find_pending().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event_type, "DriverCreated");
        assert_eq!(rows[0].routing_key, "driver.created");
        assert_eq!(rows[0].event_data["driverId"], driver.id.to_string());
        assert_eq!(rows[0].event_data["name"], "Ana Silva");
    }

    #[tokio::test]
    async fn duplicate_license_writes_nothing() {
        let handler = handler();
        handler.create_driver(CreateDriver::new("Ana", "DL-1")).await.unwrap();

        let err = handler
            .create_driver(CreateDriver::new("Bo", "DL-1"))
            .await
            .unwrap_err();

        assert_eq!(err, DriverError::license_number_taken("DL-1"));
        assert!(matches!(err, DriverError::Domain(DomainError::Conflict(_))));
        assert_eq!(handler.store().outbox().len(), 1);
    }

    #[tokio::test]
    async fn location_update_emits_event_and_records_history() {
        let handler = handler();
        let driver = handler.create_driver(CreateDriver::new("Ana", "DL-2")).await.unwrap();

        let updated = handler
            .update_location(UpdateDriverLocation::new(driver.id, 52.37, 4.89).with_address("Dam 1"))
            .await
            .unwrap();
        assert!(updated.last_active_at.is_some());

        let rows = handler
            .store()
            .outbox()
            .find_by_event_type("DriverLocationUpdated")
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].routing_key, "driver.location.updated");
        assert_eq!(rows[0].event_data["latitude"], 52.37);
        assert_eq!(rows[0].event_data["address"], "Dam 1");
        assert!(rows[0].event_data.get("timestamp").is_some());

        let history = handler.store().location_history(driver.id, 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].location.longitude, 4.89);
    }

    #[tokio::test]
    async fn out_of_range_location_writes_nothing() {
        let handler = handler();
        let driver = handler.create_driver(CreateDriver::new("Ana", "DL-3")).await.unwrap();

        let err = handler
            .update_location(UpdateDriverLocation::new(driver.id, 95.0, 0.0))
            .await
            .unwrap_err();

        assert!(matches!(err, DriverError::Domain(DomainError::Validation(_))));
        assert_eq!(handler.store().outbox().len(), 1);
        assert!(handler.store().location_history(driver.id, 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_driver_location_update() {
        let handler = handler();
        let id = DriverId::new();
        let err = handler
            .update_location(UpdateDriverLocation::new(id, 0.0, 0.0))
            .await
            .unwrap_err();
        assert_eq!(err, DriverError::driver_not_found(id));
        assert!(matches!(err, DriverError::Domain(DomainError::NotFound(_))));
    }
}
