use logistics_core::{DomainError, DriverId};
use logistics_outbox::OutboxStoreError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DriverError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("concurrent update of driver {0}")]
    Concurrency(DriverId),

    #[error("outbox error: {0}")]
    Outbox(#[from] OutboxStoreError),

    #[error("storage error: {0}")]
    Storage(String),
}

impl DriverError {
    pub fn license_number_taken(license_number: &str) -> Self {
        DomainError::conflict(format!("license number already registered: {license_number}")).into()
    }

    pub fn driver_not_found(id: DriverId) -> Self {
        DomainError::not_found(format!("driver {id}")).into()
    }
}
