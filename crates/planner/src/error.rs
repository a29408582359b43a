use logistics_core::{DomainError, ShipmentId};
use logistics_outbox::OutboxStoreError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlannerError {
    /// Validation, state-transition, uniqueness and lookup failures
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// The shipment changed between load and commit.
    #[error("concurrent update of shipment {0}")]
    Concurrency(ShipmentId),

    #[error("outbox error: {0}")]
    Outbox(#[from] OutboxStoreError),

    #[error("storage error: {0}")]
    Storage(String),
}

impl PlannerError {
    pub fn tracking_number_taken(tracking_number: &str) -> Self {
        DomainError::conflict(format!("tracking number already in use: {tracking_number}")).into()
    }

    pub fn shipment_not_found(id: ShipmentId) -> Self {
        DomainError::not_found(format!("shipment {id}")).into()
    }
}
