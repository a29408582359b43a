//! Shipment planning service: shipments, their commands and the events they
//! emit through the transactional outbox.

pub mod error;
pub mod handler;
pub mod shipment;
pub mod store;

pub use error::PlannerError;
pub use handler::ShipmentCommandHandler;
pub use shipment::{
    AssignShipment, CreateShipment, Shipment, ShipmentAssigned, ShipmentCreated, ShipmentStatus,
};
pub use store::{InMemoryShipmentStore, ShipmentRepository, ShipmentTransaction};
