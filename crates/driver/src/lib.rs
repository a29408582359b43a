//! Driver tracking service: drivers, their live location and the events
//! emitted through the transactional outbox.

pub mod driver;
pub mod error;
pub mod handler;
pub mod store;

pub use driver::{
    CreateDriver, Driver, DriverCreated, DriverLocationUpdated, DriverStatus, Location,
    UpdateDriverLocation,
};
pub use error::DriverError;
pub use handler::DriverCommandHandler;
pub use store::{DriverLocationRecord, DriverRepository, DriverTransaction, InMemoryDriverStore};
