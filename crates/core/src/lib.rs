//! Shared building blocks for the logistics services.
//!
//! Pure domain primitives: identifiers, the domain error model and the
//! `DomainEvent` contract every emitted event implements. No IO lives here.

pub mod error;
pub mod event;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use event::DomainEvent;
pub use id::{DriverId, OutboxEventId, ShipmentId};
