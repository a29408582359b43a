//! Infrastructure layer: Postgres outbox store and repositories, Redis
//! broker, relay config.

pub mod broker;
pub mod config;
pub mod outbox_store;
pub mod repository;

pub use config::{ConfigError, RelayConfig};
pub use outbox_store::{PgOutboxWriter, PostgresOutboxStore};
pub use repository::{PgDriverRepository, PgShipmentRepository};

#[cfg(feature = "redis")]
pub use broker::RedisStreamsBroker;
