//! Durable outbox store implementations.

pub mod postgres;

pub use postgres::{PgOutboxWriter, PostgresOutboxStore};
