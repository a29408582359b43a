//! Postgres repositories for the planner and driver services.
//!
//! Each `save` opens one transaction for the aggregate row and its outbox
//! rows (inserted through `PgOutboxWriter`), so both commit or neither does.
//! Optimistic concurrency is a conditional `UPDATE ... WHERE version = $n`.

pub mod drivers;
pub mod shipments;

pub use drivers::PgDriverRepository;
pub use shipments::PgShipmentRepository;

/// Name of the unique constraint `err` violated, if it is a unique violation.
pub(crate) fn violated_unique_constraint(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db_err) if crate::outbox_store::postgres::is_unique_violation(err) => {
            Some(db_err.constraint().unwrap_or_default().to_string())
        }
        _ => None,
    }
}

pub(crate) fn version_param(version: u64) -> i64 {
    i64::try_from(version).unwrap_or(i64::MAX)
}

pub(crate) fn storage_message(operation: &str, err: &sqlx::Error) -> String {
    match err {
        sqlx::Error::Database(db_err) => format!("database error in {}: {}", operation, db_err.message()),
        sqlx::Error::PoolClosed => format!("connection pool closed in {}", operation),
        other => format!("sqlx error in {}: {}", operation, other),
    }
}
