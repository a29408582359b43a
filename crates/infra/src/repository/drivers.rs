//! Postgres `DriverRepository` with location history.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;

use logistics_core::DriverId;
use logistics_driver::{Driver, DriverError, DriverLocationRecord, DriverRepository, Location};
use logistics_outbox::{OutboxEvent, StagedOutbox};

use super::{storage_message, version_param, violated_unique_constraint};
use crate::outbox_store::PgOutboxWriter;

const COLUMNS: &str = "id, name, license_number, phone_number, status, latitude, longitude, address, \
                       last_active_at, created_at, updated_at, version";

const SCHEMA: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS drivers (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        license_number TEXT NOT NULL UNIQUE,
        phone_number TEXT,
        status TEXT NOT NULL DEFAULT 'available',
        latitude DOUBLE PRECISION,
        longitude DOUBLE PRECISION,
        address TEXT,
        last_active_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        version BIGINT NOT NULL CHECK (version >= 1)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS driver_locations (
        id BIGSERIAL PRIMARY KEY,
        driver_id UUID NOT NULL REFERENCES drivers (id) ON DELETE CASCADE,
        latitude DOUBLE PRECISION NOT NULL,
        longitude DOUBLE PRECISION NOT NULL,
        address TEXT,
        recorded_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_driver_locations_driver_recorded_at ON driver_locations (driver_id, recorded_at DESC)",
];

#[derive(Debug, Clone)]
pub struct PgDriverRepository {
    pool: Arc<PgPool>,
}

impl PgDriverRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the `drivers` and `driver_locations` tables if missing.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), DriverError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }

    /// Position reports for `id`, most recent first, at most `limit`.
    #[instrument(skip(self), fields(driver_id = %id), err)]
    pub async fn location_history(&self, id: DriverId, limit: usize) -> Result<Vec<DriverLocationRecord>, DriverError> {
        let rows = sqlx::query(
            r#"
            SELECT driver_id, latitude, longitude, address, recorded_at
            FROM driver_locations
            WHERE driver_id = $1
            ORDER BY recorded_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(*id.as_uuid())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("location_history", e))?;

        rows.iter()
            .map(|row| {
                decode_location(row)
                    .map_err(|e| DriverError::Storage(format!("failed to decode location row: {}", e)))
            })
            .collect()
    }
}

#[async_trait]
impl DriverRepository for PgDriverRepository {
    #[instrument(skip(self), fields(driver_id = %id), err)]
    async fn load(&self, id: DriverId) -> Result<Option<Driver>, DriverError> {
        let sql = format!("SELECT {COLUMNS} FROM drivers WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(*id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_driver", e))?;

        row.as_ref().map(decode_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn load_by_license_number(&self, license_number: &str) -> Result<Option<Driver>, DriverError> {
        let sql = format!("SELECT {COLUMNS} FROM drivers WHERE license_number = $1");
        let row = sqlx::query(&sql)
            .bind(license_number)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_driver_by_license_number", e))?;

        row.as_ref().map(decode_row).transpose()
    }

    #[instrument(
        skip(self, driver, location, outbox),
        fields(driver_id = %driver.id, version = driver.version, rows = outbox.len()),
        err
    )]
    async fn save(
        &self,
        driver: Driver,
        location: Option<DriverLocationRecord>,
        outbox: StagedOutbox,
    ) -> Result<Vec<OutboxEvent>, DriverError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let position = driver.location.as_ref();
        let written = if driver.version <= 1 {
            sqlx::query(
                r#"
                INSERT INTO drivers
                    (id, name, license_number, phone_number, status, latitude, longitude, address,
                     last_active_at, created_at, updated_at, version)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                "#,
            )
            .bind(*driver.id.as_uuid())
            .bind(&driver.name)
            .bind(&driver.license_number)
            .bind(driver.phone_number.as_deref())
            .bind(driver.status.as_str())
            .bind(position.map(|l| l.latitude))
            .bind(position.map(|l| l.longitude))
            .bind(position.and_then(|l| l.address.as_deref()))
            .bind(driver.last_active_at)
            .bind(driver.created_at)
            .bind(driver.updated_at)
            .bind(version_param(driver.version))
            .execute(&mut *tx)
            .await
        } else {
            sqlx::query(
                r#"
                UPDATE drivers
                SET name = $2, license_number = $3, phone_number = $4, status = $5,
                    latitude = $6, longitude = $7, address = $8, last_active_at = $9,
                    updated_at = $10, version = $11
                WHERE id = $1 AND version = $12
                "#,
            )
            .bind(*driver.id.as_uuid())
            .bind(&driver.name)
            .bind(&driver.license_number)
            .bind(driver.phone_number.as_deref())
            .bind(driver.status.as_str())
            .bind(position.map(|l| l.latitude))
            .bind(position.map(|l| l.longitude))
            .bind(position.and_then(|l| l.address.as_deref()))
            .bind(driver.last_active_at)
            .bind(driver.updated_at)
            .bind(version_param(driver.version))
            .bind(version_param(driver.version - 1))
            .execute(&mut *tx)
            .await
        };

        let written = match written {
            Ok(result) => result.rows_affected(),
            Err(e) => return Err(map_write_error(&driver, e)),
        };
        if written == 0 {
            return Err(DriverError::Concurrency(driver.id));
        }

        if let Some(record) = &location {
            sqlx::query(
                r#"
                INSERT INTO driver_locations (driver_id, latitude, longitude, address, recorded_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(*record.driver_id.as_uuid())
            .bind(record.location.latitude)
            .bind(record.location.longitude)
            .bind(record.location.address.as_deref())
            .bind(record.recorded_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("record_location", e))?;
        }

        let mut writer = PgOutboxWriter::new(&mut tx);
        for row in outbox.events() {
            writer.insert(row).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_driver", e))?;

        Ok(outbox.events().to_vec())
    }
}

fn map_write_error(driver: &Driver, err: sqlx::Error) -> DriverError {
    match violated_unique_constraint(&err) {
        Some(constraint) if constraint.ends_with("_pkey") => DriverError::Concurrency(driver.id),
        Some(_) => DriverError::license_number_taken(&driver.license_number),
        None => map_sqlx_error("save_driver", err),
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> DriverError {
    DriverError::Storage(storage_message(operation, &err))
}

// SQLx row types

#[derive(Debug)]
struct DriverRow {
    id: uuid::Uuid,
    name: String,
    license_number: String,
    phone_number: Option<String>,
    status: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
    address: Option<String>,
    last_active_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for DriverRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(DriverRow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            license_number: row.try_get("license_number")?,
            phone_number: row.try_get("phone_number")?,
            status: row.try_get("status")?,
            latitude: row.try_get("latitude")?,
            longitude: row.try_get("longitude")?,
            address: row.try_get("address")?,
            last_active_at: row.try_get("last_active_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            version: row.try_get("version")?,
        })
    }
}

impl TryFrom<DriverRow> for Driver {
    type Error = DriverError;

    fn try_from(row: DriverRow) -> Result<Self, Self::Error> {
        let location = match (row.latitude, row.longitude) {
            (Some(latitude), Some(longitude)) => Some(Location {
                latitude,
                longitude,
                address: row.address,
            }),
            _ => None,
        };

        Ok(Driver {
            id: DriverId::from_uuid(row.id),
            name: row.name,
            license_number: row.license_number,
            phone_number: row.phone_number,
            status: row.status.parse()?,
            location,
            last_active_at: row.last_active_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            version: u64::try_from(row.version).unwrap_or_default(),
        })
    }
}

fn decode_location(row: &sqlx::postgres::PgRow) -> Result<DriverLocationRecord, sqlx::Error> {
    Ok(DriverLocationRecord {
        driver_id: DriverId::from_uuid(row.try_get("driver_id")?),
        location: Location {
            latitude: row.try_get("latitude")?,
            longitude: row.try_get("longitude")?,
            address: row.try_get("address")?,
        },
        recorded_at: row.try_get("recorded_at")?,
    })
}

fn decode_row(row: &sqlx::postgres::PgRow) -> Result<Driver, DriverError> {
    use sqlx::FromRow;

    DriverRow::from_row(row)
        .map_err(|e| DriverError::Storage(format!("failed to decode driver row: {}", e)))?
        .try_into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PostgresOutboxStore;
    use logistics_core::DomainError;
    use logistics_driver::{CreateDriver, DriverCommandHandler, UpdateDriverLocation};
    use logistics_outbox::OutboxStore;
    use serde_json::json;

    async fn stores() -> (PgDriverRepository, PostgresOutboxStore) {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for postgres tests");
        let pool = PgPool::connect(&url).await.expect("connect to postgres");
        let outbox = PostgresOutboxStore::new(pool.clone());
        outbox.migrate().await.expect("migrate outbox schema");
        let drivers = PgDriverRepository::new(pool);
        drivers.migrate().await.expect("migrate drivers schema");
        (drivers, outbox)
    }

    fn license_number() -> String {
        format!("DL-{}", DriverId::new())
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn taken_license_number_is_a_conflict() {
        let (drivers, _) = stores().await;
        let license = license_number();
        let first = Driver::register(&CreateDriver::new("Ana", license.clone()), Utc::now()).unwrap();
        drivers.save(first, None, StagedOutbox::new()).await.unwrap();

        let second = Driver::register(&CreateDriver::new("Bo", license.clone()), Utc::now()).unwrap();
        let err = drivers.save(second.clone(), None, StagedOutbox::new()).await.unwrap_err();

        assert_eq!(err, DriverError::license_number_taken(&license));
        assert!(drivers.load(second.id).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn stale_update_keeps_no_history() {
        let (drivers, _) = stores().await;
        let driver = Driver::register(&CreateDriver::new("Ana", license_number()), Utc::now()).unwrap();
        drivers.save(driver.clone(), None, StagedOutbox::new()).await.unwrap();

        let record = DriverLocationRecord {
            driver_id: driver.id,
            location: Location::new(1.0, 1.0).unwrap(),
            recorded_at: Utc::now(),
        };
        let err = drivers
            .save(driver.clone(), Some(record), StagedOutbox::new())
            .await
            .unwrap_err();

        assert_eq!(err, DriverError::Concurrency(driver.id));
        assert!(drivers.location_history(driver.id, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn handler_runs_over_postgres() {
        let (drivers, outbox) = stores().await;
        let handler = DriverCommandHandler::new(Arc::new(drivers.clone()));

        let driver = handler
            .create_driver(CreateDriver::new("Ana", license_number()))
            .await
            .unwrap();
        for lat in [10.0, 11.0, 12.0] {
            handler
                .update_location(UpdateDriverLocation::new(driver.id, lat, 5.0).with_address("Depot"))
                .await
                .unwrap();
        }

        let loaded = drivers.load(driver.id).await.unwrap().unwrap();
        assert_eq!(loaded.version, 4);
        assert_eq!(loaded.location.map(|l| l.latitude), Some(12.0));

        let lats: Vec<f64> = drivers
            .location_history(driver.id, 2)
            .await
            .unwrap()
            .iter()
            .map(|r| r.location.latitude)
            .collect();
        assert_eq!(lats, vec![12.0, 11.0]);

        let err = handler
            .update_location(UpdateDriverLocation::new(DriverId::new(), 1.0, 1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Domain(DomainError::NotFound(_))));

        let rows = outbox
            .find_pending()
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.event_data["driverId"] == json!(driver.id.to_string()))
            .count();
        assert_eq!(rows, 4);
    }
}
