//! Postgres `ShipmentRepository`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;

use logistics_core::{DriverId, ShipmentId};
use logistics_outbox::{OutboxEvent, StagedOutbox};
use logistics_planner::{PlannerError, Shipment, ShipmentRepository};

use super::{storage_message, version_param, violated_unique_constraint};
use crate::outbox_store::PgOutboxWriter;

const COLUMNS: &str = "id, tracking_number, origin, destination, description, weight, volume, status, \
                       assigned_driver_id, estimated_delivery_date, created_at, updated_at, version";

const SCHEMA: [&str; 2] = [
    r#"
    CREATE TABLE IF NOT EXISTS shipments (
        id UUID PRIMARY KEY,
        tracking_number TEXT NOT NULL UNIQUE,
        origin TEXT NOT NULL,
        destination TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        weight DOUBLE PRECISION NOT NULL DEFAULT 0,
        volume DOUBLE PRECISION NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'pending',
        assigned_driver_id UUID,
        estimated_delivery_date TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        version BIGINT NOT NULL CHECK (version >= 1)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_shipments_status ON shipments (status)",
];

/// Shipments table plus the outbox rows committed with each write.
#[derive(Debug, Clone)]
pub struct PgShipmentRepository {
    pool: Arc<PgPool>,
}

impl PgShipmentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the `shipments` table if missing. The outbox table is migrated
    /// by `PostgresOutboxStore::migrate`.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), PlannerError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl ShipmentRepository for PgShipmentRepository {
    #[instrument(skip(self), fields(shipment_id = %id), err)]
    async fn load(&self, id: ShipmentId) -> Result<Option<Shipment>, PlannerError> {
        let sql = format!("SELECT {COLUMNS} FROM shipments WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(*id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_shipment", e))?;

        row.as_ref().map(decode_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn load_by_tracking_number(&self, tracking_number: &str) -> Result<Option<Shipment>, PlannerError> {
        let sql = format!("SELECT {COLUMNS} FROM shipments WHERE tracking_number = $1");
        let row = sqlx::query(&sql)
            .bind(tracking_number)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_shipment_by_tracking_number", e))?;

        row.as_ref().map(decode_row).transpose()
    }

    #[instrument(
        skip(self, shipment, outbox),
        fields(shipment_id = %shipment.id, version = shipment.version, rows = outbox.len()),
        err
    )]
    async fn save(&self, shipment: Shipment, outbox: StagedOutbox) -> Result<Vec<OutboxEvent>, PlannerError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let written = if shipment.version <= 1 {
            sqlx::query(
                r#"
                INSERT INTO shipments
                    (id, tracking_number, origin, destination, description, weight, volume, status,
                     assigned_driver_id, estimated_delivery_date, created_at, updated_at, version)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                "#,
            )
            .bind(*shipment.id.as_uuid())
            .bind(&shipment.tracking_number)
            .bind(&shipment.origin)
            .bind(&shipment.destination)
            .bind(&shipment.description)
            .bind(shipment.weight)
            .bind(shipment.volume)
            .bind(shipment.status.as_str())
            .bind(shipment.assigned_driver_id.map(|d| *d.as_uuid()))
            .bind(shipment.estimated_delivery_date)
            .bind(shipment.created_at)
            .bind(shipment.updated_at)
            .bind(version_param(shipment.version))
            .execute(&mut *tx)
            .await
        } else {
            sqlx::query(
                r#"
                UPDATE shipments
                SET tracking_number = $2, origin = $3, destination = $4, description = $5,
                    weight = $6, volume = $7, status = $8, assigned_driver_id = $9,
                    estimated_delivery_date = $10, updated_at = $11, version = $12
                WHERE id = $1 AND version = $13
                "#,
            )
            .bind(*shipment.id.as_uuid())
            .bind(&shipment.tracking_number)
            .bind(&shipment.origin)
            .bind(&shipment.destination)
            .bind(&shipment.description)
            .bind(shipment.weight)
            .bind(shipment.volume)
            .bind(shipment.status.as_str())
            .bind(shipment.assigned_driver_id.map(|d| *d.as_uuid()))
            .bind(shipment.estimated_delivery_date)
            .bind(shipment.updated_at)
            .bind(version_param(shipment.version))
            .bind(version_param(shipment.version - 1))
            .execute(&mut *tx)
            .await
        };

        let written = match written {
            Ok(result) => result.rows_affected(),
            Err(e) => return Err(map_write_error(&shipment, e)),
        };
        if written == 0 {
            return Err(PlannerError::Concurrency(shipment.id));
        }

        let mut writer = PgOutboxWriter::new(&mut tx);
        for row in outbox.events() {
            writer.insert(row).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_shipment", e))?;

        Ok(outbox.events().to_vec())
    }
}

/// A second insert of the same id lost a race; any other unique violation is
/// the tracking number.
fn map_write_error(shipment: &Shipment, err: sqlx::Error) -> PlannerError {
    match violated_unique_constraint(&err) {
        Some(constraint) if constraint.ends_with("_pkey") => PlannerError::Concurrency(shipment.id),
        Some(_) => PlannerError::tracking_number_taken(&shipment.tracking_number),
        None => map_sqlx_error("save_shipment", err),
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> PlannerError {
    PlannerError::Storage(storage_message(operation, &err))
}

// SQLx row types

#[derive(Debug)]
struct ShipmentRow {
    id: uuid::Uuid,
    tracking_number: String,
    origin: String,
    destination: String,
    description: String,
    weight: f64,
    volume: f64,
    status: String,
    assigned_driver_id: Option<uuid::Uuid>,
    estimated_delivery_date: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for ShipmentRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(ShipmentRow {
            id: row.try_get("id")?,
            tracking_number: row.try_get("tracking_number")?,
            origin: row.try_get("origin")?,
            destination: row.try_get("destination")?,
            description: row.try_get("description")?,
            weight: row.try_get("weight")?,
            volume: row.try_get("volume")?,
            status: row.try_get("status")?,
            assigned_driver_id: row.try_get("assigned_driver_id")?,
            estimated_delivery_date: row.try_get("estimated_delivery_date")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            version: row.try_get("version")?,
        })
    }
}

impl TryFrom<ShipmentRow> for Shipment {
    type Error = PlannerError;

    fn try_from(row: ShipmentRow) -> Result<Self, Self::Error> {
        Ok(Shipment {
            id: ShipmentId::from_uuid(row.id),
            tracking_number: row.tracking_number,
            origin: row.origin,
            destination: row.destination,
            description: row.description,
            weight: row.weight,
            volume: row.volume,
            status: row.status.parse()?,
            assigned_driver_id: row.assigned_driver_id.map(DriverId::from_uuid),
            estimated_delivery_date: row.estimated_delivery_date,
            created_at: row.created_at,
            updated_at: row.updated_at,
            version: u64::try_from(row.version).unwrap_or_default(),
        })
    }
}

fn decode_row(row: &sqlx::postgres::PgRow) -> Result<Shipment, PlannerError> {
    use sqlx::FromRow;

    ShipmentRow::from_row(row)
        .map_err(|e| PlannerError::Storage(format!("failed to decode shipment row: {}", e)))?
        .try_into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PostgresOutboxStore;
    use logistics_core::DomainError;
    use logistics_outbox::{NewOutboxEvent, OutboxStatus, OutboxStore, OutboxWriter};
    use logistics_planner::{AssignShipment, CreateShipment, ShipmentCommandHandler, ShipmentStatus};
    use serde_json::json;

    async fn stores() -> (PgShipmentRepository, PostgresOutboxStore) {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for postgres tests");
        let pool = PgPool::connect(&url).await.expect("connect to postgres");
        let outbox = PostgresOutboxStore::new(pool.clone());
        outbox.migrate().await.expect("migrate outbox schema");
        let shipments = PgShipmentRepository::new(pool);
        shipments.migrate().await.expect("migrate shipments schema");
        (shipments, outbox)
    }

    fn tracking_number() -> String {
        format!("TRK-{}", ShipmentId::new())
    }

    async fn staged(routing_key: &str) -> StagedOutbox {
        let mut outbox = StagedOutbox::new();
        outbox
            .append(NewOutboxEvent::new("ShipmentCreated", json!({}), routing_key, "logistics"))
            .await
            .unwrap();
        outbox
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn shipment_and_rows_commit_together() {
        let (shipments, outbox) = stores().await;
        let shipment = Shipment::create(&CreateShipment::new(tracking_number(), "Oslo", "Bergen"), Utc::now()).unwrap();

        let rows = shipments.save(shipment.clone(), staged("shipment.created").await).await.unwrap();

        assert_eq!(rows.len(), 1);
        let loaded = shipments.load(shipment.id).await.unwrap().unwrap();
        assert_eq!(loaded.tracking_number, shipment.tracking_number);
        assert_eq!(loaded.status, ShipmentStatus::Pending);
        assert_eq!(
            outbox.find_by_id(rows[0].id).await.unwrap().map(|e| e.status),
            Some(OutboxStatus::Pending)
        );
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn taken_tracking_number_writes_nothing() {
        let (shipments, outbox) = stores().await;
        let tracking = tracking_number();
        let first = Shipment::create(&CreateShipment::new(tracking.clone(), "A", "B"), Utc::now()).unwrap();
        shipments.save(first, StagedOutbox::new()).await.unwrap();

        let second = Shipment::create(&CreateShipment::new(tracking.clone(), "C", "D"), Utc::now()).unwrap();
        let staged = staged("shipment.created").await;
        let row_id = staged.events()[0].id;
        let err = shipments.save(second.clone(), staged).await.unwrap_err();

        assert_eq!(err, PlannerError::tracking_number_taken(&tracking));
        assert!(shipments.load(second.id).await.unwrap().is_none());
        assert!(outbox.find_by_id(row_id).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn stale_version_is_a_concurrency_error() {
        let (shipments, _) = stores().await;
        let shipment = Shipment::create(&CreateShipment::new(tracking_number(), "A", "B"), Utc::now()).unwrap();
        shipments.save(shipment.clone(), StagedOutbox::new()).await.unwrap();

        let mut first = shipment.clone();
        first.assign(DriverId::new(), Utc::now()).unwrap();
        let mut second = shipment.clone();
        second.assign(DriverId::new(), Utc::now()).unwrap();

        shipments.save(first.clone(), StagedOutbox::new()).await.unwrap();
        let err = shipments.save(second, StagedOutbox::new()).await.unwrap_err();

        assert_eq!(err, PlannerError::Concurrency(shipment.id));
        assert_eq!(
            shipments.load(shipment.id).await.unwrap().and_then(|s| s.assigned_driver_id),
            first.assigned_driver_id
        );

        let err = shipments.save(shipment.clone(), StagedOutbox::new()).await.unwrap_err();
        assert_eq!(err, PlannerError::Concurrency(shipment.id));
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn handler_runs_over_postgres() {
        let (shipments, outbox) = stores().await;
        let handler = ShipmentCommandHandler::new(Arc::new(shipments));

        let shipment = handler
            .create_shipment(CreateShipment::new(tracking_number(), "Turin", "Vienna"))
            .await
            .unwrap();
        let driver = DriverId::new();
        let assigned = handler
            .assign_shipment(AssignShipment { shipment_id: shipment.id, driver_id: driver })
            .await
            .unwrap();
        assert_eq!(assigned.version, 2);

        let missing = ShipmentId::new();
        let err = handler
            .assign_shipment(AssignShipment { shipment_id: missing, driver_id: driver })
            .await
            .unwrap_err();
        assert!(matches!(err, PlannerError::Domain(DomainError::NotFound(_))));

        let pending = outbox.find_pending().await.unwrap();
        let ours: Vec<_> = pending
            .iter()
            .filter(|e| e.event_data["shipmentId"] == json!(shipment.id.to_string()))
            .map(|e| e.routing_key.as_str())
            .collect();
        assert_eq!(ours, ["shipment.created", "shipment.assigned"]);
    }
}
