use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use logistics_core::{DomainError, DomainEvent, DomainResult, DriverId, ShipmentId};

/// Shipment lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ShipmentStatus {
    #[default]
    Pending,
    Assigned,
    InTransit,
    Delivered,
    Cancelled,
}

impl ShipmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShipmentStatus::Pending => "pending",
            ShipmentStatus::Assigned => "assigned",
            ShipmentStatus::InTransit => "in_transit",
            ShipmentStatus::Delivered => "delivered",
            ShipmentStatus::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for ShipmentStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for ShipmentStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ShipmentStatus::Pending),
            "assigned" => Ok(ShipmentStatus::Assigned),
            "in_transit" => Ok(ShipmentStatus::InTransit),
            "delivered" => Ok(ShipmentStatus::Delivered),
            "cancelled" => Ok(ShipmentStatus::Cancelled),
            other => Err(DomainError::validation(format!("unknown shipment status '{other}'"))),
        }
    }
}

/// A consignment moving from `origin` to `destination`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shipment {
    pub id: ShipmentId,
    pub tracking_number: String,
    pub origin: String,
    pub destination: String,
    pub description: String,
    /// Kilograms
    pub weight: f64,
    /// Cubic metres
    pub volume: f64,
    pub status: ShipmentStatus,
    pub assigned_driver_id: Option<DriverId>,
    pub estimated_delivery_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// +1 per committed change; guards against lost updates
    pub version: u64,
}

impl Shipment {
    /// Validate `cmd` and build a PENDING shipment.
    pub fn create(cmd: &CreateShipment, now: DateTime<Utc>) -> DomainResult<Self> {
        cmd.validate()?;

        Ok(Self {
            id: ShipmentId::new(),
            tracking_number: cmd.tracking_number.trim().to_string(),
            origin: cmd.origin.trim().to_string(),
            destination: cmd.destination.trim().to_string(),
            description: cmd.description.clone().unwrap_or_default(),
            weight: cmd.weight,
            volume: cmd.volume,
            status: ShipmentStatus::Pending,
            assigned_driver_id: None,
            estimated_delivery_date: cmd.estimated_delivery_date,
            created_at: now,
            updated_at: now,
            version: 1,
        })
    }

    /// PENDING → ASSIGNED.
    pub fn assign(&mut self, driver_id: DriverId, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status != ShipmentStatus::Pending {
            return Err(DomainError::invariant(format!(
                "shipment {} is {}, only pending shipments can be assigned",
                self.tracking_number, self.status
            )));
        }
        self.status = ShipmentStatus::Assigned;
        self.assigned_driver_id = Some(driver_id);
        self.updated_at = now.max(self.updated_at);
        self.version += 1;
        Ok(())
    }
}

/// Command: CreateShipment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateShipment {
    pub tracking_number: String,
    pub origin: String,
    pub destination: String,
    pub description: Option<String>,
    pub weight: f64,
    pub volume: f64,
    pub estimated_delivery_date: Option<DateTime<Utc>>,
}

impl CreateShipment {
    pub fn new(
        tracking_number: impl Into<String>,
        origin: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            tracking_number: tracking_number.into(),
            origin: origin.into(),
            destination: destination.into(),
            description: None,
            weight: 0.0,
            volume: 0.0,
            estimated_delivery_date: None,
        }
    }

    pub fn with_load(mut self, weight: f64, volume: f64) -> Self {
        self.weight = weight;
        self.volume = volume;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    fn validate(&self) -> DomainResult<()> {
        if self.tracking_number.trim().is_empty() {
            return Err(DomainError::validation("tracking number cannot be empty"));
        }
        if self.origin.trim().is_empty() {
            return Err(DomainError::validation("origin cannot be empty"));
        }
        if self.destination.trim().is_empty() {
            return Err(DomainError::validation("destination cannot be empty"));
        }
        if !self.weight.is_finite() || self.weight < 0.0 {
            return Err(DomainError::validation("weight must be a non-negative number"));
        }
        if !self.volume.is_finite() || self.volume < 0.0 {
            return Err(DomainError::validation("volume must be a non-negative number"));
        }
        Ok(())
    }
}

/// Command: AssignShipment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignShipment {
    pub shipment_id: ShipmentId,
    pub driver_id: DriverId,
}

/// Event: ShipmentCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShipmentCreated {
    pub shipment_id: ShipmentId,
    pub tracking_number: String,
    pub origin: String,
    pub destination: String,
    pub created_at: DateTime<Utc>,
}

impl From<&Shipment> for ShipmentCreated {
    fn from(shipment: &Shipment) -> Self {
        Self {
            shipment_id: shipment.id,
            tracking_number: shipment.tracking_number.clone(),
            origin: shipment.origin.clone(),
            destination: shipment.destination.clone(),
            created_at: shipment.created_at,
        }
    }
}

impl DomainEvent for ShipmentCreated {
    fn event_type(&self) -> &'static str {
        "ShipmentCreated"
    }

    fn routing_key(&self) -> &'static str {
        "shipment.created"
    }
}

/// Event: ShipmentAssigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShipmentAssigned {
    pub shipment_id: ShipmentId,
    pub driver_id: DriverId,
    pub assigned_at: DateTime<Utc>,
}

impl DomainEvent for ShipmentAssigned {
    fn event_type(&self) -> &'static str {
        "ShipmentAssigned"
    }

    fn routing_key(&self) -> &'static str {
        "shipment.assigned"
    }
}
