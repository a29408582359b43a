use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use logistics_core::{DomainError, DomainEvent, DomainResult, DriverId};

/// Driver availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DriverStatus {
    #[default]
    Available,
    Busy,
    Offline,
    OnDelivery,
}

impl DriverStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverStatus::Available => "available",
            DriverStatus::Busy => "busy",
            DriverStatus::Offline => "offline",
            DriverStatus::OnDelivery => "on_delivery",
        }
    }
}

impl core::fmt::Display for DriverStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for DriverStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(DriverStatus::Available),
            "busy" => Ok(DriverStatus::Busy),
            "offline" => Ok(DriverStatus::Offline),
            "on_delivery" => Ok(DriverStatus::OnDelivery),
            other => Err(DomainError::validation(format!("unknown driver status '{other}'"))),
        }
    }
}

/// WGS84 position with an optional street address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub address: Option<String>,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64) -> DomainResult<Self> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(DomainError::validation(format!(
                "latitude must be between -90 and 90, got {latitude}"
            )));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(DomainError::validation(format!(
                "longitude must be between -180 and 180, got {longitude}"
            )));
        }
        Ok(Self {
            latitude,
            longitude,
            address: None,
        })
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        let address = address.into();
        let trimmed = address.trim();
        self.address = (!trimmed.is_empty()).then(|| trimmed.to_string());
        self
    }
}

/// A registered driver and their last known position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Driver {
    pub id: DriverId,
    pub name: String,
    pub license_number: String,
    pub phone_number: Option<String>,
    pub status: DriverStatus,
    pub location: Option<Location>,
    pub last_active_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl Driver {
    /// Validate `cmd` and build an AVAILABLE driver with no location.
    pub fn register(cmd: &CreateDriver, now: DateTime<Utc>) -> DomainResult<Self> {
        let name = cmd.name.trim();
        if name.is_empty() {
            return Err(DomainError::validation("driver name cannot be empty"));
        }
        let license_number = cmd.license_number.trim();
        if license_number.is_empty() {
            return Err(DomainError::validation("license number cannot be empty"));
        }

        Ok(Self {
            id: DriverId::new(),
            name: name.to_string(),
            license_number: license_number.to_string(),
            phone_number: cmd
                .phone_number
                .as_deref()
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string),
            status: DriverStatus::Available,
            location: None,
            last_active_at: None,
            created_at: now,
            updated_at: now,
            version: 1,
        })
    }

    /// Record a position report. Marks the driver active at `now`.
    pub fn move_to(&mut self, location: Location, now: DateTime<Utc>) {
        self.location = Some(location);
        self.last_active_at = Some(now);
        self.updated_at = now.max(self.updated_at);
        self.version += 1;
    }
}

/// Command: CreateDriver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateDriver {
    pub name: String,
    pub license_number: String,
    pub phone_number: Option<String>,
}

impl CreateDriver {
    pub fn new(name: impl Into<String>, license_number: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            license_number: license_number.into(),
            phone_number: None,
        }
    }

    pub fn with_phone_number(mut self, phone_number: impl Into<String>) -> Self {
        self.phone_number = Some(phone_number.into());
        self
    }
}

/// Command: UpdateDriverLocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateDriverLocation {
    pub driver_id: DriverId,
    pub latitude: f64,
    pub longitude: f64,
    pub address: Option<String>,
}

impl UpdateDriverLocation {
    pub fn new(driver_id: DriverId, latitude: f64, longitude: f64) -> Self {
        Self {
            driver_id,
            latitude,
            longitude,
            address: None,
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn location(&self) -> DomainResult<Location> {
        let location = Location::new(self.latitude, self.longitude)?;
        Ok(match &self.address {
            Some(address) => location.with_address(address.as_str()),
            None => location,
        })
    }
}

/// Event: DriverCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverCreated {
    pub driver_id: DriverId,
    pub name: String,
    pub license_number: String,
    pub status: DriverStatus,
    pub created_at: DateTime<Utc>,
}

impl From<&Driver> for DriverCreated {
    fn from(driver: &Driver) -> Self {
        Self {
            driver_id: driver.id,
            name: driver.name.clone(),
            license_number: driver.license_number.clone(),
            status: driver.status,
            created_at: driver.created_at,
        }
    }
}

impl DomainEvent for DriverCreated {
    fn event_type(&self) -> &'static str {
        "DriverCreated"
    }

    fn routing_key(&self) -> &'static str {
        "driver.created"
    }
}

/// Event: DriverLocationUpdated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverLocationUpdated {
    pub driver_id: DriverId,
    pub latitude: f64,
    pub longitude: f64,
    pub address: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for DriverLocationUpdated {
    fn event_type(&self) -> &'static str {
        "DriverLocationUpdated"
    }

    fn routing_key(&self) -> &'static str {
        "driver.location.updated"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn status_parses_its_persisted_form() {
        for status in [DriverStatus::Available, DriverStatus::Busy, DriverStatus::Offline, DriverStatus::OnDelivery] {
            assert_eq!(status.as_str().parse::<DriverStatus>(), Ok(status));
        }
        assert!("lost".parse::<DriverStatus>().is_err());
    }

    #[test]
    fn register_trims_and_starts_available() {
        let cmd = CreateDriver::new("  Ana Silva ", " DL-42 ").with_phone_number(" ");
        let driver = Driver::register(&cmd, Utc::now()).unwrap();

        assert_eq!(driver.name, "Ana Silva");
        assert_eq!(driver.license_number, "DL-42");
        assert_eq!(driver.phone_number, None);
        assert_eq!(driver.status, DriverStatus::Available);
        assert!(driver.location.is_none());
        assert_eq!(driver.version, 1);
    }

    #[test]
    fn register_rejects_blank_fields() {
        for cmd in [CreateDriver::new("", "DL-1"), CreateDriver::new("Ana", "  ")] {
            assert!(matches!(
                Driver::register(&cmd, Utc::now()),
                Err(DomainError::Validation(_))
            ));
        }
    }

    #[test]
    fn location_bounds_are_inclusive() {
        assert!(Location::new(90.0, 180.0).is_ok());
        assert!(Location::new(-90.0, -180.0).is_ok());
        assert!(Location::new(90.5, 0.0).is_err());
        assert!(Location::new(0.0, -180.1).is_err());
        assert!(Location::new(f64::NAN, 0.0).is_err());
    }

    #[test]
    fn move_to_marks_driver_active() {
        let mut driver = Driver::register(&CreateDriver::new("Ana", "DL-1"), Utc::now()).unwrap();
        let now = Utc::now();
        driver.move_to(Location::new(51.9, 4.4).unwrap().with_address("Maasvlakte"), now);

        assert_eq!(driver.last_active_at, Some(now));
        assert_eq!(driver.location.as_ref().and_then(|l| l.address.as_deref()), Some("Maasvlakte"));
        assert_eq!(driver.version, 2);
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(serde_json::to_value(DriverStatus::OnDelivery).unwrap(), "on_delivery");
        assert_eq!(DriverStatus::OnDelivery.to_string(), "on_delivery");
    }

    #[test]
    fn created_event_uses_camel_case_payload() {
        let driver = Driver::register(&CreateDriver::new("Ana", "DL-9"), Utc::now()).unwrap();
        let event = DriverCreated::from(&driver);
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(event.routing_key(), "driver.created");
        assert_eq!(json["driverId"], driver.id.to_string());
        assert_eq!(json["licenseNumber"], "DL-9");
        assert_eq!(json["status"], "available");
    }

    proptest! {
        /// Property: in-range coordinates always build a location.
        #[test]
        fn in_range_coordinates_accepted(lat in -90.0f64..=90.0, lon in -180.0f64..=180.0) {
            let location = Location::new(lat, lon).unwrap();
            prop_assert_eq!(location.latitude, lat);
            prop_assert_eq!(location.longitude, lon);
        }

        #[test]
        fn out_of_range_latitude_rejected(lat in prop_oneof![(90.000001f64..1.0e6), (-1.0e6f64..-90.000001)]) {
            prop_assert!(Location::new(lat, 0.0).is_err());
        }
    }
}
