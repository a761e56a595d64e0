use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use crate::protocol::uuids;

/// Opaque platform identifier of a wireless endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(String);

impl EndpointId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metric kinds a sensor can report
///
/// Closed set: validation, zone classification and aggregation all match on it
/// exhaustively, so a new kind is a compile-time addition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Beats per minute
    HeartRate,
    /// Watts
    Power,
    /// Revolutions per minute
    Cadence,
    /// Meters per second
    Speed,
    /// Degrees Celsius
    Temperature,
    /// Cumulative device odometer in meters
    Distance,
    /// Meters above sea level
    Altitude,
    /// Battery charge percent
    Battery,
}

impl MetricKind {
    pub const ALL: [MetricKind; 8] = [
        MetricKind::HeartRate,
        MetricKind::Power,
        MetricKind::Cadence,
        MetricKind::Speed,
        MetricKind::Temperature,
        MetricKind::Distance,
        MetricKind::Altitude,
        MetricKind::Battery,
    ];

    pub fn unit(&self) -> &'static str {
        match self {
            MetricKind::HeartRate => "bpm",
            MetricKind::Power => "W",
            MetricKind::Cadence => "rpm",
            MetricKind::Speed => "m/s",
            MetricKind::Temperature => "°C",
            MetricKind::Distance => "m",
            MetricKind::Altitude => "m",
            MetricKind::Battery => "%",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetricKind::HeartRate => "heart rate",
            MetricKind::Power => "power",
            MetricKind::Cadence => "cadence",
            MetricKind::Speed => "speed",
            MetricKind::Temperature => "temperature",
            MetricKind::Distance => "distance",
            MetricKind::Altitude => "altitude",
            MetricKind::Battery => "battery",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for MetricKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', ' '], "_").as_str() {
            "heart_rate" | "hr" => Ok(MetricKind::HeartRate),
            "power" => Ok(MetricKind::Power),
            "cadence" => Ok(MetricKind::Cadence),
            "speed" => Ok(MetricKind::Speed),
            "temperature" | "temp" => Ok(MetricKind::Temperature),
            "distance" => Ok(MetricKind::Distance),
            "altitude" | "elevation" => Ok(MetricKind::Altitude),
            "battery" => Ok(MetricKind::Battery),
            _ => Err(format!("Invalid metric: {}", s)),
        }
    }
}

/// A single immutable sample produced by the transport layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub metric: MetricKind,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub endpoint: EndpointId,
}

impl SensorReading {
    pub fn new(endpoint: EndpointId, metric: MetricKind, value: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            metric,
            value,
            timestamp,
            endpoint,
        }
    }
}

/// Wall-clock timestamps derived from a monotonic instant
///
/// Anchored once at construction, so timestamps never go backwards when the
/// system clock is adjusted and follow tokio's clock when time is paused.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin_utc: DateTime<Utc>,
    origin: tokio::time::Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin_utc: Utc::now(),
            origin: tokio::time::Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.origin.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());
        self.origin_utc + elapsed
    }
}

/// Standard GATT services the engine understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorService {
    HeartRate,
    CyclingPower,
    CyclingSpeedCadence,
    FitnessMachine,
    Battery,
    EnvironmentalSensing,
}

impl SensorService {
    pub fn uuid(&self) -> Uuid {
        match self {
            SensorService::HeartRate => uuids::HEART_RATE_SERVICE,
            SensorService::CyclingPower => uuids::CYCLING_POWER_SERVICE,
            SensorService::CyclingSpeedCadence => uuids::CSC_SERVICE,
            SensorService::FitnessMachine => uuids::FITNESS_MACHINE_SERVICE,
            SensorService::Battery => uuids::BATTERY_SERVICE,
            SensorService::EnvironmentalSensing => uuids::ENVIRONMENTAL_SENSING_SERVICE,
        }
    }

    pub fn from_uuid(uuid: &Uuid) -> Option<Self> {
        [
            SensorService::HeartRate,
            SensorService::CyclingPower,
            SensorService::CyclingSpeedCadence,
            SensorService::FitnessMachine,
            SensorService::Battery,
            SensorService::EnvironmentalSensing,
        ]
        .into_iter()
        .find(|service| service.uuid() == *uuid)
    }

    /// Notify characteristic carrying this service's measurements
    pub fn measurement_characteristic(&self) -> Uuid {
        match self {
            SensorService::HeartRate => uuids::HEART_RATE_MEASUREMENT,
            SensorService::CyclingPower => uuids::CYCLING_POWER_MEASUREMENT,
            SensorService::CyclingSpeedCadence => uuids::CSC_MEASUREMENT,
            SensorService::FitnessMachine => uuids::INDOOR_BIKE_DATA,
            SensorService::Battery => uuids::BATTERY_LEVEL,
            SensorService::EnvironmentalSensing => uuids::TEMPERATURE,
        }
    }

    pub fn metrics(&self) -> &'static [MetricKind] {
        match self {
            SensorService::HeartRate => &[MetricKind::HeartRate],
            SensorService::CyclingPower => &[MetricKind::Power, MetricKind::Cadence],
            SensorService::CyclingSpeedCadence => &[MetricKind::Speed, MetricKind::Cadence],
            SensorService::FitnessMachine => &[
                MetricKind::Power,
                MetricKind::Cadence,
                MetricKind::Speed,
                MetricKind::Distance,
                MetricKind::HeartRate,
            ],
            SensorService::Battery => &[MetricKind::Battery],
            SensorService::EnvironmentalSensing => &[MetricKind::Temperature],
        }
    }
}

/// A discovered wireless sensor or trainer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorEndpoint {
    pub id: EndpointId,
    pub name: String,
    pub services: BTreeSet<SensorService>,
    pub battery_level: Option<u8>,
    pub rssi: Option<i16>,
}

impl SensorEndpoint {
    pub fn new(id: EndpointId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            services: BTreeSet::new(),
            battery_level: None,
            rssi: None,
        }
    }

    pub fn with_services(mut self, services: impl IntoIterator<Item = SensorService>) -> Self {
        self.services.extend(services);
        self
    }

    /// Supports fitness machine control writes
    pub fn is_controllable(&self) -> bool {
        self.services.contains(&SensorService::FitnessMachine)
    }

    pub fn metrics(&self) -> BTreeSet<MetricKind> {
        self.services
            .iter()
            .flat_map(|service| service.metrics().iter().copied())
            .collect()
    }
}

/// Link state of an endpoint, owned by the connection manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Reconnection exhausted; stays here until an explicit connect
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Personal reference values used for target resolution and zones
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AthleteProfile {
    /// Athlete's display name
    pub name: String,

    /// Functional Threshold Power (watts)
    pub ftp: Option<u16>,

    /// Lactate Threshold Heart Rate (bpm)
    pub lthr: Option<u16>,

    /// Maximum heart rate (bpm)
    pub max_hr: Option<u16>,

    /// Weight in kilograms
    pub weight_kg: Option<f64>,
}

impl Default for AthleteProfile {
    fn default() -> Self {
        Self {
            name: "Athlete".to_string(),
            ftp: None,
            lthr: None,
            max_hr: None,
            weight_kg: None,
        }
    }
}

impl AthleteProfile {
    pub fn has_power_thresholds(&self) -> bool {
        self.ftp.is_some()
    }

    pub fn has_heart_rate_thresholds(&self) -> bool {
        self.lthr.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controllable_endpoint() {
        let trainer = SensorEndpoint::new(EndpointId::new("kickr"), "KICKR")
            .with_services([SensorService::FitnessMachine, SensorService::CyclingPower]);
        assert!(trainer.is_controllable());
        assert!(trainer.metrics().contains(&MetricKind::Power));

        let strap = SensorEndpoint::new(EndpointId::new("hrm"), "HRM-Pro")
            .with_services([SensorService::HeartRate, SensorService::Battery]);
        assert!(!strap.is_controllable());
        assert!(strap.metrics().contains(&MetricKind::Battery));
    }

    #[test]
    fn test_service_uuid_lookup() {
        for service in [SensorService::HeartRate, SensorService::FitnessMachine] {
            assert_eq!(SensorService::from_uuid(&service.uuid()), Some(service));
        }
        assert_eq!(SensorService::from_uuid(&Uuid::nil()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_follows_tokio_time() {
        let clock = MonotonicClock::new();
        let before = clock.now();
        tokio::time::advance(std::time::Duration::from_secs(90)).await;
        assert_eq!((clock.now() - before).num_seconds(), 90);
    }

    #[test]
    fn test_metric_parsing() {
        assert_eq!("hr".parse::<MetricKind>().unwrap(), MetricKind::HeartRate);
        assert_eq!("heart-rate".parse::<MetricKind>().unwrap(), MetricKind::HeartRate);
        assert!("torque".parse::<MetricKind>().is_err());
    }
}
