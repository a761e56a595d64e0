//! Plausibility bounds for incoming sensor readings.
//!
//! Every `(metric, value)` pair maps to exactly one of accept or reject. The
//! bounds are fixed closed intervals; they are not tunable at runtime.

use crate::error::ValidationError;
use crate::models::{MetricKind, SensorReading};

/// Closed interval of plausible values for a metric
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
}

impl Bounds {
    const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Validate and reject implausible sensor readings
pub struct ReadingValidator;

impl ReadingValidator {
    /// Plausible range for a metric
    pub const fn bounds(metric: MetricKind) -> Bounds {
        match metric {
            MetricKind::HeartRate => Bounds::new(30.0, 250.0),
            MetricKind::Power => Bounds::new(0.0, 4000.0),
            MetricKind::Cadence => Bounds::new(0.0, 300.0),
            MetricKind::Speed => Bounds::new(0.0, 100.0),
            MetricKind::Temperature => Bounds::new(-40.0, 60.0),
            MetricKind::Distance => Bounds::new(0.0, 1_000_000.0),
            MetricKind::Altitude => Bounds::new(-500.0, 9000.0),
            MetricKind::Battery => Bounds::new(0.0, 100.0),
        }
    }

    /// Return the value unchanged if plausible
    pub fn validate(metric: MetricKind, value: f64) -> Result<f64, ValidationError> {
        if !value.is_finite() {
            return Err(ValidationError::NotFinite { metric });
        }

        let bounds = Self::bounds(metric);
        if bounds.contains(value) {
            Ok(value)
        } else {
            Err(ValidationError::OutOfRange {
                metric,
                value,
                min: bounds.min,
                max: bounds.max,
            })
        }
    }

    /// Validate a full reading, logging rejections
    pub fn validate_reading(reading: SensorReading) -> Result<SensorReading, ValidationError> {
        match Self::validate(reading.metric, reading.value) {
            Ok(_) => Ok(reading),
            Err(err) => {
                tracing::warn!(
                    endpoint = %reading.endpoint,
                    metric = %reading.metric,
                    value = reading.value,
                    "Rejected reading: {}",
                    err
                );
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EndpointId;
    use chrono::Utc;
    use proptest::prelude::*;

    #[test]
    fn test_boundaries_inclusive() {
        assert!(ReadingValidator::validate(MetricKind::HeartRate, 30.0).is_ok());
        assert!(ReadingValidator::validate(MetricKind::HeartRate, 250.0).is_ok());
        assert!(ReadingValidator::validate(MetricKind::HeartRate, 29.9).is_err());
        assert!(ReadingValidator::validate(MetricKind::HeartRate, 250.1).is_err());

        assert!(ReadingValidator::validate(MetricKind::Power, 0.0).is_ok());
        assert!(ReadingValidator::validate(MetricKind::Power, 4000.0).is_ok());
        assert!(ReadingValidator::validate(MetricKind::Power, -1.0).is_err());

        assert!(ReadingValidator::validate(MetricKind::Temperature, -40.0).is_ok());
        assert!(ReadingValidator::validate(MetricKind::Temperature, 60.0).is_ok());
        assert!(ReadingValidator::validate(MetricKind::Temperature, 60.5).is_err());
    }

    #[test]
    fn test_non_finite_rejected() {
        assert_eq!(
            ReadingValidator::validate(MetricKind::Speed, f64::NAN),
            Err(ValidationError::NotFinite {
                metric: MetricKind::Speed
            })
        );
        assert!(ReadingValidator::validate(MetricKind::Cadence, f64::INFINITY).is_err());
    }

    #[test]
    fn test_reading_returned_unchanged() {
        let reading = SensorReading::new(EndpointId::new("pm"), MetricKind::Power, 250.0, Utc::now());
        let accepted = ReadingValidator::validate_reading(reading.clone()).unwrap();
        assert_eq!(accepted, reading);
    }

    proptest! {
        #[test]
        fn test_accepts_iff_within_bounds(
            index in 0usize..MetricKind::ALL.len(),
            value in -1000.0f64..1_100_000.0
        ) {
            let metric = MetricKind::ALL[index];
            let bounds = ReadingValidator::bounds(metric);
            let result = ReadingValidator::validate(metric, value);

            prop_assert_eq!(result.is_ok(), value >= bounds.min && value <= bounds.max);
            if let Ok(accepted) = result {
                prop_assert_eq!(accepted, value);
            }
        }
    }
}
