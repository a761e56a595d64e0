//! Byte-level decoding of the standard sensor characteristics.
//!
//! Layouts follow the Bluetooth SIG GATT specifications for heart rate,
//! cycling power, cycling speed/cadence, battery, environmental sensing and
//! fitness machine services. All multi-byte fields are little-endian.
//!
//! Decoders never panic on short or malformed buffers; they return
//! [`ProtocolError::Truncated`] naming the characteristic instead.

pub mod csc;
pub mod cycling_power;
pub mod ftms;
pub mod heart_rate;

use byteorder::{LittleEndian, ReadBytesExt};
use chrono::{DateTime, Utc};
use std::io::Cursor;
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::models::{EndpointId, MetricKind, SensorReading};

pub use csc::RevolutionTracker;

/// Assigned numbers expanded onto the Bluetooth base UUID
pub mod uuids {
    use uuid::Uuid;

    const BASE: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

    /// Expand a 16-bit assigned number
    pub const fn from_short(short: u16) -> Uuid {
        Uuid::from_u128(BASE | ((short as u128) << 96))
    }

    pub const HEART_RATE_SERVICE: Uuid = from_short(0x180D);
    pub const BATTERY_SERVICE: Uuid = from_short(0x180F);
    pub const CSC_SERVICE: Uuid = from_short(0x1816);
    pub const CYCLING_POWER_SERVICE: Uuid = from_short(0x1818);
    pub const ENVIRONMENTAL_SENSING_SERVICE: Uuid = from_short(0x181A);
    pub const FITNESS_MACHINE_SERVICE: Uuid = from_short(0x1826);

    pub const BATTERY_LEVEL: Uuid = from_short(0x2A19);
    pub const HEART_RATE_MEASUREMENT: Uuid = from_short(0x2A37);
    pub const CSC_MEASUREMENT: Uuid = from_short(0x2A5B);
    pub const CYCLING_POWER_MEASUREMENT: Uuid = from_short(0x2A63);
    pub const TEMPERATURE: Uuid = from_short(0x2A6E);
    pub const FITNESS_MACHINE_FEATURE: Uuid = from_short(0x2ACC);
    pub const INDOOR_BIKE_DATA: Uuid = from_short(0x2AD2);
    pub const SUPPORTED_RESISTANCE_LEVEL_RANGE: Uuid = from_short(0x2AD6);
    pub const SUPPORTED_POWER_RANGE: Uuid = from_short(0x2AD8);
    pub const FITNESS_MACHINE_CONTROL_POINT: Uuid = from_short(0x2AD9);
}

/// Little-endian field reader that reports truncation per characteristic
pub(crate) struct FieldReader<'a> {
    cursor: Cursor<&'a [u8]>,
    characteristic: &'static str,
}

impl<'a> FieldReader<'a> {
    pub(crate) fn new(data: &'a [u8], characteristic: &'static str) -> Self {
        Self {
            cursor: Cursor::new(data),
            characteristic,
        }
    }

    fn truncated(&self, offset: usize, size: usize) -> ProtocolError {
        ProtocolError::Truncated {
            characteristic: self.characteristic,
            needed: offset + size,
            got: self.cursor.get_ref().len(),
        }
    }

    fn offset(&self) -> usize {
        self.cursor.position() as usize
    }

    pub(crate) fn u8(&mut self) -> Result<u8, ProtocolError> {
        let offset = self.offset();
        self.cursor.read_u8().map_err(|_| self.truncated(offset, 1))
    }

    pub(crate) fn u16(&mut self) -> Result<u16, ProtocolError> {
        let offset = self.offset();
        self.cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| self.truncated(offset, 2))
    }

    pub(crate) fn i16(&mut self) -> Result<i16, ProtocolError> {
        let offset = self.offset();
        self.cursor
            .read_i16::<LittleEndian>()
            .map_err(|_| self.truncated(offset, 2))
    }

    pub(crate) fn u24(&mut self) -> Result<u32, ProtocolError> {
        let offset = self.offset();
        self.cursor
            .read_u24::<LittleEndian>()
            .map_err(|_| self.truncated(offset, 3))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, ProtocolError> {
        let offset = self.offset();
        self.cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| self.truncated(offset, 4))
    }

    pub(crate) fn remaining(&self) -> usize {
        self.cursor
            .get_ref()
            .len()
            .saturating_sub(self.cursor.position() as usize)
    }
}

/// Battery Level (0x2A19): a single percent byte
pub fn decode_battery_level(data: &[u8]) -> Result<u8, ProtocolError> {
    FieldReader::new(data, "battery level").u8()
}

/// Temperature (0x2A6E): sint16 in 0.01 °C
pub fn decode_temperature(data: &[u8]) -> Result<f64, ProtocolError> {
    let raw = FieldReader::new(data, "temperature").i16()?;
    Ok(f64::from(raw) / 100.0)
}

/// Per-endpoint decoder turning notifications into readings
///
/// Holds the revolution trackers needed to derive cadence and speed from
/// cumulative counters, so one instance must be kept per endpoint.
#[derive(Debug)]
pub struct MeasurementDecoder {
    endpoint: EndpointId,
    wheel_circumference_m: f64,
    crank: RevolutionTracker,
    wheel: RevolutionTracker,
}

impl MeasurementDecoder {
    pub fn new(endpoint: EndpointId, wheel_circumference_m: f64) -> Self {
        Self {
            endpoint,
            wheel_circumference_m,
            crank: RevolutionTracker::new(),
            wheel: RevolutionTracker::new(),
        }
    }

    /// Decode one notification into zero or more readings
    pub fn decode(
        &mut self,
        characteristic: Uuid,
        data: &[u8],
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<SensorReading>, ProtocolError> {
        let mut values: Vec<(MetricKind, f64)> = Vec::new();

        if characteristic == uuids::HEART_RATE_MEASUREMENT {
            let measurement = heart_rate::decode(data)?;
            values.push((MetricKind::HeartRate, f64::from(measurement.bpm)));
        } else if characteristic == uuids::CYCLING_POWER_MEASUREMENT {
            let measurement = cycling_power::decode(data)?;
            values.push((MetricKind::Power, f64::from(measurement.instantaneous_power)));
            if let Some(crank) = measurement.crank {
                if let Some(rpm) = self.crank.cadence_rpm(crank.cumulative_revolutions, crank.last_event_time) {
                    values.push((MetricKind::Cadence, rpm));
                }
            }
        } else if characteristic == uuids::CSC_MEASUREMENT {
            let measurement = csc::decode(data)?;
            if let Some(wheel) = measurement.wheel {
                if let Some(speed) = self.wheel.speed_mps(
                    wheel.cumulative_revolutions,
                    wheel.last_event_time,
                    self.wheel_circumference_m,
                ) {
                    values.push((MetricKind::Speed, speed));
                }
            }
            if let Some(crank) = measurement.crank {
                if let Some(rpm) = self.crank.cadence_rpm(crank.cumulative_revolutions, crank.last_event_time) {
                    values.push((MetricKind::Cadence, rpm));
                }
            }
        } else if characteristic == uuids::INDOOR_BIKE_DATA {
            let data = ftms::decode_indoor_bike_data(data)?;
            if let Some(kmh) = data.instantaneous_speed_kmh {
                values.push((MetricKind::Speed, kmh / 3.6));
            }
            if let Some(rpm) = data.instantaneous_cadence_rpm {
                values.push((MetricKind::Cadence, rpm));
            }
            if let Some(watts) = data.instantaneous_power {
                values.push((MetricKind::Power, f64::from(watts)));
            }
            if let Some(meters) = data.total_distance_m {
                values.push((MetricKind::Distance, f64::from(meters)));
            }
            if let Some(bpm) = data.heart_rate {
                values.push((MetricKind::HeartRate, f64::from(bpm)));
            }
        } else if characteristic == uuids::BATTERY_LEVEL {
            values.push((MetricKind::Battery, f64::from(decode_battery_level(data)?)));
        } else if characteristic == uuids::TEMPERATURE {
            values.push((MetricKind::Temperature, decode_temperature(data)?));
        } else {
            return Err(ProtocolError::UnsupportedCharacteristic(characteristic.to_string()));
        }

        Ok(values
            .into_iter()
            .map(|(metric, value)| SensorReading::new(self.endpoint.clone(), metric, value, timestamp))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_uuid_expansion() {
        assert_eq!(
            uuids::HEART_RATE_MEASUREMENT.to_string(),
            "00002a37-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            uuids::FITNESS_MACHINE_SERVICE.to_string(),
            "00001826-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_battery_and_temperature() {
        assert_eq!(decode_battery_level(&[87]).unwrap(), 87);
        assert!(decode_battery_level(&[]).is_err());

        // 0x0992 = 2450 -> 24.50 °C
        assert_eq!(decode_temperature(&[0x92, 0x09]).unwrap(), 24.5);
        // -500 -> -5.00 °C
        assert_eq!(decode_temperature(&(-500i16).to_le_bytes()).unwrap(), -5.0);
    }

    #[test]
    fn test_decoder_heart_rate_notification() {
        let mut decoder = MeasurementDecoder::new(EndpointId::new("hrm"), 2.105);
        let readings = decoder
            .decode(uuids::HEART_RATE_MEASUREMENT, &[0x00, 142], Utc::now())
            .unwrap();

        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].metric, MetricKind::HeartRate);
        assert_eq!(readings[0].value, 142.0);
        assert_eq!(readings[0].endpoint, EndpointId::new("hrm"));
    }

    #[test]
    fn test_decoder_power_with_crank_cadence() {
        let mut decoder = MeasurementDecoder::new(EndpointId::new("pm"), 2.105);
        let frame = |power: i16, revs: u16, time: u16| {
            let mut bytes = vec![0x20, 0x00];
            bytes.extend_from_slice(&power.to_le_bytes());
            bytes.extend_from_slice(&revs.to_le_bytes());
            bytes.extend_from_slice(&time.to_le_bytes());
            bytes
        };

        let first = decoder
            .decode(uuids::CYCLING_POWER_MEASUREMENT, &frame(250, 10, 0), Utc::now())
            .unwrap();
        assert_eq!(first.len(), 1); // no cadence until a second crank event

        // 1.5 revolutions would be fractional, so use 3 revs over 2 s = 90 rpm
        let second = decoder
            .decode(uuids::CYCLING_POWER_MEASUREMENT, &frame(260, 13, 2048), Utc::now())
            .unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(second[1].metric, MetricKind::Cadence);
        assert!((second[1].value - 90.0).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_characteristic() {
        let mut decoder = MeasurementDecoder::new(EndpointId::new("x"), 2.105);
        let result = decoder.decode(uuids::from_short(0x2A00), &[0x01], Utc::now());
        assert!(matches!(result, Err(ProtocolError::UnsupportedCharacteristic(_))));
    }
}
