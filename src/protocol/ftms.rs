//! Fitness Machine Service: indoor bike data, feature discovery and the
//! control point command set.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::FieldReader;
use crate::error::ProtocolError;

// Indoor Bike Data flags (0x2AD2). Bit 0 is inverted: clear means speed is present.
const FLAG_MORE_DATA: u16 = 1 << 0;
const FLAG_AVERAGE_SPEED: u16 = 1 << 1;
const FLAG_INSTANTANEOUS_CADENCE: u16 = 1 << 2;
const FLAG_AVERAGE_CADENCE: u16 = 1 << 3;
const FLAG_TOTAL_DISTANCE: u16 = 1 << 4;
const FLAG_RESISTANCE_LEVEL: u16 = 1 << 5;
const FLAG_INSTANTANEOUS_POWER: u16 = 1 << 6;
const FLAG_AVERAGE_POWER: u16 = 1 << 7;
const FLAG_EXPENDED_ENERGY: u16 = 1 << 8;
const FLAG_HEART_RATE: u16 = 1 << 9;
const FLAG_METABOLIC_EQUIVALENT: u16 = 1 << 10;
const FLAG_ELAPSED_TIME: u16 = 1 << 11;
const FLAG_REMAINING_TIME: u16 = 1 << 12;

// Target setting feature bits (second u32 of 0x2ACC)
const TARGET_RESISTANCE: u32 = 1 << 2;
const TARGET_POWER: u32 = 1 << 3;
const TARGET_INDOOR_BIKE_SIMULATION: u32 = 1 << 13;

pub const OP_REQUEST_CONTROL: u8 = 0x00;
pub const OP_RESET: u8 = 0x01;
pub const OP_SET_TARGET_RESISTANCE: u8 = 0x04;
pub const OP_SET_TARGET_POWER: u8 = 0x05;
pub const OP_START_OR_RESUME: u8 = 0x07;
pub const OP_SET_INDOOR_BIKE_SIMULATION: u8 = 0x11;
pub const OP_RESPONSE_CODE: u8 = 0x80;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndoorBikeData {
    pub instantaneous_speed_kmh: Option<f64>,
    pub average_speed_kmh: Option<f64>,
    pub instantaneous_cadence_rpm: Option<f64>,
    pub average_cadence_rpm: Option<f64>,
    pub total_distance_m: Option<u32>,
    pub resistance_level: Option<i16>,
    pub instantaneous_power: Option<i16>,
    pub average_power: Option<i16>,
    pub total_energy_kcal: Option<u16>,
    pub heart_rate: Option<u8>,
    /// 0.1 MET resolution
    pub metabolic_equivalent: Option<f64>,
    pub elapsed_time_s: Option<u16>,
    pub remaining_time_s: Option<u16>,
}

pub fn decode_indoor_bike_data(data: &[u8]) -> Result<IndoorBikeData, ProtocolError> {
    let mut reader = FieldReader::new(data, "indoor bike data");
    let flags = reader.u16()?;
    let mut out = IndoorBikeData::default();

    if flags & FLAG_MORE_DATA == 0 {
        out.instantaneous_speed_kmh = Some(f64::from(reader.u16()?) / 100.0);
    }
    if flags & FLAG_AVERAGE_SPEED != 0 {
        out.average_speed_kmh = Some(f64::from(reader.u16()?) / 100.0);
    }
    if flags & FLAG_INSTANTANEOUS_CADENCE != 0 {
        out.instantaneous_cadence_rpm = Some(f64::from(reader.u16()?) / 2.0);
    }
    if flags & FLAG_AVERAGE_CADENCE != 0 {
        out.average_cadence_rpm = Some(f64::from(reader.u16()?) / 2.0);
    }
    if flags & FLAG_TOTAL_DISTANCE != 0 {
        out.total_distance_m = Some(reader.u24()?);
    }
    if flags & FLAG_RESISTANCE_LEVEL != 0 {
        out.resistance_level = Some(reader.i16()?);
    }
    if flags & FLAG_INSTANTANEOUS_POWER != 0 {
        out.instantaneous_power = Some(reader.i16()?);
    }
    if flags & FLAG_AVERAGE_POWER != 0 {
        out.average_power = Some(reader.i16()?);
    }
    if flags & FLAG_EXPENDED_ENERGY != 0 {
        out.total_energy_kcal = Some(reader.u16()?);
        reader.u16()?; // per hour
        reader.u8()?; // per minute
    }
    if flags & FLAG_HEART_RATE != 0 {
        out.heart_rate = Some(reader.u8()?);
    }
    if flags & FLAG_METABOLIC_EQUIVALENT != 0 {
        out.metabolic_equivalent = Some(f64::from(reader.u8()?) / 10.0);
    }
    if flags & FLAG_ELAPSED_TIME != 0 {
        out.elapsed_time_s = Some(reader.u16()?);
    }
    if flags & FLAG_REMAINING_TIME != 0 {
        out.remaining_time_s = Some(reader.u16()?);
    }

    Ok(out)
}

/// Fitness Machine Feature (0x2ACC)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FitnessMachineFeatures {
    pub machine_features: u32,
    pub target_settings: u32,
}

impl FitnessMachineFeatures {
    pub fn supports_power_target(&self) -> bool {
        self.target_settings & TARGET_POWER != 0
    }

    pub fn supports_resistance_target(&self) -> bool {
        self.target_settings & TARGET_RESISTANCE != 0
    }

    pub fn supports_simulation(&self) -> bool {
        self.target_settings & TARGET_INDOOR_BIKE_SIMULATION != 0
    }
}

pub fn decode_features(data: &[u8]) -> Result<FitnessMachineFeatures, ProtocolError> {
    let mut reader = FieldReader::new(data, "fitness machine feature");
    Ok(FitnessMachineFeatures {
        machine_features: reader.u32()?,
        target_settings: reader.u32()?,
    })
}

/// Device-reported range for a target setting, in engineering units
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SupportedRange {
    pub min: f64,
    pub max: f64,
    pub increment: f64,
}

impl SupportedRange {
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

fn decode_range(data: &[u8], characteristic: &'static str, scale: f64) -> Result<SupportedRange, ProtocolError> {
    let mut reader = FieldReader::new(data, characteristic);
    Ok(SupportedRange {
        min: f64::from(reader.i16()?) * scale,
        max: f64::from(reader.i16()?) * scale,
        increment: f64::from(reader.u16()?) * scale,
    })
}

/// Supported Resistance Level Range (0x2AD6), 0.1 resolution
pub fn decode_resistance_range(data: &[u8]) -> Result<SupportedRange, ProtocolError> {
    decode_range(data, "supported resistance level range", 0.1)
}

/// Supported Power Range (0x2AD8), watts
pub fn decode_power_range(data: &[u8]) -> Result<SupportedRange, ProtocolError> {
    decode_range(data, "supported power range", 1.0)
}

/// A write to the Fitness Machine Control Point (0x2AD9)
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlPointCommand {
    RequestControl,
    Reset,
    /// Unitless level, 0.1 resolution
    SetTargetResistance(f64),
    SetTargetPower(i16),
    StartOrResume,
    SetIndoorBikeSimulation {
        wind_speed_mps: f64,
        grade_percent: f64,
        rolling_resistance: f64,
        wind_resistance: f64,
    },
}

impl ControlPointCommand {
    pub fn opcode(&self) -> u8 {
        match self {
            Self::RequestControl => OP_REQUEST_CONTROL,
            Self::Reset => OP_RESET,
            Self::SetTargetResistance(_) => OP_SET_TARGET_RESISTANCE,
            Self::SetTargetPower(_) => OP_SET_TARGET_POWER,
            Self::StartOrResume => OP_START_OR_RESUME,
            Self::SetIndoorBikeSimulation { .. } => OP_SET_INDOOR_BIKE_SIMULATION,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::RequestControl => "request_control",
            Self::Reset => "reset",
            Self::SetTargetResistance(_) => "set_target_resistance",
            Self::SetTargetPower(_) => "set_target_power",
            Self::StartOrResume => "start_or_resume",
            Self::SetIndoorBikeSimulation { .. } => "set_indoor_bike_simulation",
        }
    }

    /// Wire encoding; callers range-check values beforehand
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = vec![self.opcode()];
        match *self {
            Self::RequestControl | Self::Reset | Self::StartOrResume => {}
            Self::SetTargetResistance(level) => {
                bytes.extend_from_slice(&scale_i16(level, 10.0).to_le_bytes());
            }
            Self::SetTargetPower(watts) => {
                bytes.extend_from_slice(&watts.to_le_bytes());
            }
            Self::SetIndoorBikeSimulation {
                wind_speed_mps,
                grade_percent,
                rolling_resistance,
                wind_resistance,
            } => {
                bytes.extend_from_slice(&scale_i16(wind_speed_mps, 1000.0).to_le_bytes());
                bytes.extend_from_slice(&scale_i16(grade_percent, 100.0).to_le_bytes());
                bytes.push(scale_u8(rolling_resistance, 10_000.0));
                bytes.push(scale_u8(wind_resistance, 100.0));
            }
        }
        bytes
    }
}

fn scale_i16(value: f64, factor: f64) -> i16 {
    (value * factor)
        .round()
        .clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
}

fn scale_u8(value: f64, factor: f64) -> u8 {
    (value * factor).round().clamp(0.0, f64::from(u8::MAX)) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    Success,
    NotSupported,
    InvalidParameter,
    OperationFailed,
    ControlNotPermitted,
    Reserved(u8),
}

impl From<u8> for ResultCode {
    fn from(raw: u8) -> Self {
        match raw {
            0x01 => Self::Success,
            0x02 => Self::NotSupported,
            0x03 => Self::InvalidParameter,
            0x04 => Self::OperationFailed,
            0x05 => Self::ControlNotPermitted,
            other => Self::Reserved(other),
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::NotSupported => write!(f, "op code not supported"),
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::OperationFailed => write!(f, "operation failed"),
            Self::ControlNotPermitted => write!(f, "control not permitted"),
            Self::Reserved(code) => write!(f, "reserved result code 0x{:02X}", code),
        }
    }
}

/// Indication sent back on the control point after a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlPointResponse {
    pub request_opcode: u8,
    pub result: ResultCode,
}

impl ControlPointResponse {
    pub fn encode(&self) -> Vec<u8> {
        let result = match self.result {
            ResultCode::Success => 0x01,
            ResultCode::NotSupported => 0x02,
            ResultCode::InvalidParameter => 0x03,
            ResultCode::OperationFailed => 0x04,
            ResultCode::ControlNotPermitted => 0x05,
            ResultCode::Reserved(code) => code,
        };
        vec![OP_RESPONSE_CODE, self.request_opcode, result]
    }
}

pub fn decode_control_point_response(data: &[u8]) -> Result<ControlPointResponse, ProtocolError> {
    let mut reader = FieldReader::new(data, "fitness machine control point");
    let opcode = reader.u8()?;
    if opcode != OP_RESPONSE_CODE {
        return Err(ProtocolError::UnexpectedOpcode {
            characteristic: "fitness machine control point",
            opcode,
        });
    }

    Ok(ControlPointResponse {
        request_opcode: reader.u8()?,
        result: ResultCode::from(reader.u8()?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indoor_bike_speed_cadence_power() {
        // speed present (bit 0 clear), cadence, power
        let flags = FLAG_INSTANTANEOUS_CADENCE | FLAG_INSTANTANEOUS_POWER;
        let mut bytes = flags.to_le_bytes().to_vec();
        bytes.extend_from_slice(&3250u16.to_le_bytes()); // 32.50 km/h
        bytes.extend_from_slice(&180u16.to_le_bytes()); // 90 rpm
        bytes.extend_from_slice(&205i16.to_le_bytes());

        let data = decode_indoor_bike_data(&bytes).unwrap();
        assert_eq!(data.instantaneous_speed_kmh, Some(32.5));
        assert_eq!(data.instantaneous_cadence_rpm, Some(90.0));
        assert_eq!(data.instantaneous_power, Some(205));
        assert_eq!(data.heart_rate, None);
    }

    #[test]
    fn test_indoor_bike_more_data_and_distance() {
        let flags = FLAG_MORE_DATA | FLAG_TOTAL_DISTANCE | FLAG_EXPENDED_ENERGY | FLAG_HEART_RATE;
        let mut bytes = flags.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0x10, 0x27, 0x00]); // 10000 m
        bytes.extend_from_slice(&120u16.to_le_bytes());
        bytes.extend_from_slice(&600u16.to_le_bytes());
        bytes.push(10);
        bytes.push(151);

        let data = decode_indoor_bike_data(&bytes).unwrap();
        assert_eq!(data.instantaneous_speed_kmh, None);
        assert_eq!(data.total_distance_m, Some(10_000));
        assert_eq!(data.total_energy_kcal, Some(120));
        assert_eq!(data.heart_rate, Some(151));
    }

    #[test]
    fn test_indoor_bike_truncated_power() {
        let flags = FLAG_MORE_DATA | FLAG_INSTANTANEOUS_POWER;
        let mut bytes = flags.to_le_bytes().to_vec();
        bytes.push(0x10);
        assert!(matches!(
            decode_indoor_bike_data(&bytes),
            Err(ProtocolError::Truncated { needed: 4, got: 3, .. })
        ));
    }

    #[test]
    fn test_features() {
        let mut bytes = 0u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&(TARGET_POWER | TARGET_INDOOR_BIKE_SIMULATION).to_le_bytes());
        let features = decode_features(&bytes).unwrap();
        assert!(features.supports_power_target());
        assert!(features.supports_simulation());
        assert!(!features.supports_resistance_target());
    }

    #[test]
    fn test_supported_ranges() {
        let mut bytes = 0i16.to_le_bytes().to_vec();
        bytes.extend_from_slice(&1000i16.to_le_bytes());
        bytes.extend_from_slice(&5u16.to_le_bytes());
        let power = decode_power_range(&bytes).unwrap();
        assert_eq!(power.max, 1000.0);
        assert!(power.contains(999.0));
        assert!(!power.contains(1001.0));

        let resistance = decode_resistance_range(&bytes).unwrap();
        assert!((resistance.max - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_encode_commands() {
        assert_eq!(ControlPointCommand::RequestControl.encode(), vec![0x00]);
        assert_eq!(ControlPointCommand::SetTargetPower(250).encode(), vec![0x05, 0xFA, 0x00]);
        assert_eq!(
            ControlPointCommand::SetTargetResistance(25.5).encode(),
            vec![0x04, 0xFF, 0x00]
        );
        assert_eq!(
            ControlPointCommand::SetIndoorBikeSimulation {
                wind_speed_mps: 0.0,
                grade_percent: 5.0,
                rolling_resistance: 0.004,
                wind_resistance: 0.51,
            }
            .encode(),
            vec![0x11, 0x00, 0x00, 0xF4, 0x01, 40, 51]
        );
    }

    #[test]
    fn test_control_point_response() {
        let response = decode_control_point_response(&[0x80, 0x05, 0x01]).unwrap();
        assert_eq!(response.request_opcode, OP_SET_TARGET_POWER);
        assert_eq!(response.result, ResultCode::Success);
        assert_eq!(response.encode(), vec![0x80, 0x05, 0x01]);

        let response = decode_control_point_response(&[0x80, 0x11, 0x02]).unwrap();
        assert_eq!(response.result, ResultCode::NotSupported);

        assert!(matches!(
            decode_control_point_response(&[0x05, 0x00]),
            Err(ProtocolError::UnexpectedOpcode { opcode: 0x05, .. })
        ));
    }
}
