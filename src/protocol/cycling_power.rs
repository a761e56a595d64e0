//! Cycling Power Measurement (0x2A63)

use serde::{Deserialize, Serialize};

use super::csc::CrankRevolutions;
use super::FieldReader;
use crate::error::ProtocolError;

const FLAG_PEDAL_POWER_BALANCE: u16 = 0x0001;
const FLAG_ACCUMULATED_TORQUE: u16 = 0x0004;
const FLAG_WHEEL_REVOLUTIONS: u16 = 0x0010;
const FLAG_CRANK_REVOLUTIONS: u16 = 0x0020;
const FLAG_EXTREME_FORCE: u16 = 0x0040;
const FLAG_EXTREME_TORQUE: u16 = 0x0080;
const FLAG_EXTREME_ANGLES: u16 = 0x0100;
const FLAG_TOP_DEAD_SPOT: u16 = 0x0200;
const FLAG_BOTTOM_DEAD_SPOT: u16 = 0x0400;
const FLAG_ACCUMULATED_ENERGY: u16 = 0x0800;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerWheelRevolutions {
    pub cumulative_revolutions: u32,
    /// 1/2048 s
    pub last_event_time: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CyclingPowerMeasurement {
    pub instantaneous_power: i16,
    /// Percent of power from the reference pedal, 0.5 % resolution
    pub pedal_power_balance: Option<f64>,
    /// 1/32 Nm
    pub accumulated_torque: Option<u16>,
    pub wheel: Option<PowerWheelRevolutions>,
    pub crank: Option<CrankRevolutions>,
    pub accumulated_energy_kj: Option<u16>,
}

pub fn decode(data: &[u8]) -> Result<CyclingPowerMeasurement, ProtocolError> {
    let mut reader = FieldReader::new(data, "cycling power measurement");
    let flags = reader.u16()?;
    let instantaneous_power = reader.i16()?;

    let pedal_power_balance = if flags & FLAG_PEDAL_POWER_BALANCE != 0 {
        Some(f64::from(reader.u8()?) / 2.0)
    } else {
        None
    };

    let accumulated_torque = if flags & FLAG_ACCUMULATED_TORQUE != 0 {
        Some(reader.u16()?)
    } else {
        None
    };

    let wheel = if flags & FLAG_WHEEL_REVOLUTIONS != 0 {
        Some(PowerWheelRevolutions {
            cumulative_revolutions: reader.u32()?,
            last_event_time: reader.u16()?,
        })
    } else {
        None
    };

    let crank = if flags & FLAG_CRANK_REVOLUTIONS != 0 {
        Some(CrankRevolutions {
            cumulative_revolutions: reader.u16()?,
            last_event_time: reader.u16()?,
        })
    } else {
        None
    };

    // Fields we do not surface still have to be stepped over
    if flags & FLAG_EXTREME_FORCE != 0 {
        reader.i16()?;
        reader.i16()?;
    }
    if flags & FLAG_EXTREME_TORQUE != 0 {
        reader.i16()?;
        reader.i16()?;
    }
    if flags & FLAG_EXTREME_ANGLES != 0 {
        reader.u24()?;
    }
    if flags & FLAG_TOP_DEAD_SPOT != 0 {
        reader.u16()?;
    }
    if flags & FLAG_BOTTOM_DEAD_SPOT != 0 {
        reader.u16()?;
    }

    let accumulated_energy_kj = if flags & FLAG_ACCUMULATED_ENERGY != 0 {
        Some(reader.u16()?)
    } else {
        None
    };

    Ok(CyclingPowerMeasurement {
        instantaneous_power,
        pedal_power_balance,
        accumulated_torque,
        wheel,
        crank,
        accumulated_energy_kj,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_only() {
        let m = decode(&[0x00, 0x00, 0xFA, 0x00]).unwrap();
        assert_eq!(m.instantaneous_power, 250);
        assert!(m.crank.is_none());
        assert!(m.pedal_power_balance.is_none());
    }

    #[test]
    fn test_balance_and_crank() {
        let mut bytes = vec![0x21, 0x00];
        bytes.extend_from_slice(&310i16.to_le_bytes());
        bytes.push(100); // 50 %
        bytes.extend_from_slice(&77u16.to_le_bytes());
        bytes.extend_from_slice(&4096u16.to_le_bytes());

        let m = decode(&bytes).unwrap();
        assert_eq!(m.instantaneous_power, 310);
        assert_eq!(m.pedal_power_balance, Some(50.0));
        assert_eq!(
            m.crank,
            Some(CrankRevolutions {
                cumulative_revolutions: 77,
                last_event_time: 4096
            })
        );
    }

    #[test]
    fn test_skips_extremes_to_reach_energy() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(FLAG_EXTREME_ANGLES | FLAG_ACCUMULATED_ENERGY).to_le_bytes());
        bytes.extend_from_slice(&200i16.to_le_bytes());
        bytes.extend_from_slice(&[0x01, 0x02, 0x03]);
        bytes.extend_from_slice(&512u16.to_le_bytes());

        let m = decode(&bytes).unwrap();
        assert_eq!(m.accumulated_energy_kj, Some(512));
    }

    #[test]
    fn test_missing_crank_bytes() {
        let result = decode(&[0x20, 0x00, 0xFA, 0x00, 0x01]);
        assert!(matches!(
            result,
            Err(ProtocolError::Truncated { needed: 6, got: 5, .. })
        ));
    }
}
