//! Heart Rate Measurement (0x2A37)

use serde::{Deserialize, Serialize};

use super::FieldReader;
use crate::error::ProtocolError;

const FLAG_HR_FORMAT_U16: u8 = 0x01;
const FLAG_CONTACT_DETECTED: u8 = 0x02;
const FLAG_CONTACT_SUPPORTED: u8 = 0x04;
const FLAG_ENERGY_EXPENDED: u8 = 0x08;
const FLAG_RR_INTERVALS: u8 = 0x10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartRateMeasurement {
    pub bpm: u16,
    /// `None` when the strap does not report skin contact
    pub sensor_contact: Option<bool>,
    /// Cumulative kJ since the strap was reset
    pub energy_expended_kj: Option<u16>,
    /// Beat-to-beat intervals in seconds
    pub rr_intervals: Vec<f64>,
}

pub fn decode(data: &[u8]) -> Result<HeartRateMeasurement, ProtocolError> {
    let mut reader = FieldReader::new(data, "heart rate measurement");
    let flags = reader.u8()?;

    let bpm = if flags & FLAG_HR_FORMAT_U16 != 0 {
        reader.u16()?
    } else {
        u16::from(reader.u8()?)
    };

    let sensor_contact = (flags & FLAG_CONTACT_SUPPORTED != 0).then_some(flags & FLAG_CONTACT_DETECTED != 0);

    let energy_expended_kj = if flags & FLAG_ENERGY_EXPENDED != 0 {
        Some(reader.u16()?)
    } else {
        None
    };

    let mut rr_intervals = Vec::new();
    if flags & FLAG_RR_INTERVALS != 0 {
        while reader.remaining() >= 2 {
            rr_intervals.push(f64::from(reader.u16()?) / 1024.0);
        }
    }

    Ok(HeartRateMeasurement {
        bpm,
        sensor_contact,
        energy_expended_kj,
        rr_intervals,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u8_heart_rate() {
        let m = decode(&[0x00, 72]).unwrap();
        assert_eq!(m.bpm, 72);
        assert_eq!(m.sensor_contact, None);
        assert!(m.rr_intervals.is_empty());
    }

    #[test]
    fn test_u16_heart_rate_with_contact() {
        let m = decode(&[0x07, 0x2C, 0x01]).unwrap();
        assert_eq!(m.bpm, 300);
        assert_eq!(m.sensor_contact, Some(true));
    }

    #[test]
    fn test_energy_and_rr_intervals() {
        // flags: energy + rr, hr 150, energy 0x0102, rr 1024 and 512
        let m = decode(&[0x18, 150, 0x02, 0x01, 0x00, 0x04, 0x00, 0x02]).unwrap();
        assert_eq!(m.bpm, 150);
        assert_eq!(m.energy_expended_kj, Some(258));
        assert_eq!(m.rr_intervals, vec![1.0, 0.5]);
    }

    #[test]
    fn test_truncated_buffer() {
        assert!(matches!(
            decode(&[0x01, 0x2C]),
            Err(ProtocolError::Truncated { needed: 3, got: 2, .. })
        ));
        assert!(decode(&[]).is_err());
    }
}
