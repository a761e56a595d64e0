//! Cycling Speed and Cadence Measurement (0x2A5B) and revolution-counter math

use serde::{Deserialize, Serialize};

use super::FieldReader;
use crate::error::ProtocolError;

const FLAG_WHEEL_REVOLUTIONS: u8 = 0x01;
const FLAG_CRANK_REVOLUTIONS: u8 = 0x02;

/// Event times are in 1/1024 s
const EVENT_TIME_UNITS_PER_SECOND: f64 = 1024.0;

/// Unchanged event times before a stopped crank or wheel reports zero
const IDLE_EVENTS_BEFORE_ZERO: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WheelRevolutions {
    pub cumulative_revolutions: u32,
    /// 1/1024 s, rolls over every 64 s
    pub last_event_time: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrankRevolutions {
    pub cumulative_revolutions: u16,
    /// 1/1024 s, rolls over every 64 s
    pub last_event_time: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CscMeasurement {
    pub wheel: Option<WheelRevolutions>,
    pub crank: Option<CrankRevolutions>,
}

pub fn decode(data: &[u8]) -> Result<CscMeasurement, ProtocolError> {
    let mut reader = FieldReader::new(data, "csc measurement");
    let flags = reader.u8()?;

    let wheel = if flags & FLAG_WHEEL_REVOLUTIONS != 0 {
        Some(WheelRevolutions {
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

    Ok(CscMeasurement { wheel, crank })
}

/// Derives a rate from successive cumulative revolution counters
///
/// Both the counter and the event time wrap; deltas are taken modulo their width.
#[derive(Debug, Default)]
pub struct RevolutionTracker {
    previous: Option<(u32, u16)>,
    idle_events: u8,
}

impl RevolutionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Crank cadence in rpm, `None` until two distinct events were seen
    pub fn cadence_rpm(&mut self, revolutions: u16, event_time: u16) -> Option<f64> {
        self.revolutions_per_second(u32::from(revolutions), event_time, u64::from(u16::MAX) + 1)
            .map(|rps| rps * 60.0)
    }

    /// Wheel speed in m/s for the given circumference
    pub fn speed_mps(&mut self, revolutions: u32, event_time: u16, circumference_m: f64) -> Option<f64> {
        self.revolutions_per_second(revolutions, event_time, u64::from(u32::MAX) + 1)
            .map(|rps| rps * circumference_m)
    }

    fn revolutions_per_second(&mut self, revolutions: u32, event_time: u16, modulus: u64) -> Option<f64> {
        let (previous_revolutions, previous_time) = self.previous.replace((revolutions, event_time))?;

        let delta_time = event_time.wrapping_sub(previous_time);
        if delta_time == 0 {
            self.idle_events = self.idle_events.saturating_add(1);
            return (self.idle_events >= IDLE_EVENTS_BEFORE_ZERO).then_some(0.0);
        }
        self.idle_events = 0;

        let delta_revolutions =
            (u64::from(revolutions) + modulus - u64::from(previous_revolutions)) % modulus;

        Some(delta_revolutions as f64 / (f64::from(delta_time) / EVENT_TIME_UNITS_PER_SECOND))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_wheel_and_crank() {
        let mut bytes = vec![0x03];
        bytes.extend_from_slice(&1000u32.to_le_bytes());
        bytes.extend_from_slice(&2048u16.to_le_bytes());
        bytes.extend_from_slice(&50u16.to_le_bytes());
        bytes.extend_from_slice(&1024u16.to_le_bytes());

        let m = decode(&bytes).unwrap();
        assert_eq!(
            m.wheel,
            Some(WheelRevolutions {
                cumulative_revolutions: 1000,
                last_event_time: 2048
            })
        );
        assert_eq!(m.crank.map(|c| c.cumulative_revolutions), Some(50));
    }

    #[test]
    fn test_decode_truncated() {
        assert!(decode(&[0x01, 0x00, 0x00]).is_err());
    }

    #[test]
    fn test_speed_from_wheel() {
        let mut tracker = RevolutionTracker::new();
        assert_eq!(tracker.speed_mps(100, 0, 2.0), None);
        // 5 revolutions in 1 s on a 2 m wheel
        assert_eq!(tracker.speed_mps(105, 1024, 2.0), Some(10.0));
    }

    #[test]
    fn test_cadence_handles_wraparound() {
        let mut tracker = RevolutionTracker::new();
        tracker.cadence_rpm(u16::MAX, u16::MAX - 511);
        // 2 revolutions across the counter and timer rollover in 1 s
        let rpm = tracker.cadence_rpm(1, 512).unwrap();
        assert!((rpm - 120.0).abs() < 1e-9);
    }

    #[test]
    fn test_idle_crank_reports_zero() {
        let mut tracker = RevolutionTracker::new();
        tracker.cadence_rpm(10, 1024);
        assert_eq!(tracker.cadence_rpm(10, 1024), None);
        assert_eq!(tracker.cadence_rpm(10, 1024), None);
        assert_eq!(tracker.cadence_rpm(10, 1024), Some(0.0));
    }
}
