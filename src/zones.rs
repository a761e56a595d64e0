use serde::{Deserialize, Serialize};

/// Lower bounds of power zones 2..7 as a fraction of FTP
///
/// - Z1: < 55% FTP (Active Recovery)
/// - Z2: 55-75% FTP (Endurance)
/// - Z3: 75-90% FTP (Tempo)
/// - Z4: 90-105% FTP (Lactate Threshold)
/// - Z5: 105-120% FTP (VO2 Max)
/// - Z6: 120-150% FTP (Anaerobic Capacity)
/// - Z7: >= 150% FTP (Sprint Power)
const POWER_BREAKPOINTS: [f64; 6] = [0.55, 0.75, 0.90, 1.05, 1.20, 1.50];

/// Lower bounds of heart rate zones 2..5 as a fraction of LTHR
///
/// - Z1: < 81% LTHR (Active Recovery)
/// - Z2: 81-90% LTHR (Aerobic Base)
/// - Z3: 90-94% LTHR (Aerobic)
/// - Z4: 94-100% LTHR (Lactate Threshold)
/// - Z5: >= 100% LTHR (VO2 Max)
const HEART_RATE_BREAKPOINTS: [f64; 4] = [0.81, 0.90, 0.94, 1.00];

const POWER_ZONE_NAMES: [&str; 7] = [
    "Active Recovery",
    "Endurance",
    "Tempo",
    "Lactate Threshold",
    "VO2 Max",
    "Anaerobic Capacity",
    "Sprint Power",
];

const HEART_RATE_ZONE_NAMES: [&str; 5] = [
    "Active Recovery",
    "Aerobic Base",
    "Aerobic",
    "Lactate Threshold",
    "VO2 Max",
];

pub const POWER_ZONE_COUNT: usize = POWER_BREAKPOINTS.len() + 1;
pub const HEART_RATE_ZONE_COUNT: usize = HEART_RATE_BREAKPOINTS.len() + 1;

/// Zone model selecting the breakpoint set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneModel {
    /// Seven Coggan zones relative to FTP
    Power,
    /// Five zones relative to LTHR
    HeartRate,
}

impl ZoneModel {
    pub fn breakpoints(&self) -> &'static [f64] {
        match self {
            ZoneModel::Power => &POWER_BREAKPOINTS,
            ZoneModel::HeartRate => &HEART_RATE_BREAKPOINTS,
        }
    }

    pub fn zone_count(&self) -> usize {
        self.breakpoints().len() + 1
    }

    pub fn zone_name(&self, zone: usize) -> &'static str {
        let names: &[&str] = match self {
            ZoneModel::Power => &POWER_ZONE_NAMES,
            ZoneModel::HeartRate => &HEART_RATE_ZONE_NAMES,
        };
        names.get(zone).copied().unwrap_or("Unknown")
    }
}

/// A zone's absolute range for a given threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneRange {
    /// Zero-based zone index
    pub zone: usize,
    pub name: String,
    /// Lower bound (inclusive)
    pub min: f64,
    /// Upper bound (exclusive, None means no upper limit)
    pub max: Option<f64>,
}

/// Maps a value and a personal threshold to a zone index
pub struct ZoneClassifier;

impl ZoneClassifier {
    /// Zero-based zone for `value` relative to `threshold`
    ///
    /// Intervals are half-open `[lower, upper)`; anything at or above the top
    /// breakpoint lands in the last zone. Negative, NaN and zero-threshold inputs
    /// still map to a zone so the function stays total.
    pub fn classify(model: ZoneModel, value: f64, threshold: f64) -> usize {
        let ratio = if threshold > 0.0 && threshold.is_finite() {
            value / threshold
        } else if value > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        if ratio.is_nan() {
            return 0;
        }

        model
            .breakpoints()
            .iter()
            .take_while(|&&breakpoint| ratio >= breakpoint)
            .count()
    }

    pub fn power_zone(watts: f64, ftp: u16) -> usize {
        Self::classify(ZoneModel::Power, watts, f64::from(ftp))
    }

    pub fn heart_rate_zone(bpm: f64, lthr: u16) -> usize {
        Self::classify(ZoneModel::HeartRate, bpm, f64::from(lthr))
    }

    /// Absolute zone table for display
    pub fn zone_table(model: ZoneModel, threshold: u16) -> Vec<ZoneRange> {
        let threshold = f64::from(threshold);
        let breakpoints = model.breakpoints();

        (0..model.zone_count())
            .map(|zone| ZoneRange {
                zone,
                name: model.zone_name(zone).to_string(),
                min: if zone == 0 {
                    0.0
                } else {
                    (breakpoints[zone - 1] * threshold).round()
                },
                max: breakpoints.get(zone).map(|b| (b * threshold).round()),
            })
            .collect()
    }
}

/// Time spent per zone
///
/// Accumulated in milliseconds so no fraction of a delta is lost; exposed as
/// whole seconds that always sum to the rounded total.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneTime {
    millis: Vec<u64>,
}

impl ZoneTime {
    pub fn new(model: ZoneModel) -> Self {
        Self {
            millis: vec![0; model.zone_count()],
        }
    }

    pub fn len(&self) -> usize {
        self.millis.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total_millis() == 0
    }

    /// Add time to a zone; out-of-range indices clamp to the last zone
    pub fn add(&mut self, zone: usize, millis: u64) {
        let last = self.millis.len().saturating_sub(1);
        if let Some(bucket) = self.millis.get_mut(zone.min(last)) {
            *bucket = bucket.saturating_add(millis);
        }
    }

    pub fn millis(&self) -> &[u64] {
        &self.millis
    }

    pub fn total_millis(&self) -> u64 {
        self.millis.iter().sum()
    }

    /// Whole seconds per zone using largest-remainder rounding
    pub fn seconds(&self) -> Vec<u64> {
        let target = (self.total_millis() + 500) / 1000;
        let mut seconds: Vec<u64> = self.millis.iter().map(|ms| ms / 1000).collect();
        let assigned: u64 = seconds.iter().sum();

        let mut order: Vec<usize> = (0..self.millis.len()).collect();
        order.sort_by(|&a, &b| {
            (self.millis[b] % 1000)
                .cmp(&(self.millis[a] % 1000))
                .then(a.cmp(&b))
        });

        for &zone in order.iter().take(target.saturating_sub(assigned) as usize) {
            seconds[zone] += 1;
        }

        seconds
    }
}
