//! Metrics Aggregator
//!
//! Folds accepted readings into live state: current values, rolling averages,
//! maxima, zone time, and cumulative totals. Advanced power metrics are only
//! computed by [`MetricsAggregator::finalize`] from the full power history.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use crate::config::{duration_ms, RecordingConfig};
use crate::models::{AthleteProfile, MetricKind, SensorReading};
use crate::zones::{ZoneClassifier, ZoneModel, ZoneTime};

/// Metrics with rolling averages and running maxima
const WINDOWED: [MetricKind; 4] = [
    MetricKind::Power,
    MetricKind::HeartRate,
    MetricKind::Cadence,
    MetricKind::Speed,
];

/// Rolling window for normalized power
const NP_WINDOW_SECONDS: usize = 30;

const JOULES_PER_KCAL: f64 = 4184.0;

/// Read-only copy of the live aggregate state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub taken_at: DateTime<Utc>,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
    #[serde(with = "duration_ms")]
    pub moving_time: Duration,
    pub current: BTreeMap<MetricKind, f64>,
    pub rolling_average: BTreeMap<MetricKind, f64>,
    pub maximum: BTreeMap<MetricKind, f64>,
    pub distance_m: f64,
    pub work_kj: f64,
    pub ascent_m: f64,
    pub descent_m: f64,
    pub calories_kcal: f64,
    pub power_zone_seconds: Vec<u64>,
    pub heart_rate_zone_seconds: Vec<u64>,
}

impl MetricsSnapshot {
    pub fn current(&self, metric: MetricKind) -> Option<f64> {
        self.current.get(&metric).copied()
    }

    pub fn rolling_average(&self, metric: MetricKind) -> Option<f64> {
        self.rolling_average.get(&metric).copied()
    }

    pub fn maximum(&self, metric: MetricKind) -> Option<f64> {
        self.maximum.get(&metric).copied()
    }
}

/// Whole-session metrics, computed once at finalize
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvancedMetrics {
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    /// Time-weighted average power
    pub average_power: Option<u16>,
    /// Normalized Power (30-second rolling average)
    pub normalized_power: Option<u16>,
    /// Intensity Factor (IF = NP/FTP)
    pub intensity_factor: Option<Decimal>,
    /// TSS = duration_hours × IF² × 100
    pub training_stress_score: Option<Decimal>,
    /// Variability Index (VI = NP/Average Power)
    pub variability_index: Option<Decimal>,
    /// Efficiency Factor (EF = NP/Average HR)
    pub efficiency_factor: Option<Decimal>,
    /// Time-weighted average heart rate
    pub average_heart_rate: Option<u16>,
}

/// One closed lap (one plan step, or the whole ride when unplanned)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LapSummary {
    pub step_index: Option<usize>,
    pub step_name: String,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    pub average_power: Option<f64>,
    pub average_heart_rate: Option<f64>,
    pub distance_m: f64,
}

/// Cumulative counters a lap subtracts at its close
#[derive(Debug, Clone, Copy, Default)]
struct Totals {
    elapsed: Duration,
    work_j: f64,
    power_ms: u64,
    heart_beats_weighted: f64,
    heart_rate_ms: u64,
    distance_m: f64,
}

#[derive(Debug, Clone)]
struct OpenLap {
    step_index: Option<usize>,
    step_name: String,
    start: Totals,
}

/// Owns all live aggregate state for one session
#[derive(Debug, Clone)]
pub struct MetricsAggregator {
    rolling_window: Duration,
    moving_speed_threshold: f64,
    max_sample_gap: Duration,
    mechanical_efficiency: f64,
    ftp: Option<u16>,
    lthr: Option<u16>,

    current: BTreeMap<MetricKind, f64>,
    windows: HashMap<MetricKind, VecDeque<(DateTime<Utc>, f64)>>,
    maximum: BTreeMap<MetricKind, f64>,
    /// Previous sample per metric for delta attribution
    previous: HashMap<MetricKind, (DateTime<Utc>, f64)>,
    power_zones: ZoneTime,
    heart_rate_zones: ZoneTime,

    totals: Totals,
    moving_time: Duration,
    ascent_m: f64,
    descent_m: f64,
    odometer: Option<f64>,
    has_distance_source: bool,
    last_altitude: Option<f64>,

    power_history: Vec<(DateTime<Utc>, f64)>,
    last_seen: Option<DateTime<Utc>>,
    lap: Option<OpenLap>,
}

impl MetricsAggregator {
    pub fn new(config: &RecordingConfig, athlete: &AthleteProfile) -> Self {
        Self {
            rolling_window: config.rolling_window,
            moving_speed_threshold: config.moving_speed_threshold,
            max_sample_gap: config.max_sample_gap,
            mechanical_efficiency: config.mechanical_efficiency,
            ftp: athlete.ftp,
            lthr: athlete.lthr,
            current: BTreeMap::new(),
            windows: HashMap::new(),
            maximum: BTreeMap::new(),
            previous: HashMap::new(),
            power_zones: ZoneTime::new(ZoneModel::Power),
            heart_rate_zones: ZoneTime::new(ZoneModel::HeartRate),
            totals: Totals::default(),
            moving_time: Duration::ZERO,
            ascent_m: 0.0,
            descent_m: 0.0,
            odometer: None,
            has_distance_source: false,
            last_altitude: None,
            power_history: Vec::new(),
            last_seen: None,
            lap: None,
        }
    }

    /// Fold one accepted reading into the live state
    pub fn ingest(&mut self, reading: &SensorReading) {
        let metric = reading.metric;
        let value = reading.value;
        let at = reading.timestamp;
        self.last_seen = Some(self.last_seen.map_or(at, |seen| seen.max(at)));

        self.current.insert(metric, value);

        if WINDOWED.contains(&metric) {
            let window = self.windows.entry(metric).or_default();
            window.push_back((at, value));
            let span = chrono::Duration::from_std(self.rolling_window).unwrap_or_else(|_| chrono::Duration::zero());
            let horizon = at - span;
            while window.front().is_some_and(|(t, _)| *t < horizon) {
                window.pop_front();
            }

            let max = self.maximum.entry(metric).or_insert(value);
            if value > *max {
                *max = value;
            }
        }

        match metric {
            MetricKind::Power | MetricKind::HeartRate => {
                if let Some((since, held)) = self.previous.insert(metric, (at, value)) {
                    if let Some(dt) = self.attributable(since, at) {
                        self.attribute(metric, held, dt);
                    }
                }
                if metric == MetricKind::Power {
                    self.power_history.push((at, value));
                }
            }
            MetricKind::Distance => {
                self.has_distance_source = true;
                if let Some(previous) = self.odometer {
                    // A smaller odometer means the device reset; re-baseline
                    if value >= previous {
                        self.totals.distance_m += value - previous;
                    }
                }
                self.odometer = Some(value);
            }
            MetricKind::Altitude => {
                if let Some(previous) = self.last_altitude {
                    let delta = value - previous;
                    if delta > 0.0 {
                        self.ascent_m += delta;
                    } else {
                        self.descent_m -= delta;
                    }
                }
                self.last_altitude = Some(value);
            }
            MetricKind::Cadence | MetricKind::Speed | MetricKind::Temperature | MetricKind::Battery => {}
        }
    }

    /// Advance the session clock by one tick
    pub fn tick(&mut self, dt: Duration) {
        self.totals.elapsed += dt;

        let speed = self.current.get(&MetricKind::Speed).copied().unwrap_or(0.0);
        if speed > self.moving_speed_threshold {
            self.moving_time += dt;
        }
        if !self.has_distance_source {
            self.totals.distance_m += speed * dt.as_secs_f64();
        }
    }

    /// Forget previous-sample timestamps so a pause is never attributed
    pub fn break_delta_chain(&mut self) {
        self.previous.clear();
    }

    pub fn elapsed(&self) -> Duration {
        self.totals.elapsed
    }

    pub fn distance_m(&self) -> f64 {
        self.totals.distance_m
    }

    pub fn power_zones(&self) -> &ZoneTime {
        &self.power_zones
    }

    pub fn heart_rate_zones(&self) -> &ZoneTime {
        &self.heart_rate_zones
    }

    pub fn snapshot(&self, taken_at: DateTime<Utc>) -> MetricsSnapshot {
        let rolling_average = self
            .windows
            .iter()
            .filter(|(_, window)| !window.is_empty())
            .map(|(metric, window)| {
                let sum: f64 = window.iter().map(|(_, v)| v).sum();
                (*metric, sum / window.len() as f64)
            })
            .collect();

        MetricsSnapshot {
            taken_at,
            elapsed: self.totals.elapsed,
            moving_time: self.moving_time,
            current: self.current.clone(),
            rolling_average,
            maximum: self.maximum.clone(),
            distance_m: self.totals.distance_m,
            work_kj: self.totals.work_j / 1000.0,
            ascent_m: self.ascent_m,
            descent_m: self.descent_m,
            calories_kcal: self.calories_kcal(),
            power_zone_seconds: self.power_zones.seconds(),
            heart_rate_zone_seconds: self.heart_rate_zones.seconds(),
        }
    }

    /// Open a lap; any open lap is closed first and returned
    pub fn start_lap(&mut self, step_index: Option<usize>, step_name: impl Into<String>) -> Option<LapSummary> {
        let closed = self.close_lap();
        self.lap = Some(OpenLap {
            step_index,
            step_name: step_name.into(),
            start: self.totals,
        });
        closed
    }

    pub fn close_lap(&mut self) -> Option<LapSummary> {
        let lap = self.lap.take()?;
        let start = lap.start;
        let end = self.totals;

        Some(LapSummary {
            step_index: lap.step_index,
            step_name: lap.step_name,
            duration: end.elapsed.saturating_sub(start.elapsed),
            average_power: weighted_mean(end.work_j - start.work_j, end.power_ms - start.power_ms),
            average_heart_rate: weighted_mean(
                end.heart_beats_weighted - start.heart_beats_weighted,
                end.heart_rate_ms - start.heart_rate_ms,
            ),
            distance_m: end.distance_m - start.distance_m,
        })
    }

    /// Whole-session metrics
    ///
    /// The interval from the last power and heart rate samples up to `end` is
    /// attributed first, so the zone arrays cover the full recording.
    pub fn finalize(&mut self, end: DateTime<Utc>) -> AdvancedMetrics {
        for metric in [MetricKind::Power, MetricKind::HeartRate] {
            if let Some((since, held)) = self.previous.remove(&metric) {
                if let Some(dt) = self.attributable(since, end) {
                    self.attribute(metric, held, dt);
                }
            }
        }

        let average_power = weighted_mean(self.totals.work_j, self.totals.power_ms);
        let average_heart_rate = weighted_mean(self.totals.heart_beats_weighted, self.totals.heart_rate_ms);
        let normalized_power = self.normalized_power(end);

        let ratio = |numerator: u16, denominator: f64| -> Option<Decimal> {
            let denominator = Decimal::from_f64(denominator.round())?;
            if denominator.is_zero() {
                return None;
            }
            Some((Decimal::from(numerator) / denominator).round_dp(3))
        };

        let intensity_factor = normalized_power
            .zip(self.ftp)
            .and_then(|(np, ftp)| ratio(np, f64::from(ftp)));
        let training_stress_score = intensity_factor.map(|intensity| {
            let hours = Decimal::from_f64(self.totals.elapsed.as_secs_f64() / 3600.0).unwrap_or(Decimal::ZERO);
            (hours * intensity * intensity * Decimal::from(100)).round_dp(1)
        });
        let variability_index = normalized_power
            .zip(average_power)
            .and_then(|(np, avg)| ratio(np, avg));
        let efficiency_factor = normalized_power
            .zip(average_heart_rate)
            .and_then(|(np, hr)| ratio(np, hr));

        AdvancedMetrics {
            duration: self.totals.elapsed,
            average_power: average_power.map(|p| p.round() as u16),
            normalized_power,
            intensity_factor,
            training_stress_score,
            variability_index,
            efficiency_factor,
            average_heart_rate: average_heart_rate.map(|hr| hr.round() as u16),
        }
    }

    fn attributable(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> Option<Duration> {
        let dt = (until - since).to_std().ok()?;
        (dt <= self.max_sample_gap).then_some(dt)
    }

    /// Credit `dt` at the held value to zones and work
    fn attribute(&mut self, metric: MetricKind, held: f64, dt: Duration) {
        let ms = dt.as_millis() as u64;
        match metric {
            MetricKind::Power => {
                self.totals.work_j += held * dt.as_secs_f64();
                self.totals.power_ms += ms;
                if let Some(ftp) = self.ftp {
                    self.power_zones.add(ZoneClassifier::power_zone(held, ftp), ms);
                }
            }
            MetricKind::HeartRate => {
                self.totals.heart_beats_weighted += held * dt.as_secs_f64();
                self.totals.heart_rate_ms += ms;
                if let Some(lthr) = self.lthr {
                    self.heart_rate_zones.add(ZoneClassifier::heart_rate_zone(held, lthr), ms);
                }
            }
            _ => {}
        }
    }

    fn calories_kcal(&self) -> f64 {
        self.totals.work_j / self.mechanical_efficiency / JOULES_PER_KCAL
    }

    /// 1 Hz resample holding each sample until the next (or for at most the
    /// max sample gap), then 30 s rolling average, fourth power, mean, fourth root
    fn normalized_power(&self, end: DateTime<Utc>) -> Option<u16> {
        let (first, _) = *self.power_history.first()?;
        let seconds = (end - first).num_seconds().max(1) as usize;
        let gap = self.max_sample_gap.as_secs() as i64;

        let mut series = Vec::with_capacity(seconds);
        let mut cursor = 0;
        for second in 0..seconds {
            let t = first + chrono::Duration::seconds(second as i64);
            while cursor + 1 < self.power_history.len() && self.power_history[cursor + 1].0 <= t {
                cursor += 1;
            }
            let (sampled_at, watts) = self.power_history[cursor];
            let held = (t - sampled_at).num_seconds() <= gap;
            series.push(if held { watts } else { 0.0 });
        }

        let window_size = NP_WINDOW_SECONDS.min(series.len());
        let rolling: Vec<f64> = series
            .windows(window_size)
            .map(|window| window.iter().sum::<f64>() / window_size as f64)
            .collect();
        let mean_fourth = rolling.iter().map(|avg| avg.powi(4)).sum::<f64>() / rolling.len() as f64;

        Some(mean_fourth.powf(0.25).round() as u16)
    }
}

fn weighted_mean(weighted_sum: f64, millis: u64) -> Option<f64> {
    (millis > 0).then(|| weighted_sum / (millis as f64 / 1000.0))
}
