//! Recording Session state machine
//!
//! Synchronous and clock-agnostic: every call carries its own timestamp, so the
//! async [`crate::engine`] host and the tests drive it the same way.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RecordingConfig;
use crate::control::{ControlTarget, SimulationParameters};
use crate::error::SessionError;
use crate::metrics::{AdvancedMetrics, LapSummary, MetricsAggregator, MetricsSnapshot};
use crate::models::{AthleteProfile, SensorReading};
use crate::persistence::SessionRecord;
use crate::plan::{FlatPlan, IntensityTarget, PlanStepExecutor, StepChange, WorkoutStep};

/// Lap name used when no plan step is active
const FREE_RIDE_LAP: &str = "Free ride";

/// Recording lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Recording,
    Paused,
    Finished,
    Aborted,
}

impl SessionState {
    /// Recording or paused
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Recording | SessionState::Paused)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Finished | SessionState::Aborted)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Pending => "pending",
            SessionState::Recording => "recording",
            SessionState::Paused => "paused",
            SessionState::Finished => "finished",
            SessionState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Plan progress produced by a lifecycle call or tick
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutcome {
    pub step_changes: Vec<StepChange>,
    /// Target to forward to controllable trainers, if any
    pub control: Option<ControlTarget>,
}

/// Result of one recording tick
#[derive(Debug, Clone, PartialEq)]
pub struct TickOutcome {
    pub snapshot: MetricsSnapshot,
    pub step_changes: Vec<StepChange>,
    pub control: Option<ControlTarget>,
}

/// Final, immutable result of a finished session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub snapshot: MetricsSnapshot,
    pub advanced: AdvancedMetrics,
    pub laps: Vec<LapSummary>,
}

/// Convert a step's intensity targets into a trainer command
///
/// Power targets win over grade, grade over resistance. Percent-of-FTP targets
/// need a profile FTP; without one they are skipped.
pub fn resolve_control_target(step: &WorkoutStep, athlete: &AthleteProfile) -> Option<ControlTarget> {
    let power = step.targets.iter().find_map(|target| match *target {
        IntensityTarget::Watts(watts) => Some(watts),
        IntensityTarget::PercentFtp(pct) => match athlete.ftp {
            Some(ftp) => Some((f64::from(ftp) * pct / 100.0).round()),
            None => {
                warn!(step = %step.name, "Percent-of-FTP target skipped: no FTP in athlete profile");
                None
            }
        },
        _ => None,
    });
    if let Some(watts) = power {
        return Some(ControlTarget::Power { watts });
    }

    let grade = step.targets.iter().find_map(|target| match *target {
        IntensityTarget::Grade(pct) => Some(pct),
        _ => None,
    });
    if let Some(pct) = grade {
        return Some(ControlTarget::Simulation(SimulationParameters::grade(pct)));
    }

    step.targets.iter().find_map(|target| match *target {
        IntensityTarget::Resistance(level) => Some(ControlTarget::Resistance { level }),
        _ => None,
    })
}

/// One recording from start to finish or abort
#[derive(Debug, Clone)]
pub struct RecordingSession {
    id: Uuid,
    state: SessionState,
    athlete: AthleteProfile,
    plan: Option<FlatPlan>,
    aggregator: MetricsAggregator,
    executor: PlanStepExecutor,
    manual_override: bool,
    /// Last target handed out for the trainers
    applied_target: Option<ControlTarget>,
    /// Override was cleared while paused; the step target goes out on resume
    reapply_on_resume: bool,
    repetitions: u32,
    laps: Vec<LapSummary>,
    started_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    summary: Option<SessionSummary>,
}

impl RecordingSession {
    pub fn new(config: &RecordingConfig, athlete: AthleteProfile, plan: Option<FlatPlan>) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SessionState::Pending,
            aggregator: MetricsAggregator::new(config, &athlete),
            athlete,
            plan,
            executor: PlanStepExecutor::new(),
            manual_override: false,
            applied_target: None,
            reapply_on_resume: false,
            repetitions: 0,
            laps: Vec::new(),
            started_at: None,
            updated_at: None,
            summary: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn athlete(&self) -> &AthleteProfile {
        &self.athlete
    }

    pub fn executor(&self) -> &PlanStepExecutor {
        &self.executor
    }

    pub fn is_manual_override(&self) -> bool {
        self.manual_override
    }

    /// Target the plan currently wants on the trainers
    ///
    /// `None` while overridden or not recording.
    pub fn active_target(&self) -> Option<ControlTarget> {
        if self.manual_override || self.state != SessionState::Recording {
            return None;
        }
        self.applied_target
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn laps(&self) -> &[LapSummary] {
        &self.laps
    }

    pub fn summary(&self) -> Option<&SessionSummary> {
        self.summary.as_ref()
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> MetricsSnapshot {
        match &self.summary {
            Some(summary) => summary.snapshot.clone(),
            None => self.aggregator.snapshot(now),
        }
    }

    /// Persistable copy of the current state
    pub fn record(&self, now: DateTime<Utc>) -> SessionRecord {
        SessionRecord {
            id: self.id,
            state: self.state,
            started_at: self.started_at,
            updated_at: self.updated_at.unwrap_or(now).max(now),
            snapshot: self.snapshot(now),
            laps: self.laps.clone(),
            advanced: self.summary.as_ref().map(|summary| summary.advanced.clone()),
        }
    }

    /// Pending to recording; enters the first plan step
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<StepOutcome, SessionError> {
        self.require("start", &[SessionState::Pending])?;

        self.state = SessionState::Recording;
        self.started_at = Some(now);
        self.updated_at = Some(now);
        info!(session = %self.id, "Recording started");

        let step_changes = match self.plan.clone() {
            Some(plan) => self.executor.start(plan, self.aggregator.distance_m(), self.repetitions),
            None => Vec::new(),
        };
        if step_changes.is_empty() {
            self.aggregator.start_lap(None, FREE_RIDE_LAP);
        }
        Ok(self.on_step_changes(step_changes))
    }

    pub fn pause(&mut self, now: DateTime<Utc>) -> Result<(), SessionError> {
        self.require("pause", &[SessionState::Recording])?;
        self.state = SessionState::Paused;
        self.updated_at = Some(now);
        self.aggregator.break_delta_chain();
        info!(session = %self.id, "Recording paused");
        Ok(())
    }

    /// Paused to recording; returns the step target when the override was
    /// cleared during the pause
    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<Option<ControlTarget>, SessionError> {
        self.require("resume", &[SessionState::Paused])?;
        self.state = SessionState::Recording;
        self.updated_at = Some(now);
        self.aggregator.break_delta_chain();
        info!(session = %self.id, "Recording resumed");

        let reapply = std::mem::take(&mut self.reapply_on_resume) && !self.manual_override;
        Ok(reapply.then(|| self.reissue_step_target()))
    }

    /// Finalize metrics and freeze the session
    pub fn finish(&mut self, now: DateTime<Utc>) -> Result<SessionSummary, SessionError> {
        self.require("finish", &[SessionState::Recording, SessionState::Paused])?;

        let advanced = self.aggregator.finalize(now);
        if let Some(lap) = self.aggregator.close_lap() {
            self.laps.push(lap);
        }

        self.state = SessionState::Finished;
        self.updated_at = Some(now);
        let summary = SessionSummary {
            id: self.id,
            started_at: self.started_at.unwrap_or(now),
            finished_at: now,
            snapshot: self.aggregator.snapshot(now),
            advanced,
            laps: self.laps.clone(),
        };
        info!(
            session = %self.id,
            elapsed_s = summary.snapshot.elapsed.as_secs(),
            normalized_power = ?summary.advanced.normalized_power,
            laps = summary.laps.len(),
            "Recording finished"
        );
        self.summary = Some(summary.clone());
        Ok(summary)
    }

    pub fn abort(&mut self, now: DateTime<Utc>) -> Result<(), SessionError> {
        self.require(
            "abort",
            &[SessionState::Pending, SessionState::Recording, SessionState::Paused],
        )?;
        self.state = SessionState::Aborted;
        self.updated_at = Some(now);
        info!(session = %self.id, "Recording aborted");
        Ok(())
    }

    /// Fold an accepted reading in; ignored unless recording
    pub fn ingest(&mut self, reading: &SensorReading) -> Option<MetricsSnapshot> {
        if self.state != SessionState::Recording {
            debug!(session = %self.id, state = %self.state, metric = %reading.metric, "Reading ignored");
            return None;
        }
        self.aggregator.ingest(reading);
        self.updated_at = Some(reading.timestamp);
        Some(self.aggregator.snapshot(reading.timestamp))
    }

    /// Advance session clocks by one tick; `None` unless recording
    pub fn tick(&mut self, dt: Duration, now: DateTime<Utc>) -> Option<TickOutcome> {
        if self.state != SessionState::Recording {
            return None;
        }

        self.aggregator.tick(dt);
        let changes = self.executor.tick(dt, self.aggregator.distance_m(), self.repetitions);
        let outcome = self.on_step_changes(changes);
        self.updated_at = Some(now);

        Some(TickOutcome {
            snapshot: self.aggregator.snapshot(now),
            step_changes: outcome.step_changes,
            control: outcome.control,
        })
    }

    /// Completed repetitions reported by the athlete or a rep counter
    pub fn add_repetitions(&mut self, count: u32) {
        self.repetitions = self.repetitions.saturating_add(count);
    }

    /// End the active step early (the only way out of an open-ended step)
    pub fn advance_step(&mut self) -> Result<StepOutcome, SessionError> {
        self.require("advance step", &[SessionState::Recording])?;
        let changes = self
            .executor
            .advance(self.aggregator.distance_m(), self.repetitions)
            .into_iter()
            .collect();
        Ok(self.on_step_changes(changes))
    }

    /// Suspend or restore automatic target forwarding
    ///
    /// Turning the override off while recording returns the current step's
    /// target once so the trainer never stays on a manual value. Turned off
    /// during a pause, the target is held back until `resume`.
    pub fn set_manual_override(&mut self, enabled: bool) -> Result<Option<ControlTarget>, SessionError> {
        self.require(
            "set manual override",
            &[SessionState::Pending, SessionState::Recording, SessionState::Paused],
        )?;
        let was_enabled = std::mem::replace(&mut self.manual_override, enabled);
        self.reapply_on_resume = false;
        info!(session = %self.id, enabled, "Manual override");

        if enabled || !was_enabled {
            return Ok(None);
        }
        match self.state {
            SessionState::Recording => Ok(Some(self.reissue_step_target())),
            SessionState::Paused => {
                self.reapply_on_resume = true;
                Ok(None)
            }
            // Start forwards the first step's target
            _ => Ok(None),
        }
    }

    fn reissue_step_target(&mut self) -> ControlTarget {
        let target = self
            .executor
            .current_step()
            .and_then(|step| resolve_control_target(step, &self.athlete))
            .unwrap_or(ControlTarget::Neutral);
        self.applied_target = Some(target);
        target
    }

    fn require(&self, action: &'static str, allowed: &[SessionState]) -> Result<(), SessionError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            warn!(session = %self.id, action, state = %self.state, "Illegal session transition");
            Err(SessionError::IllegalTransition {
                action,
                state: self.state,
            })
        }
    }

    /// Close and open laps, then pick the target for the newest step
    fn on_step_changes(&mut self, step_changes: Vec<StepChange>) -> StepOutcome {
        let Some(last) = step_changes.last() else {
            return StepOutcome::default();
        };

        for change in &step_changes {
            let name = change
                .step
                .as_ref()
                .map_or_else(|| FREE_RIDE_LAP.to_string(), |step| step.name.clone());
            if let Some(lap) = self.aggregator.start_lap(change.index, name) {
                self.laps.push(lap);
            }
        }

        let control = if self.manual_override {
            None
        } else {
            let target = last
                .step
                .as_ref()
                .and_then(|step| resolve_control_target(step, &self.athlete));
            match (target, self.applied_target) {
                (Some(target), _) => Some(target),
                // Release a trainer left on the previous step's target
                (None, Some(previous)) if previous != ControlTarget::Neutral => Some(ControlTarget::Neutral),
                (None, _) => None,
            }
        };
        if let Some(target) = control {
            self.applied_target = Some(target);
        }

        StepOutcome { step_changes, control }
    }
}
