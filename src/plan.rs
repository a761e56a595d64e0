//! Structured workouts and the Plan Step Executor
//!
//! Plans are authored as nested [`PlanBlock`]s and flattened once into an
//! immutable [`FlatPlan`] before a session starts. The executor only ever
//! walks that flat list by index.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Intensity target attached to a step
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum IntensityTarget {
    /// Percent of FTP, e.g. 80.0
    PercentFtp(f64),
    Watts(f64),
    /// Absolute heart rate (bpm)
    HeartRate(f64),
    /// Percent of LTHR
    PercentLthr(f64),
    /// rpm
    Cadence(f64),
    /// m/s
    Speed(f64),
    /// Perceived effort, 1-10
    Rpe(u8),
    /// Simulated road grade in percent
    Grade(f64),
    /// Trainer resistance level
    Resistance(f64),
}

impl fmt::Display for IntensityTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntensityTarget::PercentFtp(pct) => write!(f, "{:.0}% FTP", pct),
            IntensityTarget::Watts(watts) => write!(f, "{:.0} W", watts),
            IntensityTarget::HeartRate(bpm) => write!(f, "{:.0} bpm", bpm),
            IntensityTarget::PercentLthr(pct) => write!(f, "{:.0}% LTHR", pct),
            IntensityTarget::Cadence(rpm) => write!(f, "{:.0} rpm", rpm),
            IntensityTarget::Speed(mps) => write!(f, "{:.1} m/s", mps),
            IntensityTarget::Rpe(rpe) => write!(f, "RPE {}", rpe),
            IntensityTarget::Grade(pct) => write!(f, "{:.1}% grade", pct),
            IntensityTarget::Resistance(level) => write!(f, "resistance {:.1}", level),
        }
    }
}

/// How a step ends
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum StepDuration {
    Time(#[serde(with = "crate::config::duration_ms")] Duration),
    /// Meters covered since the step began
    Distance(f64),
    Repetitions(u32),
    /// Only an explicit advance ends the step
    UntilFinished,
}

/// One leaf of a flattened plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkoutStep {
    pub name: String,
    pub duration: StepDuration,
    #[serde(default)]
    pub targets: Vec<IntensityTarget>,
}

impl WorkoutStep {
    pub fn new(name: impl Into<String>, duration: StepDuration) -> Self {
        Self {
            name: name.into(),
            duration,
            targets: Vec::new(),
        }
    }

    pub fn timed(name: impl Into<String>, seconds: u64) -> Self {
        Self::new(name, StepDuration::Time(Duration::from_secs(seconds)))
    }

    pub fn open_ended(name: impl Into<String>) -> Self {
        Self::new(name, StepDuration::UntilFinished)
    }

    pub fn with_target(mut self, target: IntensityTarget) -> Self {
        self.targets.push(target);
        self
    }
}

/// Authoring form of a plan: steps and nested repeats
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanBlock {
    Step(WorkoutStep),
    Repeat { count: u32, blocks: Vec<PlanBlock> },
}

/// Immutable, pre-expanded step sequence
///
/// Cheap to clone; every clone shares the same steps, so editing the source
/// blocks afterwards cannot reach a running session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatPlan {
    steps: Arc<[WorkoutStep]>,
}

impl FlatPlan {
    /// Expand nested repeats depth-first
    pub fn flatten(blocks: &[PlanBlock]) -> Self {
        let mut steps = Vec::new();
        expand(blocks, &mut steps);
        Self { steps: steps.into() }
    }

    pub fn from_steps(steps: Vec<WorkoutStep>) -> Self {
        Self { steps: steps.into() }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&WorkoutStep> {
        self.steps.get(index)
    }

    pub fn steps(&self) -> &[WorkoutStep] {
        &self.steps
    }

    /// Sum of all timed steps
    pub fn total_time(&self) -> Duration {
        self.steps
            .iter()
            .filter_map(|step| match step.duration {
                StepDuration::Time(duration) => Some(duration),
                _ => None,
            })
            .sum()
    }
}

fn expand(blocks: &[PlanBlock], out: &mut Vec<WorkoutStep>) {
    for block in blocks {
        match block {
            PlanBlock::Step(step) => out.push(step.clone()),
            PlanBlock::Repeat { count, blocks } => {
                for round in 1..=*count {
                    let start = out.len();
                    expand(blocks, out);
                    if *count > 1 {
                        for step in &mut out[start..] {
                            step.name = format!("{} ({}/{})", step.name, round, count);
                        }
                    }
                }
            }
        }
    }
}

/// Emitted every time the active index changes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepChange {
    pub previous: Option<usize>,
    /// `None` once the plan is complete
    pub index: Option<usize>,
    pub step: Option<WorkoutStep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ExecutorState {
    Idle,
    InStep {
        index: usize,
        #[serde(with = "crate::config::duration_ms")]
        elapsed: Duration,
    },
    Complete,
}

/// Walks a flat plan by time, distance or repetitions
#[derive(Debug, Clone)]
pub struct PlanStepExecutor {
    plan: Option<FlatPlan>,
    state: ExecutorState,
    /// Distance and rep counters at the start of the active step
    distance_base: f64,
    reps_base: u32,
}

impl Default for PlanStepExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl PlanStepExecutor {
    pub fn new() -> Self {
        Self {
            plan: None,
            state: ExecutorState::Idle,
            distance_base: 0.0,
            reps_base: 0,
        }
    }

    pub fn state(&self) -> ExecutorState {
        self.state
    }

    pub fn plan(&self) -> Option<&FlatPlan> {
        self.plan.as_ref()
    }

    pub fn current_index(&self) -> Option<usize> {
        match self.state {
            ExecutorState::InStep { index, .. } => Some(index),
            _ => None,
        }
    }

    pub fn current_step(&self) -> Option<&WorkoutStep> {
        let index = self.current_index()?;
        self.plan.as_ref()?.get(index)
    }

    pub fn elapsed_in_step(&self) -> Duration {
        match self.state {
            ExecutorState::InStep { elapsed, .. } => elapsed,
            _ => Duration::ZERO,
        }
    }

    /// Time left in a timed step
    pub fn remaining_in_step(&self) -> Option<Duration> {
        match self.current_step()?.duration {
            StepDuration::Time(duration) => Some(duration.saturating_sub(self.elapsed_in_step())),
            _ => None,
        }
    }

    /// Enter step 0; zero-length leading steps are passed through immediately
    pub fn start(&mut self, plan: FlatPlan, current_distance: f64, current_reps: u32) -> Vec<StepChange> {
        self.plan = Some(plan);

        let mut changes = Vec::new();
        self.enter(0, Duration::ZERO, (current_distance, current_reps), &mut changes);
        self.settle(current_distance, current_reps, &mut changes);
        changes
    }

    /// Advance progress and move past every step whose target is met
    pub fn tick(&mut self, dt: Duration, current_distance: f64, current_reps: u32) -> Vec<StepChange> {
        let mut changes = Vec::new();
        if let ExecutorState::InStep { index, elapsed } = self.state {
            self.state = ExecutorState::InStep {
                index,
                elapsed: elapsed + dt,
            };
            self.settle(current_distance, current_reps, &mut changes);
        }
        changes
    }

    /// End the active step regardless of its duration kind
    pub fn advance(&mut self, current_distance: f64, current_reps: u32) -> Option<StepChange> {
        let index = self.current_index()?;
        let mut changes = Vec::new();
        self.enter(index + 1, Duration::ZERO, (current_distance, current_reps), &mut changes);
        changes.pop()
    }

    /// `base` is the distance and rep count the new step measures from
    fn enter(&mut self, index: usize, carry: Duration, base: (f64, u32), changes: &mut Vec<StepChange>) {
        let previous = self.current_index();
        let step = self.plan.as_ref().and_then(|plan| plan.get(index)).cloned();

        (self.distance_base, self.reps_base) = base;
        self.state = match step {
            Some(_) => ExecutorState::InStep { index, elapsed: carry },
            None => ExecutorState::Complete,
        };
        debug!(?previous, index, complete = step.is_none(), "Plan step change");
        changes.push(StepChange {
            previous,
            index: step.as_ref().map(|_| index),
            step,
        });
    }

    fn settle(&mut self, current_distance: f64, current_reps: u32, changes: &mut Vec<StepChange>) {
        while let ExecutorState::InStep { index, elapsed } = self.state {
            let Some(duration) = self.plan.as_ref().and_then(|plan| plan.get(index)).map(|step| step.duration) else {
                break;
            };

            // Overshoot carries into the next step the same way excess time does
            match duration {
                StepDuration::Time(target) if elapsed >= target => {
                    self.enter(index + 1, elapsed - target, (current_distance, current_reps), changes);
                }
                StepDuration::Distance(target) if current_distance - self.distance_base >= target => {
                    let base = (self.distance_base + target.max(0.0), current_reps);
                    self.enter(index + 1, Duration::ZERO, base, changes);
                }
                StepDuration::Repetitions(target) if current_reps.saturating_sub(self.reps_base) >= target => {
                    let base = (current_distance, self.reps_base + target);
                    self.enter(index + 1, Duration::ZERO, base, changes);
                }
                _ => break,
            }
        }
    }
}
