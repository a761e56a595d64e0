//! Fitness Machine Control protocol adapter
//!
//! Capability negotiation and target writes for controllable trainers. Every
//! setter range-checks its argument and checks the negotiated capability set
//! before anything is written, then waits for the control point indication.
//! Device refusals come back as [`ControlError`] values; nothing here panics or
//! tears down a session.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ControlError, TransportError};
use crate::models::EndpointId;
use crate::protocol::ftms::{self, ControlPointCommand, ResultCode, SupportedRange};
use crate::protocol::uuids;
use crate::transport::Transport;

/// Fixed target limits, applied before any device-reported range
pub mod limits {
    pub const POWER_MIN: f64 = 0.0;
    pub const POWER_MAX: f64 = 4000.0;
    pub const GRADE_MIN: f64 = -40.0;
    pub const GRADE_MAX: f64 = 40.0;
    pub const RESISTANCE_MIN: f64 = -100.0;
    pub const RESISTANCE_MAX: f64 = 100.0;
    pub const WIND_SPEED_MIN: f64 = -32.768;
    pub const WIND_SPEED_MAX: f64 = 32.767;
    pub const CRR_MIN: f64 = 0.0;
    pub const CRR_MAX: f64 = 0.0255;
    pub const CW_MIN: f64 = 0.0;
    pub const CW_MAX: f64 = 2.55;
}

/// Control modes a trainer may support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlCapability {
    /// Fixed power target
    Erg,
    /// Simulated grade, wind and rolling resistance
    Sim,
    /// Raw resistance level
    Resistance,
}

impl fmt::Display for ControlCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlCapability::Erg => write!(f, "ERG mode"),
            ControlCapability::Sim => write!(f, "SIM mode"),
            ControlCapability::Resistance => write!(f, "resistance control"),
        }
    }
}

/// Indoor bike simulation parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimulationParameters {
    pub grade_percent: f64,
    pub wind_speed_mps: f64,
    /// Coefficient of rolling resistance (Crr)
    pub rolling_resistance: f64,
    /// Wind resistance coefficient (Cw, kg/m)
    pub wind_resistance: f64,
}

impl SimulationParameters {
    /// Still air on a typical road surface
    pub fn grade(grade_percent: f64) -> Self {
        Self {
            grade_percent,
            ..Self::default()
        }
    }
}

impl Default for SimulationParameters {
    fn default() -> Self {
        Self {
            grade_percent: 0.0,
            wind_speed_mps: 0.0,
            rolling_resistance: 0.004,
            wind_resistance: 0.51,
        }
    }
}

/// What the trainer should be doing
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ControlTarget {
    Power { watts: f64 },
    Simulation(SimulationParameters),
    Resistance { level: f64 },
    /// Release control and return the trainer to free ride
    Neutral,
}

impl fmt::Display for ControlTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlTarget::Power { watts } => write!(f, "{:.0} W", watts),
            ControlTarget::Simulation(sim) => write!(f, "{:.1}% grade", sim.grade_percent),
            ControlTarget::Resistance { level } => write!(f, "resistance {:.1}", level),
            ControlTarget::Neutral => write!(f, "neutral"),
        }
    }
}

fn check_range(parameter: &'static str, value: f64, min: f64, max: f64) -> Result<(), ControlError> {
    if value.is_finite() && value >= min && value <= max {
        Ok(())
    } else {
        Err(ControlError::OutOfRange {
            parameter,
            value,
            min,
            max,
        })
    }
}

/// Command/response channel to one controllable trainer
pub struct FitnessMachineController<T: Transport> {
    transport: Arc<T>,
    endpoint: EndpointId,
    timeout: Duration,
    capabilities: Option<BTreeSet<ControlCapability>>,
    power_range: Option<SupportedRange>,
    resistance_range: Option<SupportedRange>,
    responses: Option<mpsc::Receiver<Vec<u8>>>,
    has_control: bool,
}

impl<T: Transport> FitnessMachineController<T> {
    pub fn new(transport: Arc<T>, endpoint: EndpointId, timeout: Duration) -> Self {
        Self {
            transport,
            endpoint,
            timeout,
            capabilities: None,
            power_range: None,
            resistance_range: None,
            responses: None,
            has_control: false,
        }
    }

    pub fn endpoint(&self) -> &EndpointId {
        &self.endpoint
    }

    /// Read the feature characteristic and supported ranges
    pub async fn negotiate_capabilities(&mut self) -> Result<BTreeSet<ControlCapability>, ControlError> {
        let bytes = self
            .transport
            .read(&self.endpoint, uuids::FITNESS_MACHINE_FEATURE)
            .await
            .map_err(|err| self.failed("negotiate_capabilities", err.to_string()))?;
        let features =
            ftms::decode_features(&bytes).map_err(|err| self.failed("negotiate_capabilities", err.to_string()))?;

        let mut capabilities = BTreeSet::new();
        if features.supports_power_target() {
            capabilities.insert(ControlCapability::Erg);
            self.power_range = self.read_range(uuids::SUPPORTED_POWER_RANGE, ftms::decode_power_range).await;
        }
        if features.supports_simulation() {
            capabilities.insert(ControlCapability::Sim);
        }
        if features.supports_resistance_target() {
            capabilities.insert(ControlCapability::Resistance);
            self.resistance_range = self
                .read_range(uuids::SUPPORTED_RESISTANCE_LEVEL_RANGE, ftms::decode_resistance_range)
                .await;
        }

        info!(endpoint = %self.endpoint, ?capabilities, "Negotiated trainer capabilities");
        self.capabilities = Some(capabilities.clone());
        Ok(capabilities)
    }

    async fn read_range(
        &self,
        characteristic: uuid::Uuid,
        decode: fn(&[u8]) -> Result<SupportedRange, crate::error::ProtocolError>,
    ) -> Option<SupportedRange> {
        let bytes = self.transport.read(&self.endpoint, characteristic).await.ok()?;
        decode(&bytes).ok()
    }

    /// Negotiated capabilities, if negotiation has happened
    pub fn capabilities(&self) -> Option<&BTreeSet<ControlCapability>> {
        self.capabilities.as_ref()
    }

    /// ERG mode: hold a fixed power
    pub async fn set_power_target(&mut self, watts: f64) -> Result<(), ControlError> {
        check_range("power", watts, limits::POWER_MIN, limits::POWER_MAX)?;
        self.require(ControlCapability::Erg).await?;
        if let Some(range) = self.power_range {
            check_range("power", watts, range.min, range.max)?;
        }

        let watts = watts.round() as i16;
        self.send(ControlPointCommand::SetTargetPower(watts)).await
    }

    /// SIM mode: grade, wind speed, Crr and Cw
    pub async fn set_simulation(&mut self, params: SimulationParameters) -> Result<(), ControlError> {
        check_range("grade", params.grade_percent, limits::GRADE_MIN, limits::GRADE_MAX)?;
        check_range(
            "wind_speed",
            params.wind_speed_mps,
            limits::WIND_SPEED_MIN,
            limits::WIND_SPEED_MAX,
        )?;
        check_range(
            "rolling_resistance",
            params.rolling_resistance,
            limits::CRR_MIN,
            limits::CRR_MAX,
        )?;
        check_range("wind_resistance", params.wind_resistance, limits::CW_MIN, limits::CW_MAX)?;
        self.require(ControlCapability::Sim).await?;

        self.send(ControlPointCommand::SetIndoorBikeSimulation {
            wind_speed_mps: params.wind_speed_mps,
            grade_percent: params.grade_percent,
            rolling_resistance: params.rolling_resistance,
            wind_resistance: params.wind_resistance,
        })
        .await
    }

    pub async fn set_resistance_level(&mut self, level: f64) -> Result<(), ControlError> {
        check_range(
            "resistance",
            level,
            limits::RESISTANCE_MIN,
            limits::RESISTANCE_MAX,
        )?;
        self.require(ControlCapability::Resistance).await?;
        if let Some(range) = self.resistance_range {
            check_range("resistance", level, range.min, range.max)?;
        }

        self.send(ControlPointCommand::SetTargetResistance(level)).await
    }

    /// Return the trainer to an uncontrolled state
    pub async fn reset(&mut self) -> Result<(), ControlError> {
        let result = self.send(ControlPointCommand::Reset).await;
        self.has_control = false;
        result
    }

    /// Dispatch a resolved target to the matching setter
    pub async fn apply(&mut self, target: ControlTarget) -> Result<(), ControlError> {
        match target {
            ControlTarget::Power { watts } => self.set_power_target(watts).await,
            ControlTarget::Simulation(params) => self.set_simulation(params).await,
            ControlTarget::Resistance { level } => self.set_resistance_level(level).await,
            ControlTarget::Neutral => self.reset().await,
        }
    }

    async fn require(&mut self, capability: ControlCapability) -> Result<(), ControlError> {
        if self.capabilities.is_none() {
            self.negotiate_capabilities().await?;
        }
        let supported = self
            .capabilities
            .as_ref()
            .is_some_and(|capabilities| capabilities.contains(&capability));

        if supported {
            Ok(())
        } else {
            Err(ControlError::CapabilityUnsupported {
                endpoint: self.endpoint.clone(),
                capability: capability.to_string(),
            })
        }
    }

    fn failed(&self, command: &'static str, reason: String) -> ControlError {
        ControlError::CommandFailed {
            endpoint: self.endpoint.clone(),
            command,
            reason,
        }
    }

    /// Write a command, taking control first if needed
    async fn send(&mut self, command: ControlPointCommand) -> Result<(), ControlError> {
        if !self.has_control {
            self.exchange(ControlPointCommand::RequestControl).await?;
            self.exchange(ControlPointCommand::StartOrResume).await?;
            self.has_control = true;
        }

        let result = self.exchange(command).await;
        if let Err(ControlError::CommandFailed { .. } | ControlError::Timeout { .. }) = &result {
            // Re-take control on the next command
            self.has_control = false;
        }
        result
    }

    /// One write and its response indication
    async fn exchange(&mut self, command: ControlPointCommand) -> Result<(), ControlError> {
        let name = command.name();
        if self.responses.is_none() {
            let rx = self
                .transport
                .subscribe(&self.endpoint, uuids::FITNESS_MACHINE_CONTROL_POINT)
                .await
                .map_err(|err| self.failed(name, err.to_string()))?;
            self.responses = Some(rx);
        }

        let Some(responses) = self.responses.as_mut() else {
            return Err(self.failed(name, TransportError::Closed.to_string()));
        };
        // Late indications from a timed-out command must not answer this one
        while responses.try_recv().is_ok() {}

        debug!(endpoint = %self.endpoint, command = name, "Writing control point");
        if let Err(err) = self
            .transport
            .write(&self.endpoint, uuids::FITNESS_MACHINE_CONTROL_POINT, &command.encode())
            .await
        {
            self.responses = None;
            return Err(self.failed(name, err.to_string()));
        }

        let opcode = command.opcode();
        let endpoint = self.endpoint.clone();
        let outcome = tokio::time::timeout(self.timeout, async {
            while let Some(bytes) = responses.recv().await {
                match ftms::decode_control_point_response(&bytes) {
                    Ok(response) if response.request_opcode == opcode => return Some(response.result),
                    Ok(_) => continue,
                    Err(err) => debug!(endpoint = %endpoint, "Ignoring control point data: {}", err),
                }
            }
            None
        })
        .await;

        match outcome {
            Ok(Some(ResultCode::Success)) => Ok(()),
            Ok(Some(result)) => Err(self.failed(name, result.to_string())),
            Ok(None) => {
                self.responses = None;
                Err(self.failed(name, TransportError::Closed.to_string()))
            }
            Err(_) => Err(ControlError::Timeout {
                endpoint: self.endpoint.clone(),
                command: name,
            }),
        }
    }
}

/// Outcome of a queued control write
#[derive(Debug, Clone, PartialEq)]
pub struct ControlNotice {
    pub endpoint: EndpointId,
    pub target: ControlTarget,
    pub result: Result<(), ControlError>,
}

struct ControlJob {
    target: ControlTarget,
    reply: Option<oneshot::Sender<Result<(), ControlError>>>,
}

/// FIFO queue of control writes for one trainer
///
/// Writes are wireless round-trips; running them on their own task keeps
/// reading ingestion moving while a trainer is slow to answer.
pub struct ControlWorker {
    endpoint: EndpointId,
    jobs: mpsc::UnboundedSender<ControlJob>,
    handle: JoinHandle<()>,
}

impl ControlWorker {
    pub fn spawn<T: Transport>(
        controller: FitnessMachineController<T>,
        notices: broadcast::Sender<ControlNotice>,
    ) -> Self {
        let endpoint = controller.endpoint().clone();
        let controller = Arc::new(Mutex::new(controller));
        let (jobs, mut rx) = mpsc::unbounded_channel::<ControlJob>();

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let mut controller = controller.lock().await;
                let result = controller.apply(job.target).await;
                match &result {
                    Ok(()) => info!(endpoint = %controller.endpoint(), target = %job.target, "Trainer target applied"),
                    Err(err) => warn!(endpoint = %controller.endpoint(), target = %job.target, "Trainer target failed: {}", err),
                }

                let _ = notices.send(ControlNotice {
                    endpoint: controller.endpoint().clone(),
                    target: job.target,
                    result: result.clone(),
                });
                if let Some(reply) = job.reply {
                    let _ = reply.send(result);
                }
            }
        });

        Self {
            endpoint,
            jobs,
            handle,
        }
    }

    pub fn endpoint(&self) -> &EndpointId {
        &self.endpoint
    }

    /// Queue a target without waiting for the trainer
    pub fn submit(&self, target: ControlTarget) -> bool {
        self.jobs.send(ControlJob { target, reply: None }).is_ok()
    }

    /// Queue a target and wait for the trainer's answer
    pub async fn apply(&self, target: ControlTarget) -> Result<(), ControlError> {
        let (reply, rx) = oneshot::channel();
        let closed = || ControlError::CommandFailed {
            endpoint: self.endpoint.clone(),
            command: "apply",
            reason: "control worker stopped".to_string(),
        };

        self.jobs
            .send(ControlJob {
                target,
                reply: Some(reply),
            })
            .map_err(|_| closed())?;
        rx.await.map_err(|_| closed())?
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}
