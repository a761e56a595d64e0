// Library interface for TrainLink modules
// The CLI binary and the integration tests both build on this crate

pub mod config;
pub mod connection;
pub mod control;
pub mod engine;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod persistence;
pub mod plan;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod validation;
pub mod zones;

// Re-export commonly used types for convenience
pub use config::{ConnectionConfig, EngineConfig, RecordingConfig};
pub use connection::{ConnectionEvent, ConnectionManager, ReconnectPolicy};
pub use control::{ControlCapability, ControlNotice, ControlTarget, FitnessMachineController, SimulationParameters};
pub use engine::Engine;
pub use error::{Result, TrainLinkError};
pub use logging::{LogConfig, LogFormat, LogLevel};
pub use metrics::{AdvancedMetrics, LapSummary, MetricsAggregator, MetricsSnapshot};
pub use models::*;
pub use persistence::{JsonFileSink, MemorySink, SessionRecord, SnapshotSink};
pub use plan::{FlatPlan, IntensityTarget, PlanBlock, PlanStepExecutor, StepChange, StepDuration, WorkoutStep};
pub use session::{RecordingSession, SessionState, SessionSummary};
pub use transport::{SimulatedTransport, Transport};
pub use validation::ReadingValidator;
pub use zones::{ZoneClassifier, ZoneModel, ZoneTime};
