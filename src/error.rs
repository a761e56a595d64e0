//! Unified error hierarchy for TrainLink
//!
//! Every fallible engine operation reports through [`TrainLinkError`]. Only
//! [`SessionError::IllegalTransition`] is meant to reach the caller as a hard
//! failure; the remaining classes describe degraded-but-recoverable conditions
//! (a rejected sample, a lost sensor, a refused trainer command).

use std::time::Duration;
use thiserror::Error;

use crate::models::{EndpointId, MetricKind};
use crate::session::SessionState;

/// Top-level error type for all TrainLink operations
#[derive(Debug, Error)]
pub enum TrainLinkError {
    /// Reading rejected by the validator
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Sensor connection errors
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Trainer control errors
    #[error("Control error: {0}")]
    Control(#[from] ControlError),

    /// Recording lifecycle errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Characteristic decoding errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Platform transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Engine actor is gone
    #[error("Engine stopped")]
    EngineStopped,
}

/// Reading validation errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    /// Value outside the metric's plausible closed interval
    #[error("{metric} value {value} outside [{min}, {max}]")]
    OutOfRange {
        metric: MetricKind,
        value: f64,
        min: f64,
        max: f64,
    },

    /// NaN or infinite value
    #[error("{metric} value is not a finite number")]
    NotFinite { metric: MetricKind },
}

/// Sensor connection errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConnectionError {
    /// No accepted data within the health-check window
    #[error("Connection lost to {endpoint}: no data for {silent_for:?}")]
    ConnectionLost {
        endpoint: EndpointId,
        silent_for: Duration,
    },

    /// Bounded reconnection gave up
    #[error("Reconnect exhausted for {endpoint} after {attempts} attempts")]
    ReconnectExhausted { endpoint: EndpointId, attempts: u32 },

    /// Endpoint id was never discovered or has been forgotten
    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(EndpointId),

    /// Connect attempt failed at the transport layer
    #[error("Connect to {endpoint} failed: {reason}")]
    ConnectFailed { endpoint: EndpointId, reason: String },
}

/// Fitness machine control errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ControlError {
    /// Device does not advertise the requested control mode
    #[error("Capability unsupported by {endpoint}: {capability}")]
    CapabilityUnsupported {
        endpoint: EndpointId,
        capability: String,
    },

    /// Requested target outside the accepted range
    #[error("Control target {parameter}={value} outside [{min}, {max}]")]
    OutOfRange {
        parameter: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    /// Trainer refused or failed the write
    #[error("Control command {command} failed on {endpoint}: {reason}")]
    CommandFailed {
        endpoint: EndpointId,
        command: &'static str,
        reason: String,
    },

    /// No response indication within the control timeout
    #[error("Control command {command} timed out on {endpoint}")]
    Timeout {
        endpoint: EndpointId,
        command: &'static str,
    },

    /// Endpoint is a pure source
    #[error("Endpoint {0} is not controllable")]
    NotControllable(EndpointId),
}

/// Recording lifecycle errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    /// Lifecycle call not legal from the current state
    #[error("Illegal transition: cannot {action} while {state}")]
    IllegalTransition {
        action: &'static str,
        state: SessionState,
    },

    /// Lifecycle call issued with no session
    #[error("No recording session")]
    NoActiveSession,
}

/// Characteristic byte-layout errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    /// Buffer shorter than the fields its flags announce
    #[error("Truncated {characteristic}: need {needed} bytes, got {got}")]
    Truncated {
        characteristic: &'static str,
        needed: usize,
        got: usize,
    },

    /// Response indication did not start with the response opcode
    #[error("Unexpected opcode {opcode:#04x} in {characteristic}")]
    UnexpectedOpcode {
        characteristic: &'static str,
        opcode: u8,
    },

    /// Characteristic has no decoder
    #[error("Unsupported characteristic: {0}")]
    UnsupportedCharacteristic(String),
}

/// Errors reported by the platform transport
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("Device {0} not reachable")]
    Unreachable(EndpointId),

    #[error("Characteristic {characteristic} not found on {endpoint}")]
    CharacteristicNotFound {
        endpoint: EndpointId,
        characteristic: String,
    },

    #[error("Write to {endpoint} failed: {reason}")]
    WriteFailed { endpoint: EndpointId, reason: String },

    #[error("Transport closed")]
    Closed,
}

/// Result type alias for TrainLink operations
pub type Result<T> = std::result::Result<T, TrainLinkError>;

impl TrainLinkError {
    /// Everything except an illegal lifecycle transition degrades gracefully
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            TrainLinkError::Session(SessionError::IllegalTransition { .. })
                | TrainLinkError::EngineStopped
        )
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            TrainLinkError::Validation(_) => ErrorSeverity::Info,
            TrainLinkError::Connection(ConnectionError::ReconnectExhausted { .. }) => {
                ErrorSeverity::Error
            }
            TrainLinkError::Connection(_) => ErrorSeverity::Warning,
            TrainLinkError::Control(_) => ErrorSeverity::Warning,
            TrainLinkError::Protocol(_) => ErrorSeverity::Warning,
            TrainLinkError::Transport(_) => ErrorSeverity::Warning,
            TrainLinkError::Session(SessionError::IllegalTransition { .. }) => {
                ErrorSeverity::Error
            }
            TrainLinkError::Session(_) => ErrorSeverity::Error,
            TrainLinkError::EngineStopped => ErrorSeverity::Critical,
            _ => ErrorSeverity::Error,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            TrainLinkError::Connection(ConnectionError::ConnectionLost { endpoint, .. }) => {
                format!("Lost signal from {}. Reconnecting...", endpoint)
            }
            TrainLinkError::Connection(ConnectionError::ReconnectExhausted { endpoint, .. }) => {
                format!(
                    "Could not reconnect to {}. Check the sensor and connect it again.",
                    endpoint
                )
            }
            TrainLinkError::Control(ControlError::CommandFailed { .. })
            | TrainLinkError::Control(ControlError::Timeout { .. }) => {
                "Trainer did not accept the new target. Recording continues.".to_string()
            }
            TrainLinkError::Control(ControlError::CapabilityUnsupported { capability, .. }) => {
                format!("This trainer does not support {}.", capability)
            }
            TrainLinkError::Session(SessionError::IllegalTransition { action, state }) => {
                format!("Cannot {} a recording that is {}.", action, state)
            }
            _ => self.to_string(),
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical system error requiring immediate attention
    Critical,
    /// Error that prevents operation but system can continue
    Error,
    /// Warning that doesn't prevent operation
    Warning,
    /// Informational message
    Info,
}

impl ErrorSeverity {
    /// Convert to tracing level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            ErrorSeverity::Critical => tracing::Level::ERROR,
            ErrorSeverity::Error => tracing::Level::ERROR,
            ErrorSeverity::Warning => tracing::Level::WARN,
            ErrorSeverity::Info => tracing::Level::INFO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_severity() {
        let err = TrainLinkError::Validation(ValidationError::OutOfRange {
            metric: MetricKind::Power,
            value: 5000.0,
            min: 0.0,
            max: 4000.0,
        });
        assert_eq!(err.severity(), ErrorSeverity::Info);

        let err = TrainLinkError::Session(SessionError::IllegalTransition {
            action: "start",
            state: SessionState::Recording,
        });
        assert_eq!(err.severity(), ErrorSeverity::Error);
        assert_eq!(err.severity().to_tracing_level(), tracing::Level::ERROR);
    }

    #[test]
    fn test_only_illegal_transition_is_unrecoverable() {
        let err = TrainLinkError::Session(SessionError::IllegalTransition {
            action: "pause",
            state: SessionState::Pending,
        });
        assert!(!err.is_recoverable());

        let err = TrainLinkError::Connection(ConnectionError::ReconnectExhausted {
            endpoint: EndpointId::new("hrm"),
            attempts: 5,
        });
        assert!(err.is_recoverable());

        let err = TrainLinkError::Control(ControlError::Timeout {
            endpoint: EndpointId::new("kickr"),
            command: "set_power_target",
        });
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_user_messages() {
        let err = TrainLinkError::Session(SessionError::IllegalTransition {
            action: "start",
            state: SessionState::Paused,
        });
        assert!(err.user_message().contains("Cannot start"));

        let err = TrainLinkError::Connection(ConnectionError::ReconnectExhausted {
            endpoint: EndpointId::new("hrm"),
            attempts: 5,
        });
        assert!(err.user_message().contains("Could not reconnect"));
    }
}
