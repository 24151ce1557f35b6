//! Per-command error kinds that cross the API boundary.
//!
//! A single failed command never aborts the process; these errors become
//! `rejected` dispositions with a stable reason code and, where the blocking
//! condition has a known end, an ETA in seconds.

use thiserror::Error;

use crate::intent::IntentResponse;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("unknown actuator '{0}'")]
    UnknownActuator(String),

    #[error("{0}")]
    OutOfRange(String),

    #[error("actuator busy at equal level, {eta_sec}s remaining")]
    Locked { eta_sec: u64 },

    #[error("motor cooling, {eta_sec}s remaining")]
    Cooling { eta_sec: u64 },

    #[error("calibrating, ETA {eta_sec}s")]
    Calibrating { eta_sec: u64 },

    #[error("queued command expired")]
    QueuedExpired,

    #[error("rain interlock active")]
    RainInterlock,

    #[error("bus send failed")]
    BusIo,
}

impl CommandError {
    /// Stable machine-readable reason code reported to callers.
    pub fn code(&self) -> &'static str {
        match self {
            CommandError::UnknownActuator(_) => "UNKNOWN_ACTUATOR",
            CommandError::OutOfRange(_) => "OUT_OF_RANGE",
            CommandError::Locked { .. } => "LOCKED",
            CommandError::Cooling { .. } => "COOLING",
            CommandError::Calibrating { .. } => "CALIBRATING",
            CommandError::QueuedExpired => "QUEUED_EXPIRED",
            CommandError::RainInterlock => "RAIN_INTERLOCK",
            CommandError::BusIo => "BUS_IO",
        }
    }

    /// Seconds until the blocking condition clears, where known.
    pub fn eta_sec(&self) -> Option<u64> {
        match self {
            CommandError::Locked { eta_sec }
            | CommandError::Cooling { eta_sec }
            | CommandError::Calibrating { eta_sec } => Some(*eta_sec),
            _ => None,
        }
    }

    /// The caller-facing disposition for this error.
    pub fn to_response(&self) -> IntentResponse {
        match self {
            CommandError::Locked { eta_sec } => IntentResponse::locked(*eta_sec),
            _ => IntentResponse::rejected(self.code(), self.eta_sec()),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
