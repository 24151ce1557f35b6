//! Command-side message types: priority levels, control intents submitted by
//! callers, the responses they get back, and the internal motion job handed
//! to an actuator runner.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Priority levels
// ---------------------------------------------------------------------------

/// The five command classes, L1 (emergency) down to L5 (fallback-autonomous).
/// Callers may submit L1–L4; L5 belongs to the far-side controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Level {
    Emergency,
    Safety,
    Manual,
    Auto,
    Fallback,
}

impl Level {
    /// Numeric form, 1–5.
    pub fn number(self) -> u8 {
        match self {
            Level::Emergency => 1,
            Level::Safety => 2,
            Level::Manual => 3,
            Level::Auto => 4,
            Level::Fallback => 5,
        }
    }

    /// CCM wire priority carried in outgoing control packets.
    pub fn wire_priority(self) -> u8 {
        match self {
            Level::Emergency => 1,
            Level::Safety => 5,
            Level::Manual => 10,
            Level::Auto => 20,
            Level::Fallback => 29,
        }
    }
}

impl TryFrom<u8> for Level {
    type Error = String;

    fn try_from(n: u8) -> Result<Self, Self::Error> {
        match n {
            1 => Ok(Level::Emergency),
            2 => Ok(Level::Safety),
            3 => Ok(Level::Manual),
            4 => Ok(Level::Auto),
            5 => Ok(Level::Fallback),
            _ => Err(format!("level must be 1-5, got {n}")),
        }
    }
}

impl From<Level> for u8 {
    fn from(l: Level) -> u8 {
        l.number()
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}", self.number())
    }
}

// ---------------------------------------------------------------------------
// Targets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Switch {
    On,
    Off,
}

/// What the caller wants the actuator to do.
///
/// `percent` addresses limited duration actuators (estimated opening),
/// `seconds` addresses no-limit actuators ("run for N seconds"), and
/// `binary` addresses on/off actuators or acts as open-fully / close-fully
/// on limited ones.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Target {
    Percent(u8),
    Seconds(f64),
    Binary(Switch),
}

// ---------------------------------------------------------------------------
// Intent & response
// ---------------------------------------------------------------------------

/// A command as submitted by an external caller (HTTP API or tool bridge).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlIntent {
    pub actuator_id: String,
    pub target: Target,
    pub level: Level,
    #[serde(default)]
    pub origin: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DispositionKind {
    Accepted,
    Queued,
    Locked,
    Rejected,
}

/// What the caller hears back, immediately, for every intent.
#[derive(Debug, Clone, Serialize)]
pub struct IntentResponse {
    pub disposition: DispositionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_sec: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

impl IntentResponse {
    pub fn accepted(job_id: &str) -> Self {
        Self {
            disposition: DispositionKind::Accepted,
            eta_sec: None,
            reason: None,
            job_id: Some(job_id.to_string()),
        }
    }

    pub fn queued(job_id: &str) -> Self {
        Self {
            disposition: DispositionKind::Queued,
            eta_sec: None,
            reason: None,
            job_id: Some(job_id.to_string()),
        }
    }

    pub fn locked(eta_sec: u64) -> Self {
        Self {
            disposition: DispositionKind::Locked,
            eta_sec: Some(eta_sec),
            reason: Some("LOCKED".to_string()),
            job_id: None,
        }
    }

    pub fn rejected(reason: &str, eta_sec: Option<u64>) -> Self {
        Self {
            disposition: DispositionKind::Rejected,
            eta_sec,
            reason: Some(reason.to_string()),
            job_id: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Motion job
// ---------------------------------------------------------------------------

/// An accepted intent, bound for (or waiting on) a specific actuator runner.
#[derive(Debug, Clone)]
pub struct MotionJob {
    pub job_id: String,
    pub actuator_id: String,
    pub target: Target,
    pub level: Level,
    pub origin: String,
}

impl MotionJob {
    pub fn from_intent(intent: &ControlIntent) -> Self {
        Self {
            job_id: Uuid::new_v4().to_string(),
            actuator_id: intent.actuator_id.clone(),
            target: intent.target,
            level: intent.level,
            origin: if intent.origin.is_empty() {
                "anonymous".to_string()
            } else {
                intent.origin.clone()
            },
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
