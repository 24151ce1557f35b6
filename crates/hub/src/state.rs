//! In-memory system state for the operator API: live actuator status, the
//! rain flag, and a capped event ring buffer.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::fsm::Phase;
use crate::registry::{ActuatorDescriptor, Kind};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub rain_active: bool,
    pub actuators: HashMap<String, ActuatorView>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct ActuatorView {
    pub kind: Kind,
    pub phase: Phase,
    pub position_pct: u8,
    /// Level of the activity currently holding the actuator, if any.
    pub level: Option<u8>,
    pub stale: bool,
    pub last_changed: Option<DateTime<Utc>>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    pub ts: DateTime<Utc>,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Command,
    Motion,
    Fault,
    Bus,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub rain_active: bool,
    pub actuators: HashMap<String, ActuatorView>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new<'a>(descriptors: impl IntoIterator<Item = &'a ActuatorDescriptor>) -> Self {
        let actuators = descriptors
            .into_iter()
            .map(|d| {
                (
                    d.id.clone(),
                    ActuatorView {
                        kind: d.kind,
                        phase: Phase::Idle,
                        position_pct: 0,
                        level: None,
                        stale: false,
                        last_changed: None,
                    },
                )
            })
            .collect();

        Self {
            started_at: Instant::now(),
            rain_active: false,
            actuators,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Mirror an actuator's phase transition into the live view.
    pub fn record_phase(
        &mut self,
        id: &str,
        phase: Phase,
        position_pct: u8,
        level: Option<u8>,
        stale: bool,
    ) {
        if let Some(a) = self.actuators.get_mut(id) {
            a.phase = phase;
            a.position_pct = position_pct;
            a.level = level;
            a.stale = stale;
            a.last_changed = Some(Utc::now());
        }
    }

    pub fn record_command(&mut self, detail: String) {
        self.push_event(EventKind::Command, detail);
    }

    pub fn record_motion(&mut self, detail: String) {
        self.push_event(EventKind::Motion, detail);
    }

    pub fn record_fault(&mut self, detail: String) {
        self.push_event(EventKind::Fault, detail);
    }

    pub fn record_bus(&mut self, detail: String) {
        self.push_event(EventKind::Bus, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    pub fn set_rain(&mut self, active: bool) {
        if self.rain_active != active {
            self.rain_active = active;
            self.push_event(
                EventKind::System,
                format!("rain {}", if active { "detected" } else { "cleared" }),
            );
        }
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            rain_active: self.rain_active,
            actuators: self.actuators.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: Utc::now(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
