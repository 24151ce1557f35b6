//! Actuator descriptors and the registry that answers "what kind is X,
//! what are its limits".
//!
//! Descriptors are loaded once at startup and validated hard: a greenhouse
//! with a misconfigured travel time must refuse to start rather than guess
//! at runtime.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Safety margin applied on top of the longest travel time: a motion may
/// never stay energised past `max(full_open, full_close) * 1.2`.
const CONTINUOUS_MARGIN: f64 = 1.2;

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    /// Effect proportional to energised time (windows, curtains, irrigation).
    Duration,
    /// Pure binary switch (fans, burners, heat pumps).
    OnOff,
}

/// Immutable description of one physical actuator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActuatorDescriptor {
    pub id: String,
    pub kind: Kind,

    /// Seconds of motor time from fully closed to fully open.
    #[serde(default)]
    pub full_open_sec: f64,
    /// Seconds of motor time from fully open to fully closed.
    #[serde(default)]
    pub full_close_sec: f64,
    /// Whether the mechanism has a physical end stop. Actuators without one
    /// (irrigation valves) take seconds-targets and must carry
    /// `max_duration_sec`.
    #[serde(default)]
    pub has_limit: bool,
    /// Hard cap on a single energised period, mandatory when `has_limit` is
    /// false; optional timed-ON cap for on/off actuators.
    pub max_duration_sec: Option<f64>,

    /// Minimum idle interval after any motion.
    #[serde(default)]
    pub cooling_sec: f64,
    /// Minimum interval between stopping and re-energising in the opposite
    /// direction. Defaults to `cooling_sec` when omitted.
    pub reversal_cooling_sec: Option<f64>,

    /// Roof windows: L4 OPEN commands are refused while rain is detected.
    #[serde(default)]
    pub rain_interlock: bool,

    #[serde(default = "default_one")]
    pub room: u8,
    #[serde(default = "default_one")]
    pub region: u8,
    #[serde(default = "default_one")]
    pub order: u8,
}

fn default_one() -> u8 {
    1
}

impl ActuatorDescriptor {
    pub fn is_duration(&self) -> bool {
        self.kind == Kind::Duration
    }

    /// Upper bound on any single energised period for this actuator.
    pub fn max_continuous(&self) -> Duration {
        let secs = self.full_open_sec.max(self.full_close_sec) * CONTINUOUS_MARGIN;
        Duration::from_secs_f64(secs)
    }

    pub fn cooling(&self) -> Duration {
        Duration::from_secs_f64(self.cooling_sec)
    }

    pub fn reversal_cooling(&self) -> Duration {
        Duration::from_secs_f64(self.reversal_cooling_sec.unwrap_or(self.cooling_sec))
    }

    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration_sec.map(Duration::from_secs_f64)
    }

    /// The calibration drive: fully closed plus margin, so the mechanism is
    /// guaranteed to reach its end stop from any starting position.
    pub fn calibration_drive(&self) -> Duration {
        Duration::from_secs_f64(self.full_close_sec * CONTINUOUS_MARGIN)
    }

    /// Whether this actuator can be calibrated (needs a mechanical stop).
    pub fn calibratable(&self) -> bool {
        self.is_duration() && self.has_limit
    }

    fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            bail!("actuator with empty id");
        }
        if !self.cooling_sec.is_finite() || self.cooling_sec < 0.0 {
            bail!("actuator '{}': cooling_sec must be finite and >= 0", self.id);
        }
        if let Some(r) = self.reversal_cooling_sec {
            if !r.is_finite() || r < self.cooling_sec {
                bail!(
                    "actuator '{}': reversal_cooling_sec must be finite and >= cooling_sec",
                    self.id
                );
            }
        }
        if let Some(m) = self.max_duration_sec {
            if !m.is_finite() || m <= 0.0 {
                bail!("actuator '{}': max_duration_sec must be finite and > 0", self.id);
            }
        }

        match self.kind {
            Kind::Duration => {
                for (name, v) in [
                    ("full_open_sec", self.full_open_sec),
                    ("full_close_sec", self.full_close_sec),
                ] {
                    if !v.is_finite() || v <= 0.0 {
                        bail!("actuator '{}': {name} must be finite and > 0", self.id);
                    }
                }
                if !self.has_limit && self.max_duration_sec.is_none() {
                    bail!(
                        "actuator '{}': max_duration_sec is mandatory without a physical limit",
                        self.id
                    );
                }
            }
            Kind::OnOff => {}
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Lookup table of descriptors, built once from configuration.
#[derive(Debug, Default)]
pub struct ActuatorRegistry {
    actuators: HashMap<String, ActuatorDescriptor>,
}

impl ActuatorRegistry {
    /// Validate and index descriptors. Any failure is fatal at startup.
    pub fn from_descriptors(descriptors: Vec<ActuatorDescriptor>) -> Result<Self> {
        let mut actuators = HashMap::new();
        for d in descriptors {
            d.validate()?;
            if actuators.insert(d.id.clone(), d.clone()).is_some() {
                bail!("duplicate actuator id '{}'", d.id);
            }
        }
        Ok(Self { actuators })
    }

    pub fn describe(&self, id: &str) -> Option<&ActuatorDescriptor> {
        self.actuators.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActuatorDescriptor> {
        self.actuators.values()
    }

    pub fn len(&self) -> usize {
        self.actuators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actuators.is_empty()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn window() -> ActuatorDescriptor {
        ActuatorDescriptor {
            id: "VenSdWin".into(),
            kind: Kind::Duration,
            full_open_sec: 60.0,
            full_close_sec: 55.0,
            has_limit: true,
            max_duration_sec: None,
            cooling_sec: 5.0,
            reversal_cooling_sec: Some(10.0),
            rain_interlock: false,
            room: 1,
            region: 1,
            order: 1,
        }
    }

    fn irrigation() -> ActuatorDescriptor {
        ActuatorDescriptor {
            id: "Irri".into(),
            kind: Kind::Duration,
            full_open_sec: 3000.0,
            full_close_sec: 3000.0,
            has_limit: false,
            max_duration_sec: Some(3600.0),
            cooling_sec: 3.0,
            reversal_cooling_sec: None,
            rain_interlock: false,
            room: 1,
            region: 1,
            order: 1,
        }
    }

    // -- derived limits ------------------------------------------------------

    #[test]
    fn max_continuous_is_longest_travel_with_margin() {
        let d = window();
        assert_eq!(d.max_continuous(), Duration::from_secs_f64(72.0));
    }

    #[test]
    fn calibration_drive_is_full_close_with_margin() {
        let d = window();
        assert_eq!(d.calibration_drive(), Duration::from_secs_f64(66.0));
    }

    #[test]
    fn reversal_cooling_defaults_to_cooling() {
        let mut d = window();
        d.reversal_cooling_sec = None;
        assert_eq!(d.reversal_cooling(), Duration::from_secs_f64(5.0));
    }

    #[test]
    fn only_limited_duration_actuators_are_calibratable() {
        assert!(window().calibratable());
        assert!(!irrigation().calibratable());
        let fan = ActuatorDescriptor {
            id: "VenFan".into(),
            kind: Kind::OnOff,
            full_open_sec: 0.0,
            full_close_sec: 0.0,
            has_limit: false,
            max_duration_sec: None,
            cooling_sec: 30.0,
            reversal_cooling_sec: None,
            rain_interlock: false,
            room: 1,
            region: 1,
            order: 1,
        };
        assert!(!fan.calibratable());
    }

    // -- validation ----------------------------------------------------------

    #[test]
    fn valid_descriptors_load() {
        let reg = ActuatorRegistry::from_descriptors(vec![window(), irrigation()]).unwrap();
        assert_eq!(reg.len(), 2);
        assert!(reg.describe("VenSdWin").is_some());
        assert!(reg.describe("NoSuch").is_none());
    }

    #[test]
    fn zero_travel_time_rejected() {
        let mut d = window();
        d.full_open_sec = 0.0;
        assert!(ActuatorRegistry::from_descriptors(vec![d]).is_err());
    }

    #[test]
    fn non_finite_travel_time_rejected() {
        let mut d = window();
        d.full_close_sec = f64::NAN;
        assert!(ActuatorRegistry::from_descriptors(vec![d]).is_err());
    }

    #[test]
    fn no_limit_without_max_duration_rejected() {
        let mut d = irrigation();
        d.max_duration_sec = None;
        assert!(ActuatorRegistry::from_descriptors(vec![d]).is_err());
    }

    #[test]
    fn reversal_cooling_below_cooling_rejected() {
        let mut d = window();
        d.reversal_cooling_sec = Some(2.0);
        assert!(ActuatorRegistry::from_descriptors(vec![d]).is_err());
    }

    #[test]
    fn duplicate_ids_rejected() {
        assert!(ActuatorRegistry::from_descriptors(vec![window(), window()]).is_err());
    }

    #[test]
    fn onoff_needs_no_travel_times() {
        let fan = ActuatorDescriptor {
            id: "VenFan".into(),
            kind: Kind::OnOff,
            full_open_sec: 0.0,
            full_close_sec: 0.0,
            has_limit: false,
            max_duration_sec: None,
            cooling_sec: 30.0,
            reversal_cooling_sec: None,
            rain_interlock: false,
            room: 1,
            region: 1,
            order: 1,
        };
        assert!(ActuatorRegistry::from_descriptors(vec![fan]).is_ok());
    }
}
