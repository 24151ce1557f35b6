//! Priority arbitration: given an actuator's current phase and level, decide
//! what happens to an incoming command.
//!
//! Pure function, no side effects — the runner acts on the returned
//! disposition. Levels: L1 emergency, L2 safety, L3 manual, L4 automatic,
//! L5 fallback (never submitted through this core).

use tokio::time::Instant;

use crate::fsm::{ActuatorFsm, Phase};
use crate::intent::Level;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Start now (actuator idle, or calibration yields to a safety command).
    Accept,
    /// Stop the current activity and start the new job.
    Preempt,
    /// Enqueue behind the current job.
    Wait,
    /// Equal-level automatic conflict: refuse, reporting when the current
    /// motion ends.
    Lock { eta_sec: u64 },
    /// Blocked by the cooling window.
    RejectCooling { eta_sec: u64 },
    /// Blocked by a calibration run.
    RejectCalibrating { eta_sec: u64 },
}

/// Decide the fate of a command at `incoming` level against the actuator's
/// current state.
pub fn arbitrate(fsm: &ActuatorFsm, incoming: Level, now: Instant) -> Disposition {
    let eta = || fsm.eta_sec(now).unwrap_or(0);

    match fsm.phase {
        Phase::Idle => Disposition::Accept,

        Phase::Moving => {
            let current = fsm.current_level().unwrap_or(Level::Fallback);
            match incoming {
                // Emergency displaces anything.
                Level::Emergency => Disposition::Preempt,

                // Safety displaces everything below emergency (and itself).
                Level::Safety => match current {
                    Level::Emergency => Disposition::Wait,
                    _ => Disposition::Preempt,
                },

                Level::Manual => match current {
                    Level::Emergency | Level::Safety => Disposition::Wait,
                    // Operator override: a newer manual command replaces the
                    // running one instead of locking against it.
                    Level::Manual => Disposition::Preempt,
                    Level::Auto | Level::Fallback => Disposition::Preempt,
                },

                Level::Auto => match current {
                    Level::Emergency | Level::Safety | Level::Manual => Disposition::Wait,
                    Level::Auto => Disposition::Lock { eta_sec: eta() },
                    Level::Fallback => Disposition::Preempt,
                },

                Level::Fallback => Disposition::Wait,
            }
        }

        Phase::Cooling => match incoming {
            Level::Emergency | Level::Safety => Disposition::Preempt,
            _ => Disposition::RejectCooling { eta_sec: eta() },
        },

        Phase::Calibrating => match incoming {
            Level::Emergency => Disposition::Preempt,
            // Calibration runs at safety priority, so an equal-level safety
            // command may displace it.
            Level::Safety => Disposition::Accept,
            _ => Disposition::RejectCalibrating { eta_sec: eta() },
        },
    }
}

// ===========================================================================
// Tests
// ===========================================================================
