//! Cross-cutting absolute bounds, applied after arbitration and before any
//! packet leaves: whatever level a command arrived at, the motor never runs
//! past its hard caps, and rain keeps automatic roof opening shut.

use std::time::Duration;
use tracing::warn;

use crate::fsm::Direction;
use crate::intent::Level;
use crate::registry::{ActuatorDescriptor, Kind};

/// Clamp a planned run to the actuator's absolute bounds. `timed` marks
/// caller-supplied seconds runs (irrigation, timed ON), which are bounded by
/// `max_duration_sec`; travel runs are bounded by `max_continuous`.
/// Returns the capped duration and whether capping occurred.
pub fn cap_run(desc: &ActuatorDescriptor, duration: Duration, timed: bool) -> (Duration, bool) {
    let mut capped = duration;

    if timed {
        if let Some(max) = desc.max_duration() {
            capped = capped.min(max);
        }
    } else if desc.kind == Kind::Duration {
        capped = capped.min(desc.max_continuous());
    }

    let clamped = capped < duration;
    if clamped {
        warn!(
            actuator = %desc.id,
            requested_secs = duration.as_secs_f64(),
            capped_secs = capped.as_secs_f64(),
            "run duration clamped to safety bound"
        );
    }
    (capped, clamped)
}

/// Rain interlock: while rain is detected, automatic (L4) opening of
/// rain-sensitive actuators is refused. Manual and safety levels pass; an
/// operator standing in the greenhouse outranks the rain sensor.
pub fn rain_blocked(
    desc: &ActuatorDescriptor,
    direction: Direction,
    level: Level,
    rain_active: bool,
) -> bool {
    rain_active && desc.rain_interlock && level == Level::Auto && direction == Direction::Open
}

// ===========================================================================
// Tests
// ===========================================================================
