//! Per-actuator state machine: IDLE / MOVING / COOLING / CALIBRATING,
//! duration planning, and position integration.
//!
//! Positions are never measured — they are integrated from motor-on time.
//! Every method here is a pure state mutation taking an explicit `now`; the
//! runner in [`crate::scheduler`] owns the bus sends, timers, and
//! persistence around these transitions, so each actuator's state is only
//! ever touched by its own task.
//!
//! ```text
//! IDLE ──accept──▶ MOVING ──timer──▶ COOLING ──timer──▶ IDLE
//!  │                  │  ▲                │
//!  │                  │  └──(pending job after cooling gap)
//!  │               preempt: freeze position, OFF, gap, new job
//!  └──calibrate──▶ CALIBRATING ──▶ position = 0, IDLE
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::CommandError;
use crate::intent::{Level, MotionJob, Switch, Target};
use crate::registry::{ActuatorDescriptor, Kind};

// ---------------------------------------------------------------------------
// Phases & directions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Moving,
    Cooling,
    Calibrating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Open,
    Close,
    None,
}

impl Direction {
    fn reverses(self, other: Direction) -> bool {
        matches!(
            (self, other),
            (Direction::Open, Direction::Close) | (Direction::Close, Direction::Open)
        )
    }
}

// ---------------------------------------------------------------------------
// Plans & active motion
// ---------------------------------------------------------------------------

/// What executing a job means for this actuator, given its current estimate.
#[derive(Debug, Clone, PartialEq)]
pub enum MotionPlan {
    /// Target equals the current estimate; succeed without touching the bus.
    NoOp,
    /// Timed energised run. `target_pct` is None for seconds-driven runs,
    /// which do not move the position estimate.
    Run {
        direction: Direction,
        duration: Duration,
        target_pct: Option<u8>,
    },
    /// Plain switch, no timer (on/off actuators).
    Switch { on: bool },
    /// De-energise only (binary OFF on a duration actuator).
    Stop,
}

#[derive(Debug, Clone)]
pub struct ActiveMotion {
    pub job: MotionJob,
    pub started_at: Instant,
    pub ends_at: Instant,
    pub planned: Duration,
    pub start_pct: u8,
    pub target_pct: Option<u8>,
    pub direction: Direction,
}

// ---------------------------------------------------------------------------
// The state machine
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ActuatorFsm {
    pub desc: Arc<ActuatorDescriptor>,
    pub position_pct: u8,
    pub phase: Phase,
    pub last_direction: Direction,
    pub motion: Option<ActiveMotion>,
    pub cooling_ends_at: Option<Instant>,
    /// A preempting job waiting out a cooling gap between OFF and its ON.
    pub pending: Option<MotionJob>,
    pub last_calibrated_at: Option<DateTime<Utc>>,
    /// Set when the position estimate cannot be trusted (unclean restart,
    /// interrupted calibration). Cleared by a completed calibration.
    pub stale: bool,
}

impl ActuatorFsm {
    pub fn new(desc: Arc<ActuatorDescriptor>) -> Self {
        Self {
            desc,
            position_pct: 0,
            phase: Phase::Idle,
            last_direction: Direction::None,
            motion: None,
            cooling_ends_at: None,
            pending: None,
            last_calibrated_at: None,
            stale: false,
        }
    }

    /// Rebuild from a persisted snapshot. A snapshot that claims the motor
    /// was energised means the process died mid-motion, so the estimate is
    /// stale no matter how the process exited.
    pub fn restore(
        desc: Arc<ActuatorDescriptor>,
        position_pct: u8,
        persisted_phase: Phase,
        last_direction: Direction,
        last_calibrated_at: Option<DateTime<Utc>>,
        unclean: bool,
    ) -> Self {
        let died_energised =
            matches!(persisted_phase, Phase::Moving | Phase::Calibrating);
        let mut fsm = Self::new(desc);
        fsm.position_pct = position_pct.min(100);
        fsm.last_direction = last_direction;
        fsm.last_calibrated_at = last_calibrated_at;
        fsm.stale = fsm.desc.calibratable() && (unclean || died_energised);
        fsm
    }

    // -- planning -----------------------------------------------------------

    /// Translate a target into a plan, given the current position estimate.
    pub fn plan(&self, target: Target) -> Result<MotionPlan, CommandError> {
        match (self.desc.kind, self.desc.has_limit, target) {
            // Limited travel: percent positioning (binary = fully open/closed).
            (Kind::Duration, true, Target::Percent(t)) => self.plan_travel(t),
            (Kind::Duration, true, Target::Binary(Switch::On)) => self.plan_travel(100),
            (Kind::Duration, true, Target::Binary(Switch::Off)) => self.plan_travel(0),
            (Kind::Duration, true, Target::Seconds(_)) => Err(CommandError::OutOfRange(
                format!("'{}' takes percent targets, not seconds", self.desc.id),
            )),

            // No physical limit: the caller supplies the run time directly.
            (Kind::Duration, false, Target::Seconds(s)) => {
                let duration = self.checked_seconds(s)?;
                Ok(MotionPlan::Run {
                    direction: Direction::Open,
                    duration,
                    target_pct: None,
                })
            }
            (Kind::Duration, false, Target::Binary(Switch::Off)) => Ok(MotionPlan::Stop),
            (Kind::Duration, false, Target::Binary(Switch::On)) => {
                Err(CommandError::OutOfRange(format!(
                    "'{}' has no end stop; give a duration in seconds",
                    self.desc.id
                )))
            }
            (Kind::Duration, false, Target::Percent(_)) => Err(CommandError::OutOfRange(
                format!("'{}' has no position scale", self.desc.id),
            )),

            // Pure switches.
            (Kind::OnOff, _, Target::Binary(s)) => self.plan_switch(s == Switch::On),
            (Kind::OnOff, _, Target::Percent(0)) => self.plan_switch(false),
            (Kind::OnOff, _, Target::Percent(100)) => self.plan_switch(true),
            (Kind::OnOff, _, Target::Percent(p)) => Err(CommandError::OutOfRange(format!(
                "'{}' is on/off; percent must be 0 or 100, got {p}",
                self.desc.id
            ))),
            (Kind::OnOff, _, Target::Seconds(s)) => {
                let duration = self.checked_seconds(s)?;
                Ok(MotionPlan::Run {
                    direction: Direction::None,
                    duration,
                    target_pct: None,
                })
            }
        }
    }

    fn plan_travel(&self, target: u8) -> Result<MotionPlan, CommandError> {
        if target > 100 {
            return Err(CommandError::OutOfRange(format!(
                "target {target}% outside 0-100"
            )));
        }
        let p = self.position_pct;
        if target == p {
            return Ok(MotionPlan::NoOp);
        }
        let (direction, duration) = if target > p {
            (
                Direction::Open,
                Duration::from_secs_f64(self.desc.full_open_sec * f64::from(target - p) / 100.0),
            )
        } else {
            (
                Direction::Close,
                Duration::from_secs_f64(self.desc.full_close_sec * f64::from(p - target) / 100.0),
            )
        };
        Ok(MotionPlan::Run {
            direction,
            duration,
            target_pct: Some(target),
        })
    }

    fn plan_switch(&self, on: bool) -> Result<MotionPlan, CommandError> {
        let already = if on {
            self.position_pct == 100
        } else {
            self.position_pct == 0
        };
        if already && self.phase == Phase::Idle {
            Ok(MotionPlan::NoOp)
        } else {
            Ok(MotionPlan::Switch { on })
        }
    }

    fn checked_seconds(&self, s: f64) -> Result<Duration, CommandError> {
        if !s.is_finite() || s <= 0.0 {
            return Err(CommandError::OutOfRange(format!(
                "seconds must be finite and > 0, got {s}"
            )));
        }
        let mut duration = Duration::from_secs_f64(s);
        if let Some(cap) = self.desc.max_duration() {
            duration = duration.min(cap);
        }
        Ok(duration)
    }

    // -- transitions ----------------------------------------------------------

    /// Enter MOVING for a timed run.
    pub fn begin_run(
        &mut self,
        job: MotionJob,
        direction: Direction,
        duration: Duration,
        target_pct: Option<u8>,
        now: Instant,
    ) {
        self.motion = Some(ActiveMotion {
            job,
            started_at: now,
            ends_at: now + duration,
            planned: duration,
            start_pct: self.position_pct,
            target_pct,
            direction,
        });
        self.phase = Phase::Moving;
        self.last_direction = direction;
        self.cooling_ends_at = None;
        self.pending = None;
        // An energised on/off actuator is "on" for the duration of the run.
        if self.desc.kind == Kind::OnOff {
            self.position_pct = 100;
        }
    }

    /// Instantaneous switch for an on/off actuator; enters cooling.
    pub fn apply_switch(&mut self, on: bool, now: Instant) {
        self.position_pct = if on { 100 } else { 0 };
        self.last_direction = Direction::None;
        self.motion = None;
        self.enter_cooling(self.desc.cooling(), None, now);
    }

    /// Finish the active run using wall-elapsed time, then enter cooling.
    /// Returns the final position, or None when no run was active.
    pub fn complete_run(&mut self, now: Instant) -> Option<u8> {
        let m = self.motion.take()?;
        if let Some(target) = m.target_pct {
            // Wall-elapsed, not planned: a late OFF means the motor ran
            // longer and the mechanism moved further.
            let frac = frac_elapsed(&m, now, false);
            self.position_pct = interpolate(m.start_pct, target, frac);
        } else if self.desc.kind == Kind::OnOff {
            self.position_pct = 0;
        }
        self.last_direction = m.direction;
        self.enter_cooling(self.desc.cooling(), None, now);
        Some(self.position_pct)
    }

    /// Freeze the position estimate of an interrupted run and drop it.
    /// Returns the frozen position, or None when no run was active.
    pub fn freeze_run(&mut self, now: Instant) -> Option<u8> {
        let m = self.motion.take()?;
        if let Some(target) = m.target_pct {
            let frac = frac_elapsed(&m, now, true);
            self.position_pct = interpolate(m.start_pct, target, frac);
        } else if self.desc.kind == Kind::OnOff {
            self.position_pct = 0;
        }
        self.last_direction = m.direction;
        self.phase = Phase::Idle;
        Some(self.position_pct)
    }

    /// The idle gap owed between an interrupted run's OFF and a preempting
    /// job's ON. L1 never waits; reversals wait longer.
    pub fn preemption_gap(&self, new_direction: Direction, new_level: Level) -> Duration {
        if new_level == Level::Emergency {
            return Duration::ZERO;
        }
        if self.last_direction.reverses(new_direction) {
            self.desc.reversal_cooling()
        } else {
            self.desc.cooling()
        }
    }

    /// True when a preempting run would be the exact motion already in
    /// flight; the runner then adopts the running motion instead of
    /// stopping and restarting the motor.
    pub fn adopts(&self, direction: Direction, target_pct: Option<u8>) -> bool {
        match (&self.motion, target_pct) {
            (Some(m), Some(t)) => {
                self.phase == Phase::Moving
                    && m.target_pct == Some(t)
                    && m.direction == direction
            }
            _ => false,
        }
    }

    /// Re-tag the in-flight motion with a newer job (adopted preemption).
    pub fn adopt_job(&mut self, job: MotionJob) {
        if let Some(m) = self.motion.as_mut() {
            m.job = job;
        }
    }

    pub fn enter_cooling(&mut self, duration: Duration, pending: Option<MotionJob>, now: Instant) {
        if duration.is_zero() && pending.is_none() {
            self.phase = Phase::Idle;
            self.cooling_ends_at = None;
            self.pending = None;
        } else {
            self.phase = Phase::Cooling;
            self.cooling_ends_at = Some(now + duration);
            self.pending = pending;
        }
    }

    /// Leave COOLING (timer expired or preempted). Returns any pending job.
    pub fn finish_cooling(&mut self) -> Option<MotionJob> {
        self.phase = Phase::Idle;
        self.cooling_ends_at = None;
        self.pending.take()
    }

    // -- calibration ----------------------------------------------------------

    /// Drive fully closed to reset the estimate. Only meaningful for
    /// actuators with a mechanical end stop. Returns the drive duration.
    pub fn begin_calibration(&mut self, now: Instant) -> Duration {
        let drive = self.desc.calibration_drive();
        let job = MotionJob {
            job_id: Uuid::new_v4().to_string(),
            actuator_id: self.desc.id.clone(),
            target: Target::Percent(0),
            level: Level::Safety,
            origin: "calibration".to_string(),
        };
        self.motion = Some(ActiveMotion {
            job,
            started_at: now,
            ends_at: now + drive,
            planned: drive,
            start_pct: self.position_pct,
            target_pct: Some(0),
            direction: Direction::Close,
        });
        self.phase = Phase::Calibrating;
        self.last_direction = Direction::Close;
        self.cooling_ends_at = None;
        self.pending = None;
        drive
    }

    /// The mechanism is at its end stop: the estimate is authoritative again.
    pub fn complete_calibration(&mut self, now: Instant) {
        self.motion = None;
        self.position_pct = 0;
        self.last_direction = Direction::Close;
        self.last_calibrated_at = Some(Utc::now());
        self.stale = false;
        self.enter_cooling(self.desc.cooling(), None, now);
    }

    // -- views ----------------------------------------------------------------

    pub fn current_level(&self) -> Option<Level> {
        match self.phase {
            Phase::Moving | Phase::Calibrating => self.motion.as_ref().map(|m| m.job.level),
            Phase::Cooling => self.pending.as_ref().map(|j| j.level),
            Phase::Idle => None,
        }
    }

    /// Seconds until the current phase ends, rounded up.
    pub fn eta_sec(&self, now: Instant) -> Option<u64> {
        let end = match self.phase {
            Phase::Moving | Phase::Calibrating => self.motion.as_ref().map(|m| m.ends_at),
            Phase::Cooling => self.cooling_ends_at,
            Phase::Idle => None,
        }?;
        Some(remaining_sec(end, now))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn frac_elapsed(m: &ActiveMotion, now: Instant, clamp_to_planned: bool) -> f64 {
    if m.planned.is_zero() {
        return 1.0;
    }
    let elapsed = now.saturating_duration_since(m.started_at).as_secs_f64();
    let frac = elapsed / m.planned.as_secs_f64();
    if clamp_to_planned {
        frac.clamp(0.0, 1.0)
    } else {
        frac.max(0.0)
    }
}

fn interpolate(start: u8, target: u8, frac: f64) -> u8 {
    let pos = f64::from(start) + (f64::from(target) - f64::from(start)) * frac;
    pos.round().clamp(0.0, 100.0) as u8
}

fn remaining_sec(end: Instant, now: Instant) -> u64 {
    end.saturating_duration_since(now).as_secs_f64().ceil() as u64
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ActuatorDescriptor, Kind};

    fn window_desc() -> Arc<ActuatorDescriptor> {
        Arc::new(ActuatorDescriptor {
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
        })
    }

    fn irri_desc() -> Arc<ActuatorDescriptor> {
        Arc::new(ActuatorDescriptor {
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
        })
    }

    fn fan_desc() -> Arc<ActuatorDescriptor> {
        Arc::new(ActuatorDescriptor {
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
        })
    }

    fn job(level: Level) -> MotionJob {
        MotionJob {
            job_id: "j".into(),
            actuator_id: "VenSdWin".into(),
            target: Target::Percent(50),
            level,
            origin: "test".into(),
        }
    }

    // -- planning ------------------------------------------------------------

    #[test]
    fn open_duration_is_proportional() {
        let fsm = ActuatorFsm::new(window_desc());
        match fsm.plan(Target::Percent(30)).unwrap() {
            MotionPlan::Run {
                direction,
                duration,
                target_pct,
            } => {
                assert_eq!(direction, Direction::Open);
                assert_eq!(duration, Duration::from_secs_f64(18.0));
                assert_eq!(target_pct, Some(30));
            }
            other => panic!("expected Run, got {other:?}"),
        }
    }

    #[test]
    fn close_uses_full_close_time() {
        let mut fsm = ActuatorFsm::new(window_desc());
        fsm.position_pct = 20;
        match fsm.plan(Target::Percent(0)).unwrap() {
            MotionPlan::Run {
                direction, duration, ..
            } => {
                assert_eq!(direction, Direction::Close);
                assert_eq!(duration, Duration::from_secs_f64(11.0));
            }
            other => panic!("expected Run, got {other:?}"),
        }
    }

    #[test]
    fn move_to_current_position_is_noop() {
        let mut fsm = ActuatorFsm::new(window_desc());
        fsm.position_pct = 30;
        assert_eq!(fsm.plan(Target::Percent(30)).unwrap(), MotionPlan::NoOp);
    }

    #[test]
    fn percent_above_100_rejected() {
        let fsm = ActuatorFsm::new(window_desc());
        assert!(matches!(
            fsm.plan(Target::Percent(101)),
            Err(CommandError::OutOfRange(_))
        ));
    }

    #[test]
    fn seconds_on_limited_actuator_rejected() {
        let fsm = ActuatorFsm::new(window_desc());
        assert!(fsm.plan(Target::Seconds(10.0)).is_err());
    }

    #[test]
    fn irrigation_seconds_clamped_to_max_duration() {
        let fsm = ActuatorFsm::new(irri_desc());
        match fsm.plan(Target::Seconds(10_000.0)).unwrap() {
            MotionPlan::Run { duration, target_pct, .. } => {
                assert_eq!(duration, Duration::from_secs_f64(3600.0));
                assert_eq!(target_pct, None);
            }
            other => panic!("expected Run, got {other:?}"),
        }
    }

    #[test]
    fn irrigation_percent_rejected() {
        let fsm = ActuatorFsm::new(irri_desc());
        assert!(fsm.plan(Target::Percent(50)).is_err());
    }

    #[test]
    fn irrigation_binary_on_rejected_off_stops() {
        let fsm = ActuatorFsm::new(irri_desc());
        assert!(fsm.plan(Target::Binary(Switch::On)).is_err());
        assert_eq!(fsm.plan(Target::Binary(Switch::Off)).unwrap(), MotionPlan::Stop);
    }

    #[test]
    fn negative_and_nan_seconds_rejected() {
        let fsm = ActuatorFsm::new(irri_desc());
        assert!(fsm.plan(Target::Seconds(0.0)).is_err());
        assert!(fsm.plan(Target::Seconds(-5.0)).is_err());
        assert!(fsm.plan(Target::Seconds(f64::NAN)).is_err());
    }

    #[test]
    fn onoff_percent_must_be_0_or_100() {
        let fsm = ActuatorFsm::new(fan_desc());
        assert!(matches!(fsm.plan(Target::Percent(100)).unwrap(), MotionPlan::Switch { on: true }));
        assert!(fsm.plan(Target::Percent(50)).is_err());
    }

    #[test]
    fn onoff_switch_to_same_state_is_noop() {
        let mut fsm = ActuatorFsm::new(fan_desc());
        assert_eq!(fsm.plan(Target::Binary(Switch::Off)).unwrap(), MotionPlan::NoOp);
        fsm.position_pct = 100;
        assert_eq!(fsm.plan(Target::Binary(Switch::On)).unwrap(), MotionPlan::NoOp);
    }

    // -- motion lifecycle ----------------------------------------------------

    #[test]
    fn completed_run_lands_on_target_and_cools() {
        let mut fsm = ActuatorFsm::new(window_desc());
        let t0 = Instant::now();
        fsm.begin_run(
            job(Level::Manual),
            Direction::Open,
            Duration::from_secs_f64(18.0),
            Some(30),
            t0,
        );
        assert_eq!(fsm.phase, Phase::Moving);
        assert_eq!(fsm.current_level(), Some(Level::Manual));

        let pos = fsm.complete_run(t0 + Duration::from_secs_f64(18.0)).unwrap();
        assert_eq!(pos, 30);
        assert_eq!(fsm.phase, Phase::Cooling);
        assert_eq!(fsm.last_direction, Direction::Open);
    }

    #[test]
    fn late_off_uses_wall_elapsed_time() {
        let mut fsm = ActuatorFsm::new(window_desc());
        let t0 = Instant::now();
        // 0 -> 50 over 30s; the OFF fires 3s late, so the mechanism kept
        // moving at 50/30 pct per second.
        fsm.begin_run(
            job(Level::Manual),
            Direction::Open,
            Duration::from_secs_f64(30.0),
            Some(50),
            t0,
        );
        let pos = fsm.complete_run(t0 + Duration::from_secs_f64(33.0)).unwrap();
        assert_eq!(pos, 55);
    }

    #[test]
    fn late_off_never_exceeds_100() {
        let mut fsm = ActuatorFsm::new(window_desc());
        let t0 = Instant::now();
        fsm.position_pct = 90;
        fsm.begin_run(
            job(Level::Manual),
            Direction::Open,
            Duration::from_secs_f64(6.0),
            Some(100),
            t0,
        );
        let pos = fsm.complete_run(t0 + Duration::from_secs_f64(60.0)).unwrap();
        assert_eq!(pos, 100);
    }

    #[test]
    fn freeze_interpolates_linearly() {
        let mut fsm = ActuatorFsm::new(window_desc());
        let t0 = Instant::now();
        // 0 -> 50 over 30s, interrupted at 12s: 0 + 50 * 12/30 = 20.
        fsm.begin_run(
            job(Level::Manual),
            Direction::Open,
            Duration::from_secs_f64(30.0),
            Some(50),
            t0,
        );
        let pos = fsm.freeze_run(t0 + Duration::from_secs_f64(12.0)).unwrap();
        assert_eq!(pos, 20);
        assert_eq!(fsm.position_pct, 20);
        assert!(fsm.motion.is_none());
    }

    #[test]
    fn freeze_clamps_fraction_to_planned() {
        let mut fsm = ActuatorFsm::new(window_desc());
        let t0 = Instant::now();
        fsm.begin_run(
            job(Level::Manual),
            Direction::Open,
            Duration::from_secs_f64(10.0),
            Some(40),
            t0,
        );
        let pos = fsm.freeze_run(t0 + Duration::from_secs_f64(25.0)).unwrap();
        assert_eq!(pos, 40);
    }

    #[test]
    fn seconds_run_leaves_position_untouched() {
        let mut fsm = ActuatorFsm::new(irri_desc());
        let t0 = Instant::now();
        let j = MotionJob {
            job_id: "j".into(),
            actuator_id: "Irri".into(),
            target: Target::Seconds(10.0),
            level: Level::Manual,
            origin: "test".into(),
        };
        fsm.begin_run(j, Direction::Open, Duration::from_secs_f64(10.0), None, t0);
        fsm.complete_run(t0 + Duration::from_secs_f64(10.0));
        assert_eq!(fsm.position_pct, 0);
    }

    #[test]
    fn timed_switch_run_tracks_on_state() {
        let mut fsm = ActuatorFsm::new(fan_desc());
        let t0 = Instant::now();
        let j = MotionJob {
            job_id: "j".into(),
            actuator_id: "VenFan".into(),
            target: Target::Seconds(120.0),
            level: Level::Manual,
            origin: "test".into(),
        };
        fsm.begin_run(j, Direction::None, Duration::from_secs(120), None, t0);
        assert_eq!(fsm.position_pct, 100);

        fsm.complete_run(t0 + Duration::from_secs(120));
        assert_eq!(fsm.position_pct, 0);
        assert_eq!(fsm.phase, Phase::Cooling);
    }

    // -- cooling & preemption gaps ------------------------------------------

    #[test]
    fn cooling_expires_into_idle() {
        let mut fsm = ActuatorFsm::new(window_desc());
        let t0 = Instant::now();
        fsm.enter_cooling(Duration::from_secs(5), None, t0);
        assert_eq!(fsm.phase, Phase::Cooling);
        assert_eq!(fsm.eta_sec(t0 + Duration::from_secs(4)), Some(1));
        assert!(fsm.finish_cooling().is_none());
        assert_eq!(fsm.phase, Phase::Idle);
    }

    #[test]
    fn zero_cooling_skips_the_phase() {
        let mut fsm = ActuatorFsm::new(window_desc());
        fsm.enter_cooling(Duration::ZERO, None, Instant::now());
        assert_eq!(fsm.phase, Phase::Idle);
    }

    #[test]
    fn emergency_preemption_never_waits() {
        let mut fsm = ActuatorFsm::new(window_desc());
        fsm.last_direction = Direction::Open;
        assert_eq!(
            fsm.preemption_gap(Direction::Close, Level::Emergency),
            Duration::ZERO
        );
    }

    #[test]
    fn reversal_waits_longer_than_same_direction() {
        let mut fsm = ActuatorFsm::new(window_desc());
        fsm.last_direction = Direction::Open;
        assert_eq!(
            fsm.preemption_gap(Direction::Close, Level::Safety),
            Duration::from_secs_f64(10.0)
        );
        assert_eq!(
            fsm.preemption_gap(Direction::Open, Level::Manual),
            Duration::from_secs_f64(5.0)
        );
    }

    #[test]
    fn identical_motion_is_adopted() {
        let mut fsm = ActuatorFsm::new(window_desc());
        let t0 = Instant::now();
        fsm.begin_run(
            job(Level::Manual),
            Direction::Open,
            Duration::from_secs_f64(30.0),
            Some(50),
            t0,
        );
        assert!(fsm.adopts(Direction::Open, Some(50)));
        assert!(!fsm.adopts(Direction::Open, Some(40)));
        assert!(!fsm.adopts(Direction::Close, Some(50)));
        assert!(!fsm.adopts(Direction::Open, None));
    }

    // -- switches -------------------------------------------------------------

    #[test]
    fn switch_on_sets_position_and_cools() {
        let mut fsm = ActuatorFsm::new(fan_desc());
        let t0 = Instant::now();
        fsm.apply_switch(true, t0);
        assert_eq!(fsm.position_pct, 100);
        assert_eq!(fsm.phase, Phase::Cooling);
        assert_eq!(fsm.eta_sec(t0), Some(30));
    }

    // -- calibration ----------------------------------------------------------

    #[test]
    fn calibration_drives_closed_with_margin() {
        let mut fsm = ActuatorFsm::new(window_desc());
        fsm.position_pct = 45;
        fsm.stale = true;
        let t0 = Instant::now();
        let drive = fsm.begin_calibration(t0);
        assert_eq!(drive, Duration::from_secs_f64(66.0));
        assert_eq!(fsm.phase, Phase::Calibrating);
        assert_eq!(fsm.current_level(), Some(Level::Safety));

        fsm.complete_calibration(t0 + drive);
        assert_eq!(fsm.position_pct, 0);
        assert!(!fsm.stale);
        assert!(fsm.last_calibrated_at.is_some());
        assert_eq!(fsm.phase, Phase::Cooling);
    }

    // -- restore --------------------------------------------------------------

    #[test]
    fn restore_after_unclean_shutdown_is_stale() {
        let fsm = ActuatorFsm::restore(
            window_desc(),
            45,
            Phase::Idle,
            Direction::Open,
            None,
            true,
        );
        assert!(fsm.stale);
        assert_eq!(fsm.position_pct, 45);
        assert_eq!(fsm.phase, Phase::Idle);
    }

    #[test]
    fn restore_mid_motion_is_stale_even_when_clean() {
        let fsm = ActuatorFsm::restore(
            window_desc(),
            45,
            Phase::Moving,
            Direction::Open,
            None,
            false,
        );
        assert!(fsm.stale);
    }

    #[test]
    fn restore_clean_idle_is_trusted() {
        let fsm = ActuatorFsm::restore(
            window_desc(),
            45,
            Phase::Idle,
            Direction::Open,
            None,
            false,
        );
        assert!(!fsm.stale);
    }

    #[test]
    fn irrigation_never_goes_stale() {
        let fsm = ActuatorFsm::restore(irri_desc(), 0, Phase::Moving, Direction::Open, None, true);
        assert!(!fsm.stale);
    }
}
