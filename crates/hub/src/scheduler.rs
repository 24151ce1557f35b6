//! The dispatch core: one runner task per actuator, plus the calibration
//! jobs that keep position estimates honest.
//!
//! Each runner owns its actuator's state machine and an mpsc inbox, so
//! commands for one actuator are linearised by arrival while different
//! actuators move in parallel. A runner never blocks across the wall time of
//! a motion: it parks on `sleep_until` and gives the inbox a chance to
//! preempt at every suspension point. A sleep that oversleeps (coalesced
//! timers, a loaded host) is harmless — positions are always computed from
//! wall-elapsed time at the moment the OFF actually happens.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::arbiter::{arbitrate, Disposition};
use crate::bus::{CcmBus, ControlFrame};
use crate::ccm::{self, SuffixMap};
use crate::config::QueueConfig;
use crate::error::CommandError;
use crate::fsm::{ActuatorFsm, Direction, MotionPlan, Phase};
use crate::intent::{ControlIntent, DispositionKind, IntentResponse, Level, MotionJob};
use crate::queue::CommandQueue;
use crate::registry::ActuatorRegistry;
use crate::safety;
use crate::state::SharedState;
use crate::store::{PersistedActuator, StateStore};

/// Inbox depth per actuator; commands beyond this apply backpressure on the
/// submitter, they are never dropped.
const INBOX_DEPTH: usize = 32;

/// How long shutdown waits for each runner to acknowledge its OFF.
const SHUTDOWN_ACK_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Commands into a runner
// ---------------------------------------------------------------------------

pub enum Cmd {
    Intent {
        intent: ControlIntent,
        reply: oneshot::Sender<IntentResponse>,
    },
    Calibrate {
        origin: String,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

// ---------------------------------------------------------------------------
// Hub: the handle the API layer talks to
// ---------------------------------------------------------------------------

pub struct Hub {
    handles: HashMap<String, mpsc::Sender<Cmd>>,
}

impl Hub {
    /// Submit a control intent and wait for its disposition.
    pub async fn submit(&self, intent: ControlIntent) -> IntentResponse {
        // L5 belongs to the far-side autonomous controller; callers here
        // speak L1-L4 only.
        if intent.level == Level::Fallback {
            return CommandError::OutOfRange(
                "level must be 1-4; L5 is the far-side fallback class".to_string(),
            )
            .to_response();
        }
        let Some(tx) = self.handles.get(&intent.actuator_id) else {
            return CommandError::UnknownActuator(intent.actuator_id.clone()).to_response();
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        if tx
            .send(Cmd::Intent {
                intent,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return IntentResponse::rejected("UNAVAILABLE", None);
        }
        reply_rx
            .await
            .unwrap_or_else(|_| IntentResponse::rejected("UNAVAILABLE", None))
    }

    /// Ask one actuator to calibrate (when idle, immediately; when busy, as
    /// soon as it next goes idle).
    pub async fn calibrate(&self, actuator_id: &str, origin: &str) {
        if let Some(tx) = self.handles.get(actuator_id) {
            let _ = tx
                .send(Cmd::Calibrate {
                    origin: origin.to_string(),
                })
                .await;
        }
    }

    pub async fn calibrate_all(&self, origin: &str) {
        for id in self.handles.keys() {
            self.calibrate(id, origin).await;
        }
    }

    /// Stop every runner, turning energised actuators OFF first.
    pub async fn shutdown_all(&self) {
        let mut acks = Vec::new();
        for (id, tx) in &self.handles {
            let (done_tx, done_rx) = oneshot::channel();
            if tx.send(Cmd::Shutdown { done: done_tx }).await.is_ok() {
                acks.push((id.clone(), done_rx));
            }
        }
        for (id, ack) in acks {
            if tokio::time::timeout(SHUTDOWN_ACK_TIMEOUT, ack).await.is_err() {
                warn!(actuator = %id, "runner did not acknowledge shutdown in time");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Spawning
// ---------------------------------------------------------------------------

/// Restore state and start one runner task per registered actuator.
///
/// `unclean_start` marks every restored position stale (crash recovery);
/// `calibrate_on_start` forces a startup calibration regardless. Either way
/// a stale limited actuator calibrates before any L3/L4 command is honoured.
#[allow(clippy::too_many_arguments)]
pub fn spawn_actuators(
    registry: &ActuatorRegistry,
    store: StateStore,
    bus: Arc<dyn CcmBus>,
    shared: SharedState,
    suffix: Arc<SuffixMap>,
    queue_cfg: &QueueConfig,
    rain: watch::Receiver<bool>,
    unclean_start: bool,
    calibrate_on_start: bool,
) -> Hub {
    let mut handles = HashMap::new();

    for desc in registry.iter() {
        let desc = Arc::new(desc.clone());
        let mut fsm = match store.get(&desc.id) {
            Some(p) => ActuatorFsm::restore(
                desc.clone(),
                p.position_pct,
                p.phase,
                p.last_direction,
                p.last_calibrated_at,
                unclean_start,
            ),
            None => ActuatorFsm::new(desc.clone()),
        };
        if calibrate_on_start && desc.calibratable() {
            fsm.stale = true;
        }

        let (tx, rx) = mpsc::channel(INBOX_DEPTH);
        let runner = Runner {
            fsm,
            queue: CommandQueue::new(queue_cfg.capacity, Duration::from_secs(queue_cfg.ttl_sec)),
            bus: bus.clone(),
            store: store.clone(),
            shared: shared.clone(),
            suffix: suffix.clone(),
            rain: rain.clone(),
            rx,
            recalibrate_when_idle: false,
        };
        tokio::spawn(runner.run());
        handles.insert(desc.id.clone(), tx);
    }

    Hub { handles }
}

// ---------------------------------------------------------------------------
// Daily calibration job
// ---------------------------------------------------------------------------

/// Fire a calibration for every limited actuator at the configured local
/// hour, forever. Intended to be `tokio::spawn`-ed from main.
pub async fn run_daily_calibration(hub: Arc<Hub>, hour: u8) {
    loop {
        let wait = duration_until_local_hour(hour);
        info!(hour, in_secs = wait.as_secs(), "next daily calibration scheduled");
        tokio::time::sleep(wait).await;
        info!(hour, "daily calibration trigger");
        hub.calibrate_all("daily reset").await;
        // Step past the triggering second so the next computation lands on
        // tomorrow's occurrence.
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

fn duration_until_local_hour(hour: u8) -> Duration {
    let now = Local::now().naive_local();
    let today = now
        .date()
        .and_hms_opt(u32::from(hour), 0, 0)
        .unwrap_or(now);
    let target = if today > now {
        today
    } else {
        today + chrono::Duration::days(1)
    };
    (target - now).to_std().unwrap_or(Duration::from_secs(60))
}

// ---------------------------------------------------------------------------
// Runner: one task per actuator
// ---------------------------------------------------------------------------

struct Runner {
    fsm: ActuatorFsm,
    queue: CommandQueue,
    bus: Arc<dyn CcmBus>,
    store: StateStore,
    shared: SharedState,
    suffix: Arc<SuffixMap>,
    rain: watch::Receiver<bool>,
    rx: mpsc::Receiver<Cmd>,
    /// An interrupted calibration must be redone once the actuator is free.
    recalibrate_when_idle: bool,
}

impl Runner {
    async fn run(mut self) {
        self.sync_view().await;
        // A stale estimate calibrates before the inbox is serviced, so no
        // L3/L4 command can sneak in ahead of the startup calibration.
        self.settle(Instant::now()).await;

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(Cmd::Intent { intent, reply }) => {
                        let resp = self.handle_intent(intent).await;
                        let _ = reply.send(resp);
                        // An intent can land the actuator straight in IDLE
                        // (emergency stop skips cooling): give waiting jobs
                        // their turn without waiting for a timer.
                        self.settle(Instant::now()).await;
                    }
                    Some(Cmd::Calibrate { origin }) => self.handle_calibrate(&origin).await,
                    Some(Cmd::Shutdown { done }) => {
                        self.handle_shutdown().await;
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.handle_shutdown().await;
                        break;
                    }
                },
                _ = sleep_until_opt(deadline) => {
                    self.on_deadline(Instant::now()).await;
                }
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        match self.fsm.phase {
            Phase::Moving | Phase::Calibrating => {
                let m = self.fsm.motion.as_ref()?;
                let mut deadline = m.ends_at;
                if self.fsm.desc.is_duration() {
                    // Max-continuous watchdog: the motor never stays
                    // energised past this, whatever the planned end.
                    deadline = deadline.min(m.started_at + self.fsm.desc.max_continuous());
                }
                Some(deadline)
            }
            Phase::Cooling => self.fsm.cooling_ends_at,
            Phase::Idle => None,
        }
    }

    // -- intent handling ----------------------------------------------------

    async fn handle_intent(&mut self, intent: ControlIntent) -> IntentResponse {
        let now = Instant::now();
        let job = MotionJob::from_intent(&intent);
        let summary = format!(
            "{} {} {:?} from {}",
            job.actuator_id, job.level, job.target, job.origin
        );

        // Shape errors reject before arbitration, whatever the phase: a
        // command that could never run must not report busy-state ETAs and
        // must not touch any state.
        let resp = match self.fsm.plan(job.target) {
            Err(e) => e.to_response(),
            Ok(_) => match arbitrate(&self.fsm, job.level, now) {
                Disposition::Accept => {
                    if self.fsm.phase == Phase::Calibrating {
                        // Safety command displacing a calibration run.
                        self.abort_calibration(job.level, now).await;
                    }
                    self.execute(job, now).await
                }
                Disposition::Preempt => self.preempt(job, now).await,
                Disposition::Wait => self.enqueue(job, now).await,
                Disposition::Lock { eta_sec } => CommandError::Locked { eta_sec }.to_response(),
                Disposition::RejectCooling { eta_sec } => {
                    CommandError::Cooling { eta_sec }.to_response()
                }
                Disposition::RejectCalibrating { eta_sec } => {
                    CommandError::Calibrating { eta_sec }.to_response()
                }
            },
        };

        info!(
            actuator = %self.fsm.desc.id,
            disposition = ?resp.disposition,
            reason = resp.reason.as_deref().unwrap_or(""),
            "{summary}"
        );
        self.shared
            .write()
            .await
            .record_command(format!("{summary} -> {:?}", resp.disposition));
        resp
    }

    async fn enqueue(&mut self, job: MotionJob, now: Instant) -> IntentResponse {
        let job_id = job.job_id.clone();
        if let Some(dropped) = self.queue.push(job, now) {
            self.record_fault(format!(
                "{}: waiting job {} dropped by queue overflow",
                self.fsm.desc.id, dropped.job_id
            ))
            .await;
        }
        info!(
            actuator = %self.fsm.desc.id,
            waiting = self.queue.len(),
            "command queued behind the current job"
        );
        IntentResponse::queued(&job_id)
    }

    /// Start a job on an idle actuator.
    async fn execute(&mut self, job: MotionJob, now: Instant) -> IntentResponse {
        let plan = match self.fsm.plan(job.target) {
            Ok(p) => p,
            Err(e) => return e.to_response(),
        };

        match plan {
            MotionPlan::NoOp => {
                // Already there; succeed without touching the bus.
                IntentResponse::accepted(&job.job_id)
            }

            MotionPlan::Stop => {
                // Re-assert OFF; harmless when already de-energised.
                self.send_off(job.level).await;
                IntentResponse::accepted(&job.job_id)
            }

            MotionPlan::Switch { on } => {
                if on {
                    if !self.send_on(job.level, Direction::None).await {
                        return CommandError::BusIo.to_response();
                    }
                } else {
                    self.send_off(job.level).await;
                }
                self.fsm.apply_switch(on, now);
                self.record_motion(format!(
                    "{} switched {}",
                    self.fsm.desc.id,
                    if on { "ON" } else { "OFF" }
                ))
                .await;
                self.persist();
                self.sync_view().await;
                IntentResponse::accepted(&job.job_id)
            }

            MotionPlan::Run {
                direction,
                duration,
                target_pct,
            } => {
                self.start_run(job, direction, duration, target_pct, now)
                    .await
            }
        }
    }

    async fn start_run(
        &mut self,
        job: MotionJob,
        direction: Direction,
        duration: Duration,
        target_pct: Option<u8>,
        now: Instant,
    ) -> IntentResponse {
        let timed = target_pct.is_none();
        let (duration, clamped) = safety::cap_run(&self.fsm.desc, duration, timed);
        if clamped {
            self.record_fault(format!(
                "{}: requested run clamped to {:.0}s",
                self.fsm.desc.id,
                duration.as_secs_f64()
            ))
            .await;
        }

        if safety::rain_blocked(&self.fsm.desc, direction, job.level, *self.rain.borrow()) {
            self.record_command(format!(
                "{}: L4 open refused, rain interlock active",
                self.fsm.desc.id
            ))
            .await;
            return CommandError::RainInterlock.to_response();
        }

        if !self.send_on(job.level, direction).await {
            // ON never made it out: the motion is treated as not started.
            return CommandError::BusIo.to_response();
        }

        let job_id = job.job_id.clone();
        self.fsm.begin_run(job, direction, duration, target_pct, now);
        self.record_motion(format!(
            "{}: {:?} run for {:.1}s{}",
            self.fsm.desc.id,
            direction,
            duration.as_secs_f64(),
            target_pct.map(|t| format!(" to {t}%")).unwrap_or_default()
        ))
        .await;
        self.persist();
        self.sync_view().await;
        IntentResponse::accepted(&job_id)
    }

    // -- preemption ---------------------------------------------------------

    async fn preempt(&mut self, job: MotionJob, now: Instant) -> IntentResponse {
        match self.fsm.phase {
            Phase::Moving => self.preempt_moving(job, now).await,
            Phase::Cooling => {
                // Validate before discarding anything: a malformed command
                // must not cost us a pending job waiting out its gap.
                if let Err(e) = self.fsm.plan(job.target) {
                    return e.to_response();
                }
                // L1/L2 cancel the cooling window and start immediately.
                if let Some(dropped) = self.fsm.finish_cooling() {
                    self.record_motion(format!(
                        "{}: pending job {} superseded during cooling",
                        self.fsm.desc.id, dropped.job_id
                    ))
                    .await;
                }
                self.execute(job, now).await
            }
            Phase::Calibrating => {
                // Same rule: only a runnable command may abort the drive.
                if let Err(e) = self.fsm.plan(job.target) {
                    return e.to_response();
                }
                self.abort_calibration(job.level, now).await;
                self.execute(job, now).await
            }
            Phase::Idle => self.execute(job, now).await,
        }
    }

    async fn preempt_moving(&mut self, job: MotionJob, now: Instant) -> IntentResponse {
        // Validate before touching the motor.
        let prelim = match self.fsm.plan(job.target) {
            Ok(p) => p,
            Err(e) => return e.to_response(),
        };

        // A preempting job identical to the in-flight motion adopts it:
        // one physical motion, no extra bus traffic.
        if let MotionPlan::Run {
            direction,
            target_pct: Some(t),
            ..
        } = prelim
        {
            if self.fsm.adopts(direction, Some(t)) {
                let job_id = job.job_id.clone();
                self.fsm.adopt_job(job);
                self.record_motion(format!(
                    "{}: identical motion adopted by {job_id}",
                    self.fsm.desc.id
                ))
                .await;
                return IntentResponse::accepted(&job_id);
            }
        }

        let interrupted = self.fsm.current_level();
        let frozen = self.fsm.freeze_run(now).unwrap_or(self.fsm.position_pct);
        self.send_off(job.level).await;
        self.record_motion(format!(
            "{}: {} motion preempted by {} at {frozen}%",
            self.fsm.desc.id,
            interrupted.map(|l| l.to_string()).unwrap_or_default(),
            job.level
        ))
        .await;
        self.persist();
        self.sync_view().await;

        // Re-plan from the frozen estimate.
        let plan = match self.fsm.plan(job.target) {
            Ok(p) => p,
            Err(e) => {
                self.fsm
                    .enter_cooling(self.fsm.desc.cooling(), None, now);
                self.persist();
                self.sync_view().await;
                return e.to_response();
            }
        };

        let resp = match plan {
            MotionPlan::NoOp => {
                // Stopped exactly on the new target: just cool down.
                self.fsm
                    .enter_cooling(self.fsm.desc.cooling(), None, now);
                IntentResponse::accepted(&job.job_id)
            }

            MotionPlan::Stop => {
                // Emergency stops skip cooling; anything else cools normally.
                let gap = if job.level == Level::Emergency {
                    Duration::ZERO
                } else {
                    self.fsm.desc.cooling()
                };
                self.fsm.enter_cooling(gap, None, now);
                IntentResponse::accepted(&job.job_id)
            }

            MotionPlan::Switch { on } => {
                if on {
                    if !self.send_on(job.level, Direction::None).await {
                        self.fsm
                            .enter_cooling(self.fsm.desc.cooling(), None, now);
                        self.persist();
                        self.sync_view().await;
                        return CommandError::BusIo.to_response();
                    }
                }
                self.fsm.apply_switch(on, now);
                IntentResponse::accepted(&job.job_id)
            }

            MotionPlan::Run {
                direction,
                duration,
                target_pct,
            } => {
                let timed = target_pct.is_none();
                let (duration, _) = safety::cap_run(&self.fsm.desc, duration, timed);
                if safety::rain_blocked(&self.fsm.desc, direction, job.level, *self.rain.borrow())
                {
                    self.fsm
                        .enter_cooling(self.fsm.desc.cooling(), None, now);
                    self.persist();
                    self.sync_view().await;
                    return CommandError::RainInterlock.to_response();
                }

                let gap = self.fsm.preemption_gap(direction, job.level);
                if gap.is_zero() {
                    return self.start_run(job, direction, duration, target_pct, now).await;
                }

                // Wait out the (reversal) cooling gap, then launch.
                let job_id = job.job_id.clone();
                self.record_motion(format!(
                    "{}: waiting {:.0}s cooling before reversal",
                    self.fsm.desc.id,
                    gap.as_secs_f64()
                ))
                .await;
                self.fsm.enter_cooling(gap, Some(job), now);
                IntentResponse::accepted(&job_id)
            }
        };
        self.persist();
        self.sync_view().await;
        resp
    }

    // -- timer expiry -------------------------------------------------------

    async fn on_deadline(&mut self, now: Instant) {
        match self.fsm.phase {
            Phase::Moving => {
                let Some(m) = self.fsm.motion.as_ref() else {
                    return;
                };
                let level = m.job.level;
                let overrun = now < m.ends_at;
                self.send_off(level).await;
                let pos = self.fsm.complete_run(now);
                if overrun {
                    error!(
                        actuator = %self.fsm.desc.id,
                        "watchdog: motor energised past max continuous time, forced OFF"
                    );
                    self.record_fault(format!(
                        "{}: OVERRUN, watchdog forced OFF, position clamped to {}%",
                        self.fsm.desc.id, self.fsm.position_pct
                    ))
                    .await;
                } else {
                    self.record_motion(format!(
                        "{}: motion complete at {}%",
                        self.fsm.desc.id,
                        pos.unwrap_or(self.fsm.position_pct)
                    ))
                    .await;
                }
                self.persist();
                self.sync_view().await;
                if self.fsm.phase == Phase::Idle {
                    self.settle(now).await;
                }
            }

            Phase::Calibrating => {
                self.send_off(Level::Safety).await;
                self.fsm.complete_calibration(now);
                info!(actuator = %self.fsm.desc.id, "calibration complete, position reset to 0");
                self.record_motion(format!(
                    "{}: calibration complete, position reset to 0%",
                    self.fsm.desc.id
                ))
                .await;
                self.persist();
                self.sync_view().await;
                if self.fsm.phase == Phase::Idle {
                    self.settle(now).await;
                }
            }

            Phase::Cooling => {
                let pending = self.fsm.finish_cooling();
                self.persist();
                self.sync_view().await;
                if let Some(job) = pending {
                    let resp = self.execute(job.clone(), now).await;
                    if resp.disposition == DispositionKind::Rejected {
                        self.record_fault(format!(
                            "{}: pending job {} failed after cooling: {}",
                            self.fsm.desc.id,
                            job.job_id,
                            resp.reason.as_deref().unwrap_or("?")
                        ))
                        .await;
                    }
                }
                if self.fsm.phase == Phase::Idle {
                    self.settle(now).await;
                }
            }

            Phase::Idle => {}
        }
    }

    /// Idle housekeeping: run an owed calibration, then drain the waiting
    /// queue (highest level first) until something sticks.
    async fn settle(&mut self, now: Instant) {
        while self.fsm.phase == Phase::Idle {
            if self.fsm.desc.calibratable() && (self.recalibrate_when_idle || self.fsm.stale) {
                self.recalibrate_when_idle = false;
                if !self.start_calibration("stale position estimate").await {
                    break; // bus refused the drive; the next trigger retries
                }
                continue;
            }

            let (job, expired) = self.queue.pop_ready(now);
            for e in expired {
                warn!(
                    actuator = %self.fsm.desc.id,
                    job = %e.job_id,
                    origin = %e.origin,
                    "queued job expired before the actuator became free"
                );
                self.record_command(format!(
                    "{}: queued job {} from {} dropped: {}",
                    self.fsm.desc.id,
                    e.job_id,
                    e.origin,
                    CommandError::QueuedExpired.code()
                ))
                .await;
            }
            let Some(job) = job else { break };

            let resp = self.execute(job.clone(), now).await;
            if resp.disposition == DispositionKind::Rejected {
                self.record_command(format!(
                    "{}: queued job {} rejected: {}",
                    self.fsm.desc.id,
                    job.job_id,
                    resp.reason.as_deref().unwrap_or("?")
                ))
                .await;
            }
        }
    }

    // -- calibration --------------------------------------------------------

    async fn handle_calibrate(&mut self, origin: &str) {
        if !self.fsm.desc.calibratable() {
            return;
        }
        match self.fsm.phase {
            Phase::Idle => {
                self.start_calibration(origin).await;
            }
            Phase::Calibrating => {}
            _ => {
                // Calibration only enters from IDLE; remember the debt.
                self.recalibrate_when_idle = true;
            }
        }
    }

    async fn start_calibration(&mut self, origin: &str) -> bool {
        let now = Instant::now();
        if !self.send_on(Level::Safety, Direction::Close).await {
            return false;
        }
        let drive = self.fsm.begin_calibration(now);
        info!(
            actuator = %self.fsm.desc.id,
            drive_secs = drive.as_secs_f64(),
            origin,
            "calibration started"
        );
        self.record_motion(format!(
            "{}: calibration started ({origin}), driving closed for {:.0}s",
            self.fsm.desc.id,
            drive.as_secs_f64()
        ))
        .await;
        self.persist();
        self.sync_view().await;
        true
    }

    async fn abort_calibration(&mut self, off_level: Level, now: Instant) {
        self.fsm.freeze_run(now);
        self.send_off(off_level).await;
        self.recalibrate_when_idle = true;
        warn!(actuator = %self.fsm.desc.id, "calibration interrupted, will rerun when idle");
        self.record_motion(format!(
            "{}: calibration interrupted by {off_level}",
            self.fsm.desc.id
        ))
        .await;
        self.persist();
        self.sync_view().await;
    }

    // -- shutdown -----------------------------------------------------------

    async fn handle_shutdown(&mut self) {
        if matches!(self.fsm.phase, Phase::Moving | Phase::Calibrating) {
            let level = self.fsm.current_level().unwrap_or(Level::Safety);
            let now = Instant::now();
            self.fsm.freeze_run(now);
            self.send_off(level).await;
            warn!(
                actuator = %self.fsm.desc.id,
                position = self.fsm.position_pct,
                "stopped for shutdown"
            );
        }
        self.persist();
        self.sync_view().await;
    }

    // -- bus ----------------------------------------------------------------

    fn frame(&self, level: Level, value: u8) -> ControlFrame {
        let desc = &self.fsm.desc;
        ControlFrame {
            ccm_type: self.suffix.control_type(&desc.id, level),
            value,
            priority: level.wire_priority(),
            room: desc.room,
            region: desc.region,
            order: desc.order,
        }
    }

    fn on_value(&self, direction: Direction) -> u8 {
        // Limited travel motors are driven in one of two directions; the
        // close-ward relay rides on its own wire value.
        if direction == Direction::Close && self.fsm.desc.is_duration() && self.fsm.desc.has_limit
        {
            ccm::VALUE_CLOSE
        } else {
            ccm::VALUE_ON
        }
    }

    async fn send_on(&self, level: Level, direction: Direction) -> bool {
        let frame = self.frame(level, self.on_value(direction));
        match self.bus.send(frame).await {
            Ok(()) => true,
            Err(e) => {
                error!(actuator = %self.fsm.desc.id, "ON send failed: {e:#}");
                self.record_fault(format!("{}: ON send failed: {e:#}", self.fsm.desc.id))
                    .await;
                false
            }
        }
    }

    /// OFF is accounted as sent even when the bus errors: the alternative,
    /// pretending the motor might still be running, helps nobody.
    async fn send_off(&self, level: Level) {
        let frame = self.frame(level, ccm::VALUE_OFF);
        if let Err(e) = self.bus.send(frame).await {
            error!(actuator = %self.fsm.desc.id, "OFF send failed: {e:#}");
            self.record_fault(format!("{}: OFF send failed: {e:#}", self.fsm.desc.id))
                .await;
        }
    }

    // -- persistence & view -------------------------------------------------

    fn persist(&self) {
        self.store.put(&self.fsm.desc.id, self.persisted_state());
    }

    fn persisted_state(&self) -> PersistedActuator {
        let now_inst = Instant::now();
        let now_wall = Utc::now();
        let to_wall = |t: Instant| {
            if t >= now_inst {
                now_wall + chrono::Duration::from_std(t - now_inst).unwrap_or_default()
            } else {
                now_wall - chrono::Duration::from_std(now_inst - t).unwrap_or_default()
            }
        };
        PersistedActuator {
            position_pct: self.fsm.position_pct,
            phase: self.fsm.phase,
            last_direction: self.fsm.last_direction,
            last_calibrated_at: self.fsm.last_calibrated_at,
            motion_started_at: self.fsm.motion.as_ref().map(|m| to_wall(m.started_at)),
            motion_ends_at: self.fsm.motion.as_ref().map(|m| to_wall(m.ends_at)),
        }
    }

    async fn sync_view(&self) {
        let mut st = self.shared.write().await;
        st.record_phase(
            &self.fsm.desc.id,
            self.fsm.phase,
            self.fsm.position_pct,
            self.fsm.current_level().map(Level::number),
            self.fsm.stale,
        );
    }

    async fn record_motion(&self, detail: String) {
        self.shared.write().await.record_motion(detail);
    }

    async fn record_command(&self, detail: String) {
        self.shared.write().await.record_command(detail);
    }

    async fn record_fault(&self, detail: String) {
        self.shared.write().await.record_fault(detail);
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
