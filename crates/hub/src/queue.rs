//! Per-actuator waiting room: one bounded FIFO per priority level.
//!
//! Jobs land here when the arbiter says WAIT. When the actuator returns to
//! idle the runner drains the highest non-empty level first, FIFO within a
//! level. Entries that sat longer than the TTL are discarded at drain time.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

use crate::intent::{Level, MotionJob};

struct QueuedJob {
    job: MotionJob,
    enqueued_at: Instant,
}

pub struct CommandQueue {
    levels: [VecDeque<QueuedJob>; 5],
    capacity: usize,
    ttl: Duration,
}

impl CommandQueue {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            levels: Default::default(),
            capacity,
            ttl,
        }
    }

    /// Enqueue a job at its level. On overflow the oldest waiting job at
    /// that level is dropped and returned.
    pub fn push(&mut self, job: MotionJob, now: Instant) -> Option<MotionJob> {
        let slot = &mut self.levels[level_index(job.level)];
        let dropped = if slot.len() >= self.capacity {
            let old = slot.pop_front().map(|q| q.job);
            if let Some(ref o) = old {
                warn!(
                    actuator = %job.actuator_id,
                    level = %job.level,
                    dropped_job = %o.job_id,
                    "queue overflow, dropping oldest waiting job"
                );
            }
            old
        } else {
            None
        };
        slot.push_back(QueuedJob {
            job,
            enqueued_at: now,
        });
        dropped
    }

    /// Next runnable job: highest level first, oldest within a level.
    /// Expired entries encountered on the way are collected separately so
    /// the caller can report them.
    pub fn pop_ready(&mut self, now: Instant) -> (Option<MotionJob>, Vec<MotionJob>) {
        let mut expired = Vec::new();
        for slot in self.levels.iter_mut() {
            while let Some(q) = slot.pop_front() {
                if now.saturating_duration_since(q.enqueued_at) > self.ttl {
                    expired.push(q.job);
                    continue;
                }
                return (Some(q.job), expired);
            }
        }
        (None, expired)
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.levels.iter().all(VecDeque::is_empty)
    }

    pub fn len(&self) -> usize {
        self.levels.iter().map(VecDeque::len).sum()
    }
}

fn level_index(level: Level) -> usize {
    usize::from(level.number()) - 1
}

// ===========================================================================
// Tests
// ===========================================================================
