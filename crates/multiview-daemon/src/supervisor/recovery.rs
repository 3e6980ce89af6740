//! Periodic, escalating retry loop for a stalled tile.
use std::time::Duration;
use tokio::time::Instant;

use crate::transport::SessionOp;

/// One scheduler tick's worth of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryAttempt {
    pub number: u32,
    pub hard_reload: bool,
}

impl RecoveryAttempt {
    /// Session operations for this attempt, excluding the final resume.
    pub fn ops(&self) -> Vec<SessionOp> {
        let mut ops = vec![SessionOp::StartLoad, SessionOp::RecoverMediaError];
        if self.hard_reload {
            ops.extend([
                SessionOp::StopLoad,
                SessionOp::Detach,
                SessionOp::Attach,
                SessionOp::LoadSource,
                SessionOp::StartLoad,
            ]);
        }
        ops
    }
}

#[derive(Debug)]
pub struct RecoveryScheduler {
    interval: Duration,
    hard_reload_every: u32,
    next: Option<Instant>,
    attempts: u32,
}

impl RecoveryScheduler {
    pub fn new(interval: Duration, hard_reload_every: u32) -> Self {
        Self {
            interval,
            hard_reload_every,
            next: None,
            attempts: 0,
        }
    }

    /// Schedule the first tick one interval from `now`.  No-op while running.
    pub fn start(&mut self, now: Instant) {
        if self.next.is_none() {
            self.next = Some(now + self.interval);
        }
    }

    pub fn stop(&mut self) {
        self.next = None;
    }

    /// Stop and forget the episode's attempt count.
    pub fn reset(&mut self) {
        self.stop();
        self.attempts = 0;
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.next.is_some()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.next
    }

    /// At most one attempt per call; the next tick is one interval after `now`.
    pub fn tick_due(&mut self, now: Instant) -> Option<RecoveryAttempt> {
        let due = self.next?;
        if due > now {
            return None;
        }
        self.attempts += 1;
        self.next = Some(now + self.interval);
        Some(RecoveryAttempt {
            number: self.attempts,
            hard_reload: self.hard_reload_every > 0 && self.attempts % self.hard_reload_every == 0,
        })
    }
}
