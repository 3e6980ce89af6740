//! Collapses bursts of fatal transport errors into one stall decision.
use std::time::Duration;
use tokio::time::Instant;

use crate::transport::{SessionOp, TransportErrorKind};

/// A single pending "declare stalled" deadline.
#[derive(Debug)]
pub struct StallDebouncer {
    timeout: Duration,
    deadline: Option<Instant>,
}

impl StallDebouncer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: None,
        }
    }

    /// Start the window unless one is already running.  Returns true when a
    /// new window was opened.
    pub fn arm(&mut self, now: Instant) -> bool {
        if self.deadline.is_some() {
            return false;
        }
        self.deadline = Some(now + self.timeout);
        true
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True exactly once, when the window has elapsed at `now`.
    pub fn fire_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

/// Cheap, class-specific mitigation issued as soon as a fatal error arrives.
pub fn mitigation_for(kind: TransportErrorKind) -> &'static [SessionOp] {
    match kind {
        TransportErrorKind::Network => &[SessionOp::StartLoad],
        TransportErrorKind::Media => &[SessionOp::RecoverMediaError],
        TransportErrorKind::Unknown => &[SessionOp::StartLoad, SessionOp::RecoverMediaError],
    }
}
