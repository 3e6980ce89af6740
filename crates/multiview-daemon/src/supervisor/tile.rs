//! Per-tile transition table.
//!
//! `TileMachine` is plain data: every input carries its timestamp and every
//! output is a list of [`TileEffect`]s for the actor to execute.  Timers are
//! deadlines; the actor sleeps until [`TileMachine::next_deadline`] and then
//! calls [`TileMachine::poll`].
//!
//! | state   | fatal error                     | playing                    | debounce due        | recovery due |
//! |---------|---------------------------------|----------------------------|---------------------|--------------|
//! | Healthy | mitigate, arm debounce if idle  | cancel debounce, reset     | → Stalled, schedule | n/a          |
//! | Stalled | left to recovery                | → Healthy, stop, reset     | n/a                 | attempt      |
use tokio::time::Instant;
use tracing::{debug, info, warn};

use multiview_proto::protocol::{
    HealthState, PlaybackAction, PlaybackCommand, SilenceState, StreamDescriptor, TileSnapshot,
};

use super::alert::{alert_message, AlertAggregator, AlertEdge};
use super::command_bus::PlaybackFollower;
use super::debounce::{mitigation_for, StallDebouncer};
use super::recovery::RecoveryScheduler;
use super::silence::SilenceDetector;
use super::TileTimings;
use crate::transport::{PlaybackReadiness, SessionEvent, SessionOp, SpectrumFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileEffect {
    Session(SessionOp),
    RaiseAlarm(&'static str),
    ClearAlarm,
}

pub struct TileMachine {
    index: usize,
    stream: StreamDescriptor,
    health: HealthState,
    paused: bool,
    debouncer: StallDebouncer,
    recovery: RecoveryScheduler,
    silence: SilenceDetector,
    alert: AlertAggregator,
    follower: PlaybackFollower,
}

impl TileMachine {
    /// `playback` is the bus value at creation time; it is applied by
    /// [`TileMachine::attach`] rather than as a fresh command.
    pub fn new(
        index: usize,
        stream: StreamDescriptor,
        timings: &TileTimings,
        playback: PlaybackCommand,
    ) -> Self {
        Self {
            index,
            stream,
            health: HealthState::Healthy,
            paused: playback.action == PlaybackAction::Pause,
            debouncer: StallDebouncer::new(timings.debounce),
            recovery: RecoveryScheduler::new(timings.recovery_interval, timings.hard_reload_every),
            silence: SilenceDetector::new(
                timings.silence_threshold,
                timings.silence_duration,
                timings.frame_interval,
            ),
            alert: AlertAggregator::default(),
            follower: PlaybackFollower::applied(playback),
        }
    }

    #[cfg(test)]
    pub fn health(&self) -> HealthState {
        self.health
    }

    #[cfg(test)]
    pub fn silence(&self) -> SilenceState {
        self.silence.state()
    }

    #[cfg(test)]
    pub fn attempts(&self) -> u32 {
        self.recovery.attempts()
    }

    pub fn url(&self) -> &str {
        &self.stream.url
    }

    /// Initial or externally requested attach.  Starts a clean episode.
    pub fn attach(&mut self, reattach: bool) -> Vec<TileEffect> {
        self.health = HealthState::Healthy;
        self.debouncer.cancel();
        self.recovery.reset();

        let mut effects = Vec::new();
        if reattach {
            effects.push(TileEffect::Session(SessionOp::Detach));
        }
        effects.extend(
            [SessionOp::Attach, SessionOp::LoadSource, SessionOp::StartLoad, self.resume_op()]
                .map(TileEffect::Session),
        );
        self.refresh_alert(&mut effects);
        effects
    }

    pub fn on_session_event(&mut self, event: SessionEvent, now: Instant) -> Vec<TileEffect> {
        let mut effects = Vec::new();
        match (self.health, event) {
            (_, SessionEvent::Error { kind, fatal: false, detail }) => {
                debug!("tile {}: non-fatal {:?} error: {}", self.index, kind, detail);
            }
            (HealthState::Healthy, SessionEvent::Error { kind, detail, .. }) => {
                info!("tile {}: fatal {:?} error: {}", self.index, kind, detail);
                effects.extend(mitigation_for(kind).iter().copied().map(TileEffect::Session));
                if self.debouncer.arm(now) {
                    debug!("tile {}: stall debounce armed", self.index);
                }
            }
            (HealthState::Stalled, SessionEvent::Error { kind, detail, .. }) => {
                debug!("tile {}: fatal {:?} error while stalled: {}", self.index, kind, detail);
            }
            (state, SessionEvent::Playing) => {
                self.debouncer.cancel();
                self.recovery.reset();
                if state == HealthState::Stalled {
                    info!("tile {}: Stalled -> Healthy", self.index);
                    self.health = HealthState::Healthy;
                    self.refresh_alert(&mut effects);
                }
            }
        }
        effects
    }

    /// Fire whichever timers are due at `now`.
    pub fn poll(&mut self, now: Instant) -> Vec<TileEffect> {
        let mut effects = Vec::new();
        if self.debouncer.fire_due(now) && self.health == HealthState::Healthy {
            warn!("tile {}: Healthy -> Stalled ({})", self.index, self.stream.title);
            self.health = HealthState::Stalled;
            self.recovery.start(now);
            self.refresh_alert(&mut effects);
        }
        if self.health == HealthState::Stalled {
            if let Some(attempt) = self.recovery.tick_due(now) {
                info!(
                    "tile {}: recovery attempt {}{}",
                    self.index,
                    attempt.number,
                    if attempt.hard_reload { " (hard reload)" } else { "" }
                );
                effects.extend(attempt.ops().into_iter().map(TileEffect::Session));
                effects.push(TileEffect::Session(self.resume_op()));
            }
        }
        effects
    }

    pub fn sample_audio(
        &mut self,
        frame: Option<&SpectrumFrame>,
        readiness: PlaybackReadiness,
        now: Instant,
    ) -> Vec<TileEffect> {
        let mut effects = Vec::new();
        if let Some(state) = self.silence.sample(frame, readiness.is_active(), now) {
            info!("tile {}: audio {:?}", self.index, state);
            self.refresh_alert(&mut effects);
        }
        effects
    }

    pub fn on_playback_command(&mut self, cmd: PlaybackCommand) -> Vec<TileEffect> {
        match self.follower.observe(cmd) {
            Some(action) => {
                self.paused = action == PlaybackAction::Pause;
                vec![TileEffect::Session(self.resume_op())]
            }
            None => Vec::new(),
        }
    }

    /// Earliest pending timer, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.debouncer.deadline(), self.recovery.deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn snapshot(&self) -> TileSnapshot {
        let message = alert_message(self.health, self.silence.state());
        TileSnapshot {
            index: self.index,
            stream: Some(self.stream.clone()),
            health: self.health,
            silence: self.silence.state(),
            paused: self.paused,
            recovery_attempts: self.recovery.attempts(),
            alert: message.is_some(),
            alert_message: message.map(str::to_string),
        }
    }

    /// Play or pause, following the last applied bus command.
    fn resume_op(&self) -> SessionOp {
        if self.paused {
            SessionOp::Pause
        } else {
            SessionOp::Play
        }
    }

    fn refresh_alert(&mut self, effects: &mut Vec<TileEffect>) {
        match self.alert.update(self.health, self.silence.state()) {
            Some(AlertEdge::Raised(msg)) => effects.push(TileEffect::RaiseAlarm(msg)),
            Some(AlertEdge::Cleared) => effects.push(TileEffect::ClearAlarm),
            None => {}
        }
    }
}
