//! The task that owns one tile: its session, alarm and timers.
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use multiview_proto::protocol::{PlaybackCommand, StreamDescriptor, TileSnapshot};

use super::tile::{TileEffect, TileMachine};
use super::TileTimings;
use crate::alarm::Alarm;
use crate::transport::{self, SessionEvent, SessionOp, TransportErrorKind, TransportSession};

/// Snapshot pushed to the grid core whenever a tile's visible state changes.
#[derive(Debug, Clone)]
pub struct TileReport {
    pub index: usize,
    pub generation: u64,
    pub snapshot: TileSnapshot,
}

pub struct TileContext {
    pub index: usize,
    pub generation: u64,
    pub stream: StreamDescriptor,
    pub timings: TileTimings,
    pub start_delay: Duration,
    pub playback_rx: watch::Receiver<PlaybackCommand>,
    pub mute_rx: watch::Receiver<bool>,
    pub report_tx: mpsc::UnboundedSender<TileReport>,
    pub cancel: CancellationToken,
}

struct Tile<S, A> {
    session: S,
    alarm: A,
    machine: TileMachine,
    mute_rx: watch::Receiver<bool>,
    report_tx: mpsc::UnboundedSender<TileReport>,
    index: usize,
    generation: u64,
    last_report: Option<TileSnapshot>,
}

impl<S: TransportSession, A: Alarm> Tile<S, A> {
    /// Run effects in order.  Session failures are logged and swallowed; a
    /// failed attach is fed back as a fatal error so the stall path takes over.
    async fn execute(&mut self, effects: Vec<TileEffect>) {
        let mut pending = effects;
        while !pending.is_empty() {
            let mut attach_failed = None;
            for effect in pending {
                match effect {
                    TileEffect::Session(op) => {
                        match transport::apply(&mut self.session, op, self.machine.url()).await {
                            Ok(()) if op == SessionOp::Attach => {
                                let muted = *self.mute_rx.borrow();
                                if let Err(e) = self.session.set_muted(muted).await {
                                    warn!("tile {}: mute after attach failed: {}", self.index, e);
                                }
                            }
                            Ok(()) => {}
                            Err(e) if op == SessionOp::Attach => {
                                warn!("tile {}: attach failed: {}", self.index, e);
                                attach_failed = Some(e.to_string());
                            }
                            Err(e) => debug!("tile {}: {:?} failed: {}", self.index, op, e),
                        }
                    }
                    TileEffect::RaiseAlarm(message) => self.alarm.start(message),
                    TileEffect::ClearAlarm => self.alarm.stop(),
                }
            }
            pending = match attach_failed {
                Some(detail) => self.machine.on_session_event(
                    SessionEvent::Error {
                        kind: TransportErrorKind::Unknown,
                        fatal: true,
                        detail,
                    },
                    Instant::now(),
                ),
                None => Vec::new(),
            };
        }
    }

    /// Run effects unless the tile is cancelled first.  Returns false when
    /// cancellation interrupted them; the in-flight operation is dropped.
    async fn execute_until(&mut self, effects: Vec<TileEffect>, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("tile {}: cancelled mid-operation", self.index);
                false
            }
            _ = self.execute(effects) => true,
        }
    }

    fn report(&mut self) {
        let snapshot = self.machine.snapshot();
        if self.last_report.as_ref() == Some(&snapshot) {
            return;
        }
        self.last_report = Some(snapshot.clone());
        let _ = self.report_tx.send(TileReport {
            index: self.index,
            generation: self.generation,
            snapshot,
        });
    }

    async fn release(&mut self) {
        if self.alarm.is_running() {
            info!("tile {}: releasing active alarm", self.index);
            self.alarm.stop();
        }
        if let Err(e) = self.session.detach().await {
            debug!("tile {}: detach on exit failed: {}", self.index, e);
        }
    }
}

/// Drive one tile until cancelled.  The alarm is stopped and the session
/// detached on every exit path.
pub async fn run_tile<S, A>(session: S, alarm: A, ctx: TileContext)
where
    S: TransportSession,
    A: Alarm,
{
    let TileContext {
        index,
        generation,
        stream,
        timings,
        start_delay,
        mut playback_rx,
        mut mute_rx,
        report_tx,
        cancel,
    } = ctx;

    let initial = *playback_rx.borrow_and_update();
    mute_rx.borrow_and_update();
    let mut tile = Tile {
        session,
        alarm,
        machine: TileMachine::new(index, stream, &timings, initial),
        mute_rx: mute_rx.clone(),
        report_tx,
        index,
        generation,
        last_report: None,
    };

    if !start_delay.is_zero() {
        debug!("tile {}: attaching in {:?}", index, start_delay);
        tokio::select! {
            _ = cancel.cancelled() => {
                tile.release().await;
                return;
            }
            _ = tokio::time::sleep(start_delay) => {}
        }
    }

    let effects = tile.machine.attach(false);
    if !tile.execute_until(effects, &cancel).await {
        tile.release().await;
        return;
    }
    tile.report();

    let mut audio = tokio::time::interval(timings.frame_interval);
    audio.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let deadline = tile.machine.next_deadline();
        let effects = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = tile.session.next_event() => {
                tile.machine.on_session_event(event, Instant::now())
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                tile.machine.poll(Instant::now())
            }
            changed = playback_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let cmd = *playback_rx.borrow_and_update();
                tile.machine.on_playback_command(cmd)
            }
            changed = mute_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let muted = *mute_rx.borrow_and_update();
                vec![TileEffect::Session(SessionOp::SetMuted(muted))]
            }
            _ = audio.tick() => {
                let frame = tile.session.latest_spectrum();
                let readiness = tile.session.readiness();
                tile.machine.sample_audio(frame.as_ref(), readiness, Instant::now())
            }
        };
        if !tile.execute_until(effects, &cancel).await {
            break;
        }
        tile.report();
    }

    debug!("tile {}: shutting down", index);
    tile.release().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::testing::RecordingAlarm;
    use crate::supervisor::command_bus::{MuteFlag, PlaybackBus};
    use crate::transport::testing::{FakeSession, SessionLog};
    use crate::transport::SpectrumFrame;
    use multiview_proto::protocol::{HealthState, SilenceState};

    struct Harness {
        reports: mpsc::UnboundedReceiver<TileReport>,
        events: mpsc::UnboundedSender<SessionEvent>,
        log: SessionLog,
        alarm: RecordingAlarm,
        cancel: CancellationToken,
        bus: PlaybackBus,
        mute: MuteFlag,
        task: tokio::task::JoinHandle<()>,
    }

    impl Harness {
        /// Wait for the first report matching `pred`.
        async fn until(&mut self, pred: impl Fn(&TileSnapshot) -> bool) -> TileSnapshot {
            loop {
                let report = self.reports.recv().await.expect("tile exited");
                if pred(&report.snapshot) {
                    return report.snapshot;
                }
            }
        }
    }

    fn spawn(configure: impl FnOnce(&mut FakeSession, &mut TileTimings)) -> Harness {
        let (mut session, events, log) = FakeSession::new();
        let mut timings = TileTimings::default();
        configure(&mut session, &mut timings);
        let alarm = RecordingAlarm::default();
        let (report_tx, reports) = mpsc::unbounded_channel();
        let bus = PlaybackBus::new();
        let mute = MuteFlag::new(true);
        let cancel = CancellationToken::new();
        let ctx = TileContext {
            index: 0,
            generation: 1,
            stream: StreamDescriptor {
                id: "1".into(),
                title: "News".into(),
                url: "https://example.com/news/index.m3u8".into(),
            },
            timings,
            start_delay: Duration::ZERO,
            playback_rx: bus.subscribe(),
            mute_rx: mute.subscribe(),
            report_tx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(run_tile(session, alarm.clone(), ctx));
        Harness {
            reports,
            events,
            log,
            alarm,
            cancel,
            bus,
            mute,
            task,
        }
    }

    fn fatal_network() -> SessionEvent {
        SessionEvent::Error {
            kind: TransportErrorKind::Network,
            fatal: true,
            detail: "manifest load error".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stall_at_ten_seconds_then_recovery_every_five() {
        let start = Instant::now();
        let mut h = spawn(|_, _| {});
        h.events.send(fatal_network()).unwrap();

        let stalled = h.until(|s| s.health == HealthState::Stalled).await;
        assert_eq!(start.elapsed(), Duration::from_millis(10_000));
        assert!(stalled.alert);
        assert_eq!(h.alarm.transitions(), vec![true]);

        for attempt in 1..=3u32 {
            h.until(|s| s.recovery_attempts == attempt).await;
            assert_eq!(
                start.elapsed(),
                Duration::from_millis(10_000 + 5_000 * attempt as u64)
            );
            let attaches = h.log.count(SessionOp::Attach);
            assert_eq!(attaches, if attempt < 3 { 1 } else { 2 });
        }

        h.events.send(SessionEvent::Playing).unwrap();
        let healthy = h.until(|s| s.health == HealthState::Healthy).await;
        assert_eq!(healthy.recovery_attempts, 0);
        assert!(!healthy.alert);
        assert_eq!(h.alarm.transitions(), vec![true, false]);

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn playing_before_deadline_keeps_tile_healthy() {
        let mut h = spawn(|_, _| {});
        h.events.send(fatal_network()).unwrap();
        tokio::time::sleep(Duration::from_millis(9_000)).await;
        h.events.send(SessionEvent::Playing).unwrap();
        tokio::time::sleep(Duration::from_millis(30_000)).await;

        h.cancel.cancel();
        h.task.await.unwrap();
        while let Ok(report) = h.reports.try_recv() {
            assert_eq!(report.snapshot.health, HealthState::Healthy);
        }
        assert!(h.alarm.transitions().is_empty());
        assert_eq!(h.log.count(SessionOp::StartLoad), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn three_seconds_of_quiet_raises_silence_alert() {
        let start = Instant::now();
        let mut h = spawn(|session, timings| {
            session.spectrum = Some(SpectrumFrame::flat(2, 32, 0));
            timings.silence_duration = Duration::from_millis(3_000);
            timings.frame_interval = Duration::from_millis(50);
        });
        let silent = h.until(|s| s.silence == SilenceState::Silent).await;
        assert_eq!(start.elapsed(), Duration::from_millis(3_000));
        assert_eq!(silent.alert_message.as_deref(), Some("audio silent"));
        assert_eq!(silent.health, HealthState::Healthy);
        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn bus_and_mute_changes_reach_the_session() {
        let mut h = spawn(|_, _| {});
        h.until(|_| true).await;
        assert_eq!(
            h.log.ops(),
            vec![
                SessionOp::Attach,
                SessionOp::SetMuted(true),
                SessionOp::LoadSource,
                SessionOp::StartLoad,
                SessionOp::Play,
            ]
        );

        h.bus.toggle();
        let paused = h.until(|s| s.paused).await;
        assert!(paused.paused);
        h.mute.set(false);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.log.count(SessionOp::Pause), 1);
        assert_eq!(h.log.count(SessionOp::SetMuted(false)), 1);

        h.cancel.cancel();
        h.task.await.unwrap();
        assert_eq!(h.log.ops().last(), Some(&SessionOp::Detach));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attach_goes_down_the_stall_path() {
        let start = Instant::now();
        let mut h = spawn(|session, _| session.fail_attach = true);
        h.until(|s| s.health == HealthState::Stalled).await;
        assert_eq!(start.elapsed(), Duration::from_millis(10_000));
        h.cancel.cancel();
        h.task.await.unwrap();
        assert!(h.alarm.transitions().ends_with(&[false]));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_during_stagger_never_attaches() {
        let (session, _events, log) = FakeSession::new();
        let (report_tx, mut reports) = mpsc::unbounded_channel();
        let bus = PlaybackBus::new();
        let mute = MuteFlag::new(false);
        let cancel = CancellationToken::new();
        let ctx = TileContext {
            index: 4,
            generation: 1,
            stream: StreamDescriptor::default(),
            timings: TileTimings::default(),
            start_delay: Duration::from_millis(1_500),
            playback_rx: bus.subscribe(),
            mute_rx: mute.subscribe(),
            report_tx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(run_tile(session, RecordingAlarm::default(), ctx));
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        cancel.cancel();
        task.await.unwrap();
        assert_eq!(log.ops(), vec![SessionOp::Detach]);
        assert!(reports.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_a_slow_attach() {
        let h = spawn(|session, _| session.attach_delay = Duration::from_secs(30));
        tokio::time::sleep(Duration::from_millis(100)).await;
        let cancelled_at = Instant::now();
        h.cancel.cancel();
        h.task.await.unwrap();
        assert!(cancelled_at.elapsed() < Duration::from_secs(1));
        assert_eq!(h.log.ops(), vec![SessionOp::Detach]);
    }
}
