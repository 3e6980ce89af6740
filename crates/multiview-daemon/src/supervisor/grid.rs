//! Owns the set of tile actors, the global mute flag and the playback bus.
use futures_util::future::join_all;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use multiview_proto::protocol::{PlaybackCommand, StreamDescriptor, TileSnapshot};

use super::actor::{run_tile, TileContext, TileReport};
use super::command_bus::{MuteFlag, PlaybackBus};
use super::stagger::StaggerSchedule;
use super::TileTimings;
use crate::alarm::Alarm;
use crate::transport::TransportSession;

/// Builds the per-tile resources the supervisor hands to each actor.
pub trait TileFactory: Send + 'static {
    type Session: TransportSession;
    type Alarm: Alarm;

    fn session(&self, index: usize, generation: u64, stream: &StreamDescriptor) -> Self::Session;
    fn alarm(&self, index: usize) -> Self::Alarm;
}

struct TileSlot {
    stream: StreamDescriptor,
    generation: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct GridSupervisor<F: TileFactory> {
    factory: F,
    timings: TileTimings,
    stagger: StaggerSchedule,
    slots: Vec<Option<TileSlot>>,
    next_generation: u64,
    playback: PlaybackBus,
    mute: MuteFlag,
    report_tx: mpsc::UnboundedSender<TileReport>,
}

impl<F: TileFactory> GridSupervisor<F> {
    pub fn new(
        factory: F,
        timings: TileTimings,
        stagger: StaggerSchedule,
        muted: bool,
        report_tx: mpsc::UnboundedSender<TileReport>,
    ) -> Self {
        Self {
            factory,
            timings,
            stagger,
            slots: Vec::new(),
            next_generation: 1,
            playback: PlaybackBus::new(),
            mute: MuteFlag::new(muted),
            report_tx,
        }
    }

    /// Assign `streams[i]` to slot `i` for the first `capacity` slots.  Slots
    /// whose descriptor changed are torn down and recreated; unchanged slots
    /// keep their tile.  Returns a placeholder snapshot for every slot whose
    /// tile was replaced or cleared.
    pub async fn compose(
        &mut self,
        streams: &[StreamDescriptor],
        capacity: usize,
    ) -> Vec<TileSnapshot> {
        let mut retired = Vec::new();
        let mut changed = Vec::new();

        for index in 0..self.slots.len().max(capacity) {
            let wanted = if index < capacity { streams.get(index) } else { None };
            let current = self.slots.get(index).and_then(|s| s.as_ref()).map(|s| &s.stream);
            if current == wanted {
                continue;
            }
            if let Some(old) = self.slots.get_mut(index).and_then(Option::take) {
                old.cancel.cancel();
                retired.push(old.task);
            }
            if index < capacity {
                changed.push(placeholder(index, wanted));
            }
            if let Some(stream) = wanted {
                let delay = self.stagger.delay(index);
                let slot = self.spawn_tile(index, stream.clone(), delay);
                if index >= self.slots.len() {
                    self.slots.resize_with(index + 1, || None);
                }
                self.slots[index] = Some(slot);
            }
        }
        self.slots.truncate(capacity);
        if self.slots.len() < capacity {
            self.slots.resize_with(capacity, || None);
        }

        Self::join(retired).await;
        info!(
            "grid: composed {} tiles into {} slots ({} changed)",
            streams.len().min(capacity),
            capacity,
            changed.len()
        );
        changed
    }

    /// Tear down and immediately recreate one tile.
    pub async fn reattach(&mut self, index: usize) -> Option<TileSnapshot> {
        let old = self.slots.get_mut(index)?.take()?;
        info!("grid: reattaching tile {}", index);
        old.cancel.cancel();
        let stream = old.stream.clone();
        Self::join(vec![old.task]).await;
        self.slots[index] = Some(self.spawn_tile(index, stream.clone(), Duration::ZERO));
        Some(placeholder(index, Some(&stream)))
    }

    pub fn toggle_playback(&self) -> PlaybackCommand {
        let cmd = self.playback.toggle();
        info!("grid: playback {:?} (id {})", cmd.action, cmd.id);
        cmd
    }

    pub fn set_muted(&self, muted: bool) -> bool {
        if self.mute.set(muted) {
            info!("grid: muted={}", muted);
        }
        muted
    }

    pub fn toggle_mute(&self) -> bool {
        let muted = self.mute.toggle();
        info!("grid: muted={}", muted);
        muted
    }

    /// Whether a report from `generation` still belongs to the live tile.
    pub fn is_current(&self, index: usize, generation: u64) -> bool {
        matches!(self.slots.get(index), Some(Some(slot)) if slot.generation == generation)
    }

    pub fn tile_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub async fn shutdown(&mut self) {
        let tasks: Vec<_> = self
            .slots
            .drain(..)
            .flatten()
            .map(|slot| {
                slot.cancel.cancel();
                slot.task
            })
            .collect();
        info!("grid: shutting down {} tiles", tasks.len());
        Self::join(tasks).await;
    }

    fn spawn_tile(&mut self, index: usize, stream: StreamDescriptor, delay: Duration) -> TileSlot {
        let generation = self.next_generation;
        self.next_generation += 1;
        debug!(
            "grid: tile {} gen {} -> {} ({})",
            index, generation, stream.title, stream.url
        );

        let cancel = CancellationToken::new();
        let ctx = TileContext {
            index,
            generation,
            stream: stream.clone(),
            timings: self.timings.clone(),
            start_delay: delay,
            playback_rx: self.playback.subscribe(),
            mute_rx: self.mute.subscribe(),
            report_tx: self.report_tx.clone(),
            cancel: cancel.clone(),
        };
        let session = self.factory.session(index, generation, &stream);
        let alarm = self.factory.alarm(index);
        let task = tokio::spawn(run_tile(session, alarm, ctx));
        TileSlot {
            stream,
            generation,
            cancel,
            task,
        }
    }

    async fn join(tasks: Vec<JoinHandle<()>>) {
        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!("grid: tile task ended abnormally: {}", e);
            }
        }
    }
}

fn placeholder(index: usize, stream: Option<&StreamDescriptor>) -> TileSnapshot {
    TileSnapshot {
        stream: stream.cloned(),
        ..TileSnapshot::empty(index)
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::alarm::testing::RecordingAlarm;
    use crate::transport::testing::{FakeSession, SessionLog};
    use crate::transport::SessionEvent;
    use std::sync::{Arc, Mutex};

    /// Hands out fake sessions and remembers each one's log and event feed.
    #[derive(Clone, Default)]
    pub struct FakeFactory {
        logs: Arc<Mutex<Vec<(usize, SessionLog)>>>,
        events: Arc<Mutex<Vec<(usize, mpsc::UnboundedSender<SessionEvent>)>>>,
    }

    impl FakeFactory {
        /// Logs of every session created for `index`, oldest first.
        pub fn log_for(&self, index: usize) -> Vec<SessionLog> {
            self.logs
                .lock()
                .unwrap()
                .iter()
                .filter(|(i, _)| *i == index)
                .map(|(_, log)| log.clone())
                .collect()
        }

        /// Feed an event to the newest session of `index`.
        pub fn send(&self, index: usize, event: SessionEvent) {
            let events = self.events.lock().unwrap();
            let (_, tx) = events.iter().rev().find(|(i, _)| *i == index).unwrap();
            tx.send(event).unwrap();
        }
    }

    impl TileFactory for FakeFactory {
        type Session = FakeSession;
        type Alarm = RecordingAlarm;

        fn session(&self, index: usize, _generation: u64, _stream: &StreamDescriptor) -> FakeSession {
            let (session, events, log) = FakeSession::new();
            self.events.lock().unwrap().push((index, events));
            self.logs.lock().unwrap().push((index, log));
            session
        }

        fn alarm(&self, _index: usize) -> RecordingAlarm {
            RecordingAlarm::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeFactory;
    use super::*;
    use crate::transport::SessionOp;
    use tokio::time::Instant;

    fn stream(id: &str) -> StreamDescriptor {
        StreamDescriptor {
            id: id.into(),
            title: format!("Stream {}", id),
            url: format!("https://example.com/{}/index.m3u8", id),
        }
    }

    fn supervisor(
        stagger: StaggerSchedule,
    ) -> (
        GridSupervisor<FakeFactory>,
        FakeFactory,
        mpsc::UnboundedReceiver<TileReport>,
    ) {
        let factory = FakeFactory::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let grid = GridSupervisor::new(factory.clone(), TileTimings::default(), stagger, false, tx);
        (grid, factory, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn initial_attach_is_staggered_by_index() {
        let stagger = StaggerSchedule::new(Duration::from_millis(100), Duration::from_millis(300));
        let (mut grid, _factory, mut reports) = supervisor(stagger);
        let start = Instant::now();
        grid.compose(&[stream("a"), stream("b"), stream("c")], 4).await;
        assert_eq!(grid.tile_count(), 3);

        let mut seen = Vec::new();
        for _ in 0..3 {
            let report = reports.recv().await.unwrap();
            seen.push((report.index, start.elapsed().as_millis()));
        }
        assert_eq!(seen, vec![(0, 100), (1, 400), (2, 700)]);
        grid.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn recompose_only_replaces_changed_slots() {
        let (mut grid, factory, mut reports) = supervisor(StaggerSchedule::immediate());
        grid.compose(&[stream("a"), stream("b")], 4).await;
        for _ in 0..2 {
            reports.recv().await.unwrap();
        }

        let mut edited = stream("b");
        edited.title = "Renamed".into();
        let changed = grid.compose(&[stream("a"), edited.clone()], 4).await;
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].index, 1);
        assert_eq!(changed[0].stream.as_ref(), Some(&edited));

        assert_eq!(factory.log_for(0).len(), 1);
        let slot1 = factory.log_for(1);
        assert_eq!(slot1.len(), 2);
        assert_eq!(slot1[0].ops().last(), Some(&SessionOp::Detach));
        assert!(!grid.is_current(1, 2));
        assert!(grid.is_current(1, 3));
        assert!(grid.is_current(0, 1));

        // Shrinking the grid clears the slots beyond capacity.
        let changed = grid.compose(&[stream("a"), edited], 1).await;
        assert!(changed.is_empty());
        assert_eq!(grid.tile_count(), 1);
        assert!(!grid.is_current(1, 3));
        grid.shutdown().await;
        assert_eq!(grid.tile_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn removing_a_stream_clears_its_slot() {
        let (mut grid, _factory, _reports) = supervisor(StaggerSchedule::immediate());
        grid.compose(&[stream("a"), stream("b")], 2).await;
        let changed = grid.compose(&[stream("b")], 2).await;
        // Slot 0 now hosts "b", slot 1 is empty.
        assert_eq!(changed.len(), 2);
        assert_eq!(changed[0].stream.as_ref().map(|s| s.id.as_str()), Some("b"));
        assert_eq!(changed[1].stream, None);
        assert_eq!(grid.tile_count(), 1);
        grid.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reattach_is_immediate_and_bumps_generation() {
        let stagger = StaggerSchedule::new(Duration::from_millis(500), Duration::from_millis(300));
        let (mut grid, factory, mut reports) = supervisor(stagger);
        grid.compose(&[stream("a"), stream("b")], 2).await;
        reports.recv().await.unwrap();
        reports.recv().await.unwrap();

        let start = Instant::now();
        let placeholder = grid.reattach(1).await.unwrap();
        assert_eq!(placeholder.index, 1);
        let report = reports.recv().await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!((report.index, report.generation), (1, 3));
        assert_eq!(factory.log_for(1).len(), 2);
        assert!(grid.reattach(7).await.is_none());
        grid.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn playback_toggle_reaches_every_tile_once() {
        let (mut grid, factory, mut reports) = supervisor(StaggerSchedule::immediate());
        grid.compose(&[stream("a"), stream("b"), stream("c")], 3).await;
        for _ in 0..3 {
            reports.recv().await.unwrap();
        }
        let cmd = grid.toggle_playback();
        assert_eq!(cmd.id, 1);
        for _ in 0..3 {
            assert!(reports.recv().await.unwrap().snapshot.paused);
        }
        assert!(grid.toggle_mute());
        tokio::time::sleep(Duration::from_millis(1)).await;

        for index in 0..3 {
            let log = &factory.log_for(index)[0];
            assert_eq!(log.count(SessionOp::Pause), 1);
            assert_eq!(log.count(SessionOp::SetMuted(true)), 1);
        }

        // A tile created after the toggle starts out paused.
        grid.compose(&[stream("a"), stream("b"), stream("c"), stream("d")], 4).await;
        let late = reports.recv().await.unwrap();
        assert_eq!(late.index, 3);
        assert!(late.snapshot.paused);
        let log = &factory.log_for(3)[0];
        assert_eq!(log.count(SessionOp::Pause), 1);
        assert_eq!(log.count(SessionOp::Play), 0);
        assert_eq!(log.count(SessionOp::SetMuted(true)), 1);
        grid.shutdown().await;
    }
}
