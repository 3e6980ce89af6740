//! Single-owner event loop: client commands and tile reports in, grid state
//! and broadcasts out.
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use multiview_proto::config::{Config, MAX_GRID_DIMENSION};
use multiview_proto::protocol::{Command, StreamDescriptor, TileSnapshot};
use multiview_proto::state::GridStateStore;
use multiview_proto::streams::StreamDirectory;

use crate::supervisor::actor::TileReport;
use crate::supervisor::grid::{GridSupervisor, TileFactory};
use crate::supervisor::stagger::StaggerSchedule;
use crate::supervisor::TileTimings;
use crate::BroadcastMessage;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid request: {0}")]
    Invalid(String),
}

/// A command's result: the stream it created, if any.
pub type CommandResult = Result<Option<StreamDescriptor>, CommandError>;

pub enum GridEvent {
    /// A client command; the outcome goes back on `reply`.
    Request {
        command: Command,
        reply: oneshot::Sender<CommandResult>,
    },
    Shutdown,
}

pub struct GridCore<F: TileFactory> {
    directory: StreamDirectory,
    store: Arc<GridStateStore>,
    grid: GridSupervisor<F>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    report_rx: mpsc::UnboundedReceiver<TileReport>,
}

impl<F: TileFactory> GridCore<F> {
    pub fn new(
        config: &Config,
        factory: F,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
    ) -> Self {
        Self::with_stagger(
            config,
            factory,
            StaggerSchedule::from_config(&config.stagger),
            broadcast_tx,
        )
    }

    pub fn with_stagger(
        config: &Config,
        factory: F,
        stagger: StaggerSchedule,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
    ) -> Self {
        let (rows, columns) = config.grid.clamped();
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        info!(
            "core: {}x{} grid, stagger seed {:?}",
            rows,
            columns,
            stagger.seed()
        );
        Self {
            directory: StreamDirectory::new(config.streams.clone()),
            store: Arc::new(GridStateStore::new(rows, columns, config.grid.muted)),
            grid: GridSupervisor::new(
                factory,
                TileTimings::from_config(config),
                stagger,
                config.grid.muted,
                report_tx,
            ),
            broadcast_tx,
            report_rx,
        }
    }

    pub fn store(&self) -> Arc<GridStateStore> {
        Arc::clone(&self.store)
    }

    pub async fn run(mut self, mut event_rx: mpsc::Receiver<GridEvent>) -> anyhow::Result<()> {
        self.streams_changed().await;

        loop {
            tokio::select! {
                event = event_rx.recv() => match event {
                    Some(GridEvent::Request { command, reply }) => {
                        let result = self.handle_command(command).await;
                        if let Err(e) = &result {
                            warn!("core: command failed: {}", e);
                        }
                        let _ = reply.send(result);
                    }
                    Some(GridEvent::Shutdown) | None => break,
                },
                Some(report) = self.report_rx.recv() => self.handle_report(report).await,
            }
        }

        info!("core: shutting down");
        self.grid.shutdown().await;
        Ok(())
    }

    pub(crate) async fn handle_command(&mut self, command: Command) -> CommandResult {
        debug!("core: {:?}", command);
        let mut created = None;
        match command {
            Command::TogglePlayback => {
                let cmd = self.grid.toggle_playback();
                self.store.set_playback(cmd).await;
            }
            Command::ToggleMute => {
                let muted = self.grid.toggle_mute();
                self.store.set_muted(muted).await;
            }
            Command::SetMute { muted } => {
                self.grid.set_muted(muted);
                self.store.set_muted(muted).await;
            }
            Command::Reattach { tile } => {
                let placeholder = self
                    .grid
                    .reattach(tile)
                    .await
                    .ok_or_else(|| CommandError::NotFound(format!("tile {}", tile)))?;
                self.apply_tile(placeholder).await;
            }
            Command::AddStream { title, url } => {
                let url = url.trim().to_string();
                if url.is_empty() {
                    return Err(CommandError::Invalid("stream url is empty".into()));
                }
                let title = if title.trim().is_empty() { url.clone() } else { title };
                created = Some(self.directory.add(title, url));
                self.streams_changed().await;
            }
            Command::UpdateStream { stream } => {
                let id = stream.id.clone();
                if !self.directory.update(stream) {
                    return Err(CommandError::NotFound(format!("stream {}", id)));
                }
                self.streams_changed().await;
            }
            Command::RemoveStream { id } => {
                self.directory
                    .remove(&id)
                    .ok_or_else(|| CommandError::NotFound(format!("stream {}", id)))?;
                self.streams_changed().await;
            }
            Command::ImportStreams { streams } => {
                let added = self.directory.import(streams);
                info!("core: imported {} streams", added);
                self.streams_changed().await;
            }
            Command::SetGrid { rows, columns } => {
                let valid = 1..=MAX_GRID_DIMENSION;
                if !valid.contains(&rows) || !valid.contains(&columns) {
                    return Err(CommandError::Invalid(format!(
                        "grid {}x{} outside 1..={}",
                        rows, columns, MAX_GRID_DIMENSION
                    )));
                }
                self.store.set_dimensions(rows, columns).await;
                self.recompose().await;
            }
            Command::GetState => return Ok(None),
        }
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
        Ok(created)
    }

    pub(crate) async fn handle_report(&mut self, report: TileReport) {
        if !self.grid.is_current(report.index, report.generation) {
            debug!(
                "core: dropping stale report for tile {} gen {}",
                report.index, report.generation
            );
            return;
        }
        self.apply_tile(report.snapshot).await;
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
    }

    async fn streams_changed(&mut self) {
        self.store.set_streams(self.directory.list().to_vec()).await;
        self.recompose().await;
    }

    async fn recompose(&mut self) {
        let capacity = self.store.get_state().await.capacity();
        let changed = self.grid.compose(self.directory.list(), capacity).await;
        for snapshot in changed {
            self.apply_tile(snapshot).await;
        }
    }

    /// Store a snapshot and announce alert edges.
    async fn apply_tile(&self, snapshot: TileSnapshot) {
        let (index, alert, message) = (snapshot.index, snapshot.alert, snapshot.alert_message.clone());
        match self.store.set_tile(snapshot).await {
            Some(previous) if previous != alert => {
                info!(
                    "core: tile {} alert={} ({} alerting)",
                    index,
                    alert,
                    self.store.get_state().await.alerting()
                );
                let _ = self.broadcast_tx.send(BroadcastMessage::Alert {
                    tile: index,
                    active: alert,
                    message,
                });
            }
            _ => {}
        }
    }
}
