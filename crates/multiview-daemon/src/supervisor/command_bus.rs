//! Process-wide play/pause broadcast and mute flag.
//!
//! Both are `watch` channels written only by the grid supervisor.  Tiles
//! react to a playback command only when its id is new to them.
use tokio::sync::watch;

use multiview_proto::protocol::{PlaybackAction, PlaybackCommand};

pub struct PlaybackBus {
    tx: watch::Sender<PlaybackCommand>,
}

impl PlaybackBus {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(PlaybackCommand::default());
        Self { tx }
    }

    /// Flip the action and bump the id.
    pub fn toggle(&self) -> PlaybackCommand {
        self.tx.send_modify(|cmd| {
            cmd.action = cmd.action.flipped();
            cmd.id += 1;
        });
        self.current()
    }

    pub fn current(&self) -> PlaybackCommand {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackCommand> {
        self.tx.subscribe()
    }
}

impl Default for PlaybackBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-tile memory of the last applied command id.
#[derive(Debug, Default)]
pub struct PlaybackFollower {
    last_id: Option<u64>,
}

impl PlaybackFollower {
    /// Start out as if `cmd` had already been applied.
    pub fn applied(cmd: PlaybackCommand) -> Self {
        Self {
            last_id: Some(cmd.id),
        }
    }

    /// The action to perform, or `None` when this id was already handled.
    pub fn observe(&mut self, cmd: PlaybackCommand) -> Option<PlaybackAction> {
        if self.last_id == Some(cmd.id) {
            return None;
        }
        self.last_id = Some(cmd.id);
        Some(cmd.action)
    }
}

pub struct MuteFlag {
    tx: watch::Sender<bool>,
}

impl MuteFlag {
    pub fn new(muted: bool) -> Self {
        let (tx, _) = watch::channel(muted);
        Self { tx }
    }

    /// Returns true when the value changed.
    pub fn set(&self, muted: bool) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == muted {
                false
            } else {
                *current = muted;
                true
            }
        })
    }

    pub fn toggle(&self) -> bool {
        let next = !self.get();
        self.set(next);
        next
    }

    pub fn get(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}
