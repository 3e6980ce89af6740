use crate::protocol::{GridState, PlaybackCommand, StreamDescriptor, TileSnapshot};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared, revisioned grid state.  Written by the daemon core, read by the
/// socket and HTTP servers.
pub struct GridStateStore {
    state: Arc<RwLock<GridState>>,
}

impl GridStateStore {
    pub fn new(rows: u16, columns: u16, muted: bool) -> Self {
        let mut state = GridState {
            rev: 1,
            rows,
            columns,
            muted,
            ..Default::default()
        };
        state.tiles = (0..state.capacity()).map(TileSnapshot::empty).collect();
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    pub async fn get_state(&self) -> GridState {
        self.state.read().await.clone()
    }

    pub async fn set_streams(&self, streams: Vec<StreamDescriptor>) {
        let mut state = self.state.write().await;
        state.streams = streams;
        state.rev += 1;
    }

    /// Store a tile snapshot.  Returns the previous alert flag of that slot,
    /// or `None` when the index is outside the grid.
    pub async fn set_tile(&self, snapshot: TileSnapshot) -> Option<bool> {
        let mut state = self.state.write().await;
        let slot = state.tiles.get_mut(snapshot.index)?;
        let previous = slot.alert;
        *slot = snapshot;
        state.rev += 1;
        Some(previous)
    }

    pub async fn set_muted(&self, muted: bool) {
        let mut state = self.state.write().await;
        state.muted = muted;
        state.rev += 1;
    }

    pub async fn set_playback(&self, playback: PlaybackCommand) {
        let mut state = self.state.write().await;
        state.playback = playback;
        state.rev += 1;
    }

    /// Resize the grid.  Surviving slots keep their snapshot, new slots start
    /// empty.
    pub async fn set_dimensions(&self, rows: u16, columns: u16) {
        let mut state = self.state.write().await;
        state.rows = rows;
        state.columns = columns;
        let capacity = state.capacity();
        state.tiles.truncate(capacity);
        let len = state.tiles.len();
        state.tiles.extend((len..capacity).map(TileSnapshot::empty));
        state.rev += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::HealthState;

    #[tokio::test]
    async fn new_store_has_one_empty_tile_per_slot() {
        let store = GridStateStore::new(2, 3, true);
        let state = store.get_state().await;
        assert_eq!(state.rev, 1);
        assert!(state.muted);
        assert_eq!(state.tiles.len(), 6);
        assert_eq!(state.tiles[5].index, 5);
    }

    #[tokio::test]
    async fn set_tile_reports_previous_alert_and_bumps_rev() {
        let store = GridStateStore::new(1, 2, false);
        let stalled = TileSnapshot {
            health: HealthState::Stalled,
            alert: true,
            ..TileSnapshot::empty(1)
        };
        assert_eq!(store.set_tile(stalled.clone()).await, Some(false));
        assert_eq!(store.set_tile(stalled).await, Some(true));
        assert_eq!(store.set_tile(TileSnapshot::empty(9)).await, None);
        assert_eq!(store.get_state().await.rev, 3);
    }

    #[tokio::test]
    async fn resize_keeps_surviving_slots() {
        let store = GridStateStore::new(2, 2, false);
        store
            .set_tile(TileSnapshot {
                alert: true,
                ..TileSnapshot::empty(0)
            })
            .await;
        store.set_dimensions(1, 1).await;
        let state = store.get_state().await;
        assert_eq!(state.tiles.len(), 1);
        assert!(state.tiles[0].alert);

        store.set_dimensions(2, 3).await;
        let state = store.get_state().await;
        assert_eq!(state.tiles.len(), 6);
        assert_eq!(state.tiles[4], TileSnapshot::empty(4));
    }
}
