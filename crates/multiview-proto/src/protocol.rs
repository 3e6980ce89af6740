use serde::{Deserialize, Serialize};

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Clients check this on connect and can refuse to talk to an
/// incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 1;

/// Messages sent from a client to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    /// Flip the global play/pause state and bump the command id.
    TogglePlayback,
    ToggleMute,
    SetMute { muted: bool },
    /// Tear down and immediately re-create one tile's session.
    Reattach { tile: usize },
    AddStream { title: String, url: String },
    UpdateStream { stream: StreamDescriptor },
    RemoveStream { id: String },
    /// Append a batch of streams to the directory.
    ImportStreams { streams: Vec<StreamDescriptor> },
    SetGrid { rows: u16, columns: u16 },
    GetState,
}

/// Messages sent from the daemon to clients (broadcasts)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: daemon version + full state snapshot.
    Hello {
        protocol_version: u32,
        daemon_rev: u64,
        state: GridState,
    },
    State {
        data: GridState,
    },
    /// A tile's alert flag flipped.
    Alert {
        tile: usize,
        active: bool,
        message: Option<String>,
    },
    Log {
        message: String,
    },
    Error {
        message: String,
    },
}

/// One entry of the stream directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StreamDescriptor {
    pub id: String,
    pub title: String,
    pub url: String,
}

/// Transport health of a tile.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum HealthState {
    #[default]
    Healthy,
    /// Debounce window elapsed after a fatal error without playback resuming.
    Stalled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum SilenceState {
    #[default]
    Sounding,
    Silent,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackAction {
    #[default]
    Play,
    Pause,
}

impl PlaybackAction {
    pub fn flipped(self) -> Self {
        match self {
            PlaybackAction::Play => PlaybackAction::Pause,
            PlaybackAction::Pause => PlaybackAction::Play,
        }
    }
}

/// Global play/pause intent.  `id` strictly increases for the lifetime of the
/// daemon; tiles act on a new `id`, never on `action` alone.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PlaybackCommand {
    pub action: PlaybackAction,
    pub id: u64,
}

/// Per-tile view exposed to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TileSnapshot {
    pub index: usize,
    pub stream: Option<StreamDescriptor>,
    pub health: HealthState,
    pub silence: SilenceState,
    pub paused: bool,
    pub recovery_attempts: u32,
    pub alert: bool,
    pub alert_message: Option<String>,
}

impl TileSnapshot {
    pub fn empty(index: usize) -> Self {
        Self {
            index,
            ..Self::default()
        }
    }
}

/// Full state of the daemon.  `rev` is a monotonically increasing counter
/// incremented every time the state changes.  Clients can use it to detect
/// missed updates and request a resync.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GridState {
    #[serde(default)]
    pub rev: u64,
    pub rows: u16,
    pub columns: u16,
    pub muted: bool,
    pub playback: PlaybackCommand,
    pub streams: Vec<StreamDescriptor>,
    pub tiles: Vec<TileSnapshot>,
}

impl GridState {
    pub fn capacity(&self) -> usize {
        self.rows as usize * self.columns as usize
    }

    /// Number of tiles currently raising an alert.
    pub fn alerting(&self) -> usize {
        self.tiles.iter().filter(|t| t.alert).count()
    }
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        if data.len() < 4 {
            anyhow::bail!("Insufficient data for length header");
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            anyhow::bail!("Insufficient data for message");
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok((msg, 4 + len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_encode_decode() {
        let msg = Message::Command(Command::Reattach { tile: 5 });
        let encoded = msg.encode().unwrap();
        let (decoded, len) = Message::decode(&encoded).unwrap();
        assert_eq!(len, encoded.len());
        match decoded {
            Message::Command(Command::Reattach { tile }) => assert_eq!(tile, 5),
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_hello_carries_tile_state() {
        let mut state = GridState {
            rev: 42,
            rows: 1,
            columns: 2,
            ..Default::default()
        };
        state.tiles.push(TileSnapshot {
            health: HealthState::Stalled,
            alert: true,
            alert_message: Some("stream stalled".into()),
            ..TileSnapshot::empty(0)
        });
        let msg = Message::Broadcast(Broadcast::Hello {
            protocol_version: PROTOCOL_VERSION,
            daemon_rev: 42,
            state,
        });
        let encoded = msg.encode().unwrap();
        let (decoded, _) = Message::decode(&encoded).unwrap();
        match decoded {
            Message::Broadcast(Broadcast::Hello {
                protocol_version,
                daemon_rev,
                state,
            }) => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_eq!(daemon_rev, 42);
                assert_eq!(state.alerting(), 1);
                assert_eq!(state.tiles[0].health, HealthState::Stalled);
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_decode_waits_for_full_frame() {
        let encoded = Message::Command(Command::GetState).encode().unwrap();
        assert!(Message::decode(&encoded[..2]).is_err());
        assert!(Message::decode(&encoded[..encoded.len() - 1]).is_err());
    }

    #[test]
    fn test_playback_action_wire_format() {
        let cmd = PlaybackCommand {
            action: PlaybackAction::Pause,
            id: 5,
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert_eq!(json, r#"{"action":"pause","id":5}"#);
        assert_eq!(PlaybackAction::Pause.flipped(), PlaybackAction::Play);
    }
}
