//! Per-tile health-and-recovery supervision.
//!
//! ```text
//!   GridSupervisor ── spawns ──► run_tile (one task per tile)
//!        │                          │
//!        ├─ PlaybackBus (watch) ───►│ PlaybackFollower
//!        ├─ MuteFlag    (watch) ───►│
//!        │                          ├── TileMachine (pure transition table)
//!        │                          │     ├── StallDebouncer
//!        │                          │     ├── RecoveryScheduler
//!        │                          │     ├── SilenceDetector
//!        │                          │     └── AlertAggregator
//!        │                          ├── TransportSession
//!        │                          └── Alarm
//!        ◄──────── TileReport ──────┘
//! ```
pub mod actor;
pub mod alert;
pub mod command_bus;
pub mod debounce;
pub mod grid;
pub mod recovery;
pub mod silence;
pub mod stagger;
pub mod tile;

use multiview_proto::config::Config;
use std::time::Duration;

/// Timing knobs handed to every tile.
#[derive(Debug, Clone)]
pub struct TileTimings {
    pub debounce: Duration,
    pub recovery_interval: Duration,
    pub hard_reload_every: u32,
    pub silence_threshold: f32,
    pub silence_duration: Duration,
    pub frame_interval: Duration,
}

impl TileTimings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            debounce: config.supervisor.debounce(),
            recovery_interval: config.supervisor.recovery_interval(),
            hard_reload_every: config.supervisor.hard_reload_every,
            silence_threshold: config.silence.threshold,
            silence_duration: config.silence.duration(),
            frame_interval: config.silence.frame_interval(),
        }
    }
}

impl Default for TileTimings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}
