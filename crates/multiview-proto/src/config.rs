use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::platform;
use crate::protocol::StreamDescriptor;

/// Largest accepted grid dimension (rows or columns).
pub const MAX_GRID_DIMENSION: u16 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub grid: GridConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub silence: SilenceConfig,
    #[serde(default)]
    pub stagger: StaggerConfig,
    #[serde(default)]
    pub mpv: MpvConfig,
    #[serde(default)]
    pub alarm: AlarmConfig,
    /// Streams seeding the directory at startup.
    #[serde(default)]
    pub streams: Vec<StreamDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default = "default_columns")]
    pub columns: u16,
    /// Global mute at startup.
    #[serde(default = "default_muted")]
    pub muted: bool,
}

/// Timing of the stall debounce and the recovery loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// How long a fatal error may go unanswered by playback before the tile
    /// is declared stalled.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_recovery_interval_ms")]
    pub recovery_interval_ms: u64,
    /// Every Nth recovery attempt performs a full detach/reattach.
    #[serde(default = "default_hard_reload_every")]
    pub hard_reload_every: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SilenceConfig {
    /// Normalised loudness (0..1) below which a sample counts as silent.
    #[serde(default = "default_silence_threshold")]
    pub threshold: f32,
    #[serde(default = "default_silence_duration_ms")]
    pub duration_ms: u64,
    /// Minimum spacing between analysed samples (~30 Hz).
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaggerConfig {
    #[serde(default = "default_spacing_ms")]
    pub spacing_ms: u64,
    /// Upper bound (exclusive) of the random per-session seed.
    #[serde(default = "default_max_seed_ms")]
    pub max_seed_ms: u64,
    /// Fixed seed; when unset a random one is drawn at startup.
    #[serde(default)]
    pub seed_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MpvConfig {
    /// Passed as `--vo=<value>` when set.
    #[serde(default)]
    pub video_output: Option<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AlarmConfig {
    /// Sound looped while a tile is alerting.  Log-only alarm when unset.
    #[serde(default)]
    pub sound_file: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_file: default_log_file(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            rows: default_rows(),
            columns: default_columns(),
            muted: default_muted(),
        }
    }
}

impl GridConfig {
    /// Dimensions clamped to `1..=MAX_GRID_DIMENSION`.
    pub fn clamped(&self) -> (u16, u16) {
        (
            self.rows.clamp(1, MAX_GRID_DIMENSION),
            self.columns.clamp(1, MAX_GRID_DIMENSION),
        )
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            recovery_interval_ms: default_recovery_interval_ms(),
            hard_reload_every: default_hard_reload_every(),
        }
    }
}

impl SupervisorConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_interval_ms.max(1))
    }
}

impl Default for SilenceConfig {
    fn default() -> Self {
        Self {
            threshold: default_silence_threshold(),
            duration_ms: default_silence_duration_ms(),
            frame_interval_ms: default_frame_interval_ms(),
        }
    }
}

impl SilenceConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms.max(1))
    }
}

impl Default for StaggerConfig {
    fn default() -> Self {
        Self {
            spacing_ms: default_spacing_ms(),
            max_seed_ms: default_max_seed_ms(),
            seed_ms: None,
        }
    }
}

fn default_log_file() -> PathBuf {
    platform::data_dir().join("multiviewd.log")
}

fn default_http_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8990
}

fn default_rows() -> u16 {
    6
}

fn default_columns() -> u16 {
    7
}

fn default_muted() -> bool {
    true
}

fn default_debounce_ms() -> u64 {
    10_000
}

fn default_recovery_interval_ms() -> u64 {
    5_000
}

fn default_hard_reload_every() -> u32 {
    3
}

fn default_silence_threshold() -> f32 {
    0.01
}

fn default_silence_duration_ms() -> u64 {
    10_000
}

fn default_frame_interval_ms() -> u64 {
    33
}

fn default_spacing_ms() -> u64 {
    300
}

fn default_max_seed_ms() -> u64 {
    1_000
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            http: HttpConfig::default(),
            grid: GridConfig::default(),
            supervisor: SupervisorConfig::default(),
            silence: SilenceConfig::default(),
            stagger: StaggerConfig::default(),
            mpv: MpvConfig::default(),
            alarm: AlarmConfig::default(),
            streams: Vec::new(),
        }
    }
}
