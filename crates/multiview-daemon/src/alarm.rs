//! Per-tile audible alarm.
//!
//! The supervisor owns one alarm per tile and starts/stops it on alert edges.
//! With a configured sound file the alarm loops it through a dedicated
//! headless mpv process; without one it only logs.
use std::path::PathBuf;
use tracing::{info, warn};

pub trait Alarm: Send + 'static {
    /// Start (or keep) sounding.  Idempotent.
    fn start(&mut self, message: &str);
    /// Silence the alarm.  Idempotent.
    fn stop(&mut self);
    fn is_running(&self) -> bool;
}

/// Loops a sound file through `mpv --no-video --loop=inf`.
pub struct SoundAlarm {
    tile: usize,
    sound_file: PathBuf,
    child: Option<tokio::process::Child>,
}

impl SoundAlarm {
    pub fn new(tile: usize, sound_file: PathBuf) -> Self {
        Self {
            tile,
            sound_file,
            child: None,
        }
    }

    fn spawn(&self) -> std::io::Result<tokio::process::Child> {
        let mpv = multiview_proto::platform::find_mpv_binary().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "mpv binary not found")
        })?;
        tokio::process::Command::new(mpv)
            .arg("--no-video")
            .arg("--loop=inf")
            .arg("--really-quiet")
            .arg(&self.sound_file)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
    }
}

impl Alarm for SoundAlarm {
    fn start(&mut self, message: &str) {
        if self.child.is_some() {
            return;
        }
        warn!("alarm: tile {} alerting ({})", self.tile, message);
        match self.spawn() {
            Ok(child) => self.child = Some(child),
            Err(e) => warn!("alarm: tile {} failed to play {:?}: {}", self.tile, self.sound_file, e),
        }
    }

    fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            info!("alarm: tile {} cleared", self.tile);
            let _ = child.start_kill();
        }
    }

    fn is_running(&self) -> bool {
        self.child.is_some()
    }
}

/// Alarm that only writes to the log.
pub struct LogAlarm {
    tile: usize,
    running: bool,
}

impl LogAlarm {
    pub fn new(tile: usize) -> Self {
        Self { tile, running: false }
    }
}

impl Alarm for LogAlarm {
    fn start(&mut self, message: &str) {
        if !self.running {
            warn!("alarm: tile {} alerting ({})", self.tile, message);
            self.running = true;
        }
    }

    fn stop(&mut self) {
        if self.running {
            info!("alarm: tile {} cleared", self.tile);
            self.running = false;
        }
    }

    fn is_running(&self) -> bool {
        self.running
    }
}

/// The alarm kind chosen from configuration.
pub enum TileAlarm {
    Sound(SoundAlarm),
    Log(LogAlarm),
}

impl TileAlarm {
    pub fn for_tile(tile: usize, sound_file: Option<PathBuf>) -> Self {
        match sound_file {
            Some(path) => TileAlarm::Sound(SoundAlarm::new(tile, path)),
            None => TileAlarm::Log(LogAlarm::new(tile)),
        }
    }
}

impl Alarm for TileAlarm {
    fn start(&mut self, message: &str) {
        match self {
            TileAlarm::Sound(a) => a.start(message),
            TileAlarm::Log(a) => a.start(message),
        }
    }

    fn stop(&mut self) {
        match self {
            TileAlarm::Sound(a) => a.stop(),
            TileAlarm::Log(a) => a.stop(),
        }
    }

    fn is_running(&self) -> bool {
        match self {
            TileAlarm::Sound(a) => a.is_running(),
            TileAlarm::Log(a) => a.is_running(),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_alarm_is_idempotent() {
        let mut alarm = TileAlarm::for_tile(3, None);
        assert!(!alarm.is_running());
        alarm.start("stream stalled");
        alarm.start("stream stalled");
        assert!(alarm.is_running());
        alarm.stop();
        alarm.stop();
        assert!(!alarm.is_running());
    }

    #[tokio::test]
    async fn missing_sound_player_leaves_alarm_idle() {
        let mut alarm = SoundAlarm::new(0, PathBuf::from("/nonexistent/alarm.wav"));
        // Either spawn fails and the alarm never runs, or stop() reaps the child.
        alarm.start("audio silent");
        alarm.stop();
        assert!(!alarm.is_running());
    }
}
