//! Transport session abstraction.
//!
//! A tile talks to its adaptive-bitrate player only through
//! [`TransportSession`].  The supervisor never interprets player internals:
//! it issues [`SessionOp`]s and consumes [`SessionEvent`]s, plus two pieces of
//! continuously-readable state (playback readiness and the latest audio
//! spectrum frame).
use std::future::Future;

/// Class of a transport failure, as reported by the player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Network,
    Media,
    Unknown,
}

/// Whether the render target is in a state where its audio output is
/// meaningful.  Silence analysis runs only while `is_active()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaybackReadiness {
    /// Media is loaded and the decoder has data.
    pub loaded: bool,
    pub paused: bool,
    pub seeking: bool,
    /// Stalled waiting on the network cache.
    pub buffering: bool,
}

impl PlaybackReadiness {
    pub fn is_active(&self) -> bool {
        self.loaded && !self.paused && !self.seeking && !self.buffering
    }
}

/// One analysis frame: per-channel byte magnitudes (0..=255) of a fixed
/// number of frequency bins.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SpectrumFrame {
    channels: Vec<Vec<u8>>,
}

impl SpectrumFrame {
    pub fn new(channels: Vec<Vec<u8>>) -> Self {
        Self { channels }
    }

    /// A frame of `bins` identical magnitudes on each of `channels` channels.
    pub fn flat(channels: usize, bins: usize, magnitude: u8) -> Self {
        Self::new(vec![vec![magnitude; bins]; channels])
    }

    #[cfg(test)]
    pub fn channels(&self) -> &[Vec<u8>] {
        &self.channels
    }

    /// Mean magnitude across bins, averaged over channels, normalised to 0..1.
    pub fn loudness(&self) -> f32 {
        if self.channels.is_empty() {
            return 0.0;
        }
        let sum: f32 = self
            .channels
            .iter()
            .map(|bins| {
                let total: u32 = bins.iter().map(|&b| b as u32).sum();
                total as f32 / bins.len().max(1) as f32
            })
            .sum();
        (sum / self.channels.len() as f32) / 255.0
    }
}

/// Unsolicited signals from a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Error {
        kind: TransportErrorKind,
        fatal: bool,
        detail: String,
    },
    /// The render target started (or resumed) producing frames.
    Playing,
}

/// Operations the supervisor issues against a session.  `LoadSource` uses the
/// tile's assigned url.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOp {
    Attach,
    Detach,
    LoadSource,
    StartLoad,
    StopLoad,
    RecoverMediaError,
    Play,
    Pause,
    SetMuted(bool),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("player binary not found")]
    BinaryNotFound,
    #[error("failed to spawn player: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("player IPC endpoint did not appear")]
    IpcUnavailable,
    #[error("player IPC channel closed")]
    Closed,
    #[error("player IPC timeout for req={0}")]
    Timeout(u64),
    #[error("player command failed: {0}")]
    Command(String),
    #[error("session is detached")]
    Detached,
    #[error("failed to encode player command: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Per-tile handle on an adaptive transport plus its render target.
///
/// `next_event` must be cancel-safe: the tile actor polls it inside
/// `tokio::select!`.  A detached session never yields an event.
pub trait TransportSession: Send + 'static {
    fn attach(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;
    fn detach(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;
    fn load_source(&mut self, url: &str)
        -> impl Future<Output = Result<(), TransportError>> + Send;
    fn start_load(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;
    fn stop_load(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;
    fn recover_media_error(&mut self)
        -> impl Future<Output = Result<(), TransportError>> + Send;
    fn play(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;
    fn pause(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;
    fn set_muted(&mut self, muted: bool)
        -> impl Future<Output = Result<(), TransportError>> + Send;
    fn next_event(&mut self) -> impl Future<Output = SessionEvent> + Send;
    fn readiness(&self) -> PlaybackReadiness;
    fn latest_spectrum(&self) -> Option<SpectrumFrame>;
}

/// Dispatch one [`SessionOp`] to the matching session method.
pub async fn apply<S: TransportSession>(
    session: &mut S,
    op: SessionOp,
    url: &str,
) -> Result<(), TransportError> {
    match op {
        SessionOp::Attach => session.attach().await,
        SessionOp::Detach => session.detach().await,
        SessionOp::LoadSource => session.load_source(url).await,
        SessionOp::StartLoad => session.start_load().await,
        SessionOp::StopLoad => session.stop_load().await,
        SessionOp::RecoverMediaError => session.recover_media_error().await,
        SessionOp::Play => session.play().await,
        SessionOp::Pause => session.pause().await,
        SessionOp::SetMuted(muted) => session.set_muted(muted).await,
    }
}
