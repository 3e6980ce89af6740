/// mpv IPC driver with separated reader/writer tasks, one mpv process per tile.
///
/// Architecture:
///
/// ```text
///   MpvDriver::spawn_and_connect()
///         │
///         ├── writer_task   ← receives PendingRequest via mpsc, serialises → socket
///         └── reader_task   ← reads JSON lines from socket
///                                ├── response (has request_id) → matched oneshot::Sender
///                                └── event / property-change   → event_tx channel
/// ```
///
/// `MpvSession` wraps a driver + handle and implements `TransportSession`:
/// property observation drives readiness and the "playing" signal, `end-file`
/// errors are classified into transport error kinds, and the lavfi `astats`
/// meter feeds the silence detector.
///
/// Platform notes:
/// - Unix:   Unix domain sockets
/// - Windows: Named pipes  \\.\pipe\<name>
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use multiview_proto::config::Config;
use multiview_proto::protocol::StreamDescriptor;

use crate::alarm::TileAlarm;
use crate::supervisor::grid::TileFactory;
use crate::transport::{
    PlaybackReadiness, SessionEvent, SpectrumFrame, TransportError, TransportErrorKind,
    TransportSession,
};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

// ── global request-id counter ─────────────────────────────────────────────────

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

// ── observation property IDs ──────────────────────────────────────────────────

/// Fixed observe_property IDs.  We match on these in property-change events.
pub const OBS_CORE_IDLE: u64 = 1;
pub const OBS_PAUSE: u64 = 2;
pub const OBS_SEEKING: u64 = 3;
pub const OBS_PAUSED_FOR_CACHE: u64 = 4;
/// Observation ID for `af-metadata/meter` (lavfi astats audio levels).
pub const OBS_AUDIO_LEVEL: u64 = 7;

/// Analyser range used to map RMS dBFS onto a byte magnitude.
const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, TransportError>>>>>;

// ── internal channel types ────────────────────────────────────────────────────

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line (already has '\n')
    reply: oneshot::Sender<Result<Value, TransportError>>,
}

/// An mpv event / property-change that arrived unsolicited (no request_id).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    /// Returns `Some((obs_id, data))` if this is a property-change event.
    pub fn as_property_change(&self) -> Option<(u64, &Value)> {
        if self.raw.get("event")?.as_str()? == "property-change" {
            let id = self.raw.get("id")?.as_u64()?;
            let data = self.raw.get("data").unwrap_or(&Value::Null);
            Some((id, data))
        } else {
            None
        }
    }

    /// Returns the event name, e.g. "end-file", "start-file", "file-loaded".
    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }
}

// ── public handle ─────────────────────────────────────────────────────────────

/// Cloneable handle to the mpv writer task.  Use `send()` to fire a command
/// and await the response.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> Result<Value, TransportError> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg)?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| TransportError::Closed)?;

        tokio::time::timeout(tokio::time::Duration::from_secs(5), reply_rx)
            .await
            .map_err(|_| TransportError::Timeout(req_id))?
            .map_err(|_| TransportError::Closed)?
    }

    async fn set_property(&self, name: &str, value: Value) -> Result<(), TransportError> {
        self.send(json!(["set_property", name, value])).await?;
        Ok(())
    }

    /// Register observe_property for all properties the session tracks.
    /// Must be called after every fresh connection.
    pub async fn observe_all_properties(&self) {
        let props = [
            (OBS_CORE_IDLE, "core-idle"),
            (OBS_PAUSE, "pause"),
            (OBS_SEEKING, "seeking"),
            (OBS_PAUSED_FOR_CACHE, "paused-for-cache"),
            (OBS_AUDIO_LEVEL, "af-metadata/meter"),
        ];
        for (id, name) in &props {
            match self.send(json!(["observe_property", id, name])).await {
                Ok(_) => debug!("mpv: observe_property id={} name={}", id, name),
                Err(e) => warn!("mpv: observe_property {} failed: {}", name, e),
            }
        }
    }

    /// Install the lavfi astats audio filter so mpv exposes per-chunk,
    /// per-channel RMS levels via the `af-metadata/meter` property.
    pub async fn set_audio_filter(&self) {
        let filter = json!([{
            "name": "lavfi",
            "label": "meter",
            "params": { "graph": "astats=metadata=1:reset=1" }
        }]);
        match self.send(json!(["set_property", "af", filter])).await {
            Ok(_) => debug!("mpv: astats audio filter installed"),
            Err(e) => warn!("mpv: failed to set astats filter: {}", e),
        }
    }
}

// ── driver ────────────────────────────────────────────────────────────────────

/// Launch options shared by every tile's mpv process.
#[derive(Debug, Clone, Default)]
pub struct MpvOptions {
    pub video_output: Option<String>,
    pub extra_args: Vec<String>,
}

impl MpvOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            video_output: config.mpv.video_output.clone(),
            extra_args: config.mpv.extra_args.clone(),
        }
    }
}

/// Owns one mpv child process and its IPC connection.
pub struct MpvDriver {
    socket_name: String,
    process: Option<tokio::process::Child>,
}

impl MpvDriver {
    pub fn new(socket_name: String) -> Self {
        Self {
            socket_name,
            process: None,
        }
    }

    /// Kill the process if running.
    pub async fn kill(&mut self) {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
        #[cfg(unix)]
        {
            let _ = tokio::fs::remove_file(&self.socket_name).await;
        }
    }

    fn command(&self, title: &str, options: &MpvOptions) -> Result<tokio::process::Command, TransportError> {
        let mpv_binary =
            multiview_proto::platform::find_mpv_binary().ok_or(TransportError::BinaryNotFound)?;
        let mut cmd = tokio::process::Command::new(mpv_binary);
        cmd.arg("--idle=yes")
            .arg("--force-window=yes")
            .arg("--keep-open=no")
            .arg("--quiet")
            .arg(format!("--title={}", title))
            .arg(multiview_proto::platform::mpv_socket_arg(&self.socket_name));
        if let Some(vo) = &options.video_output {
            cmd.arg(format!("--vo={}", vo));
        }
        cmd.args(&options.extra_args)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);
        Ok(cmd)
    }

    #[cfg(unix)]
    pub async fn spawn_and_connect(
        &mut self,
        title: &str,
        options: &MpvOptions,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> Result<MpvHandle, TransportError> {
        self.kill().await;

        let socket_path = PathBuf::from(&self.socket_name);
        info!("mpv: spawning process for '{}'", title);
        let child = self.command(title, options)?.spawn()?;
        self.process = Some(child);

        // Wait for socket to appear
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if socket_path.exists() {
                break;
            }
        }
        if !socket_path.exists() {
            self.kill().await;
            return Err(TransportError::IpcUnavailable);
        }

        let stream = match connect_ipc(&socket_path).await {
            Ok(stream) => stream,
            Err(e) => {
                self.kill().await;
                return Err(e);
            }
        };
        debug!("mpv: connected to {}", self.socket_name);
        let (read_half, write_half) = stream.into_split();
        Ok(start_io_tasks(BufReader::new(read_half), write_half, event_tx))
    }

    #[cfg(windows)]
    pub async fn spawn_and_connect(
        &mut self,
        title: &str,
        options: &MpvOptions,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> Result<MpvHandle, TransportError> {
        self.kill().await;

        info!("mpv: spawning process for '{}'", title);
        let child = self.command(title, options)?.spawn()?;
        self.process = Some(child);

        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if let Ok(client) = ClientOptions::new().open(&pipe_path) {
                debug!("mpv: connected to {}", pipe_path);
                let (read_half, write_half) = tokio::io::split(client);
                return Ok(start_io_tasks(BufReader::new(read_half), write_half, event_tx));
            }
        }
        self.kill().await;
        Err(TransportError::IpcUnavailable)
    }
}

#[cfg(unix)]
async fn connect_ipc(path: &std::path::Path) -> Result<UnixStream, TransportError> {
    UnixStream::connect(path).await.map_err(|e| {
        warn!("mpv: connect to {} failed: {}", path.display(), e);
        TransportError::IpcUnavailable
    })
}

fn start_io_tasks<R, W>(
    reader: BufReader<R>,
    writer: W,
    event_tx: mpsc::Sender<MpvEvent>,
) -> MpvHandle
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    // pending map: req_id → reply channel.  Shared between writer (inserts) and reader (resolves).
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

    tokio::spawn(writer_task(writer, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(reader, pending, event_tx));

    MpvHandle { tx: cmd_tx }
}

// ── reader task ───────────────────────────────────────────────────────────────

async fn reader_task<R>(mut reader: BufReader<R>, pending: PendingMap, event_tx: mpsc::Sender<MpvEvent>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                fail_pending(&pending).await;
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                if let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) {
                    let mut map = pending.lock().await;
                    if let Some(tx) = map.remove(&req_id) {
                        let result = if val["error"].as_str() == Some("success") {
                            Ok(val)
                        } else {
                            let err = val["error"].as_str().unwrap_or("unknown error").to_string();
                            debug!("mpv reader: response req={} err={}", req_id, err);
                            Err(TransportError::Command(err))
                        };
                        let _ = tx.send(result);
                    }
                } else if event_tx.send(MpvEvent { raw: val }).await.is_err() {
                    // Session dropped its receiver; nobody is listening any more.
                    fail_pending(&pending).await;
                    break;
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                fail_pending(&pending).await;
                break;
            }
        }
    }
}

async fn fail_pending(pending: &PendingMap) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(TransportError::Closed));
    }
}

// ── writer task ───────────────────────────────────────────────────────────────

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register reply channel before writing so reader can match it
        pending.lock().await.insert(req.req_id, req.reply);
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(TransportError::Closed));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

// ── event classification ──────────────────────────────────────────────────────

/// Map mpv's `end-file` `file_error` text onto a transport error class.
pub fn classify_file_error(file_error: &str) -> TransportErrorKind {
    let e = file_error.to_ascii_lowercase();
    const NETWORK: &[&str] = &["network", "http", "tcp", "timed out", "timeout", "connection", "loading failed"];
    const MEDIA: &[&str] = &["format", "demux", "decod", "codec", "no audio or video"];
    if NETWORK.iter().any(|k| e.contains(k)) {
        TransportErrorKind::Network
    } else if MEDIA.iter().any(|k| e.contains(k)) {
        TransportErrorKind::Media
    } else {
        TransportErrorKind::Unknown
    }
}

/// Convert an astats RMS level (dBFS) to an analyser byte magnitude.
pub fn db_to_magnitude(db: f32) -> u8 {
    if db.is_nan() {
        return 0;
    }
    let scaled = (db - MIN_DECIBELS) / (MAX_DECIBELS - MIN_DECIBELS) * 255.0;
    scaled.clamp(0.0, 255.0).round() as u8
}

/// Build a spectrum frame from an `af-metadata/meter` object: one bin per
/// channel from `lavfi.astats.<n>.RMS_level`, falling back to the overall level.
pub fn spectrum_from_astats(data: &Value) -> Option<SpectrumFrame> {
    let obj = data.as_object()?;
    let level = |key: &str| {
        obj.get(key)
            .and_then(|v| v.as_str())
            .and_then(|s| s.trim().parse::<f32>().ok())
    };
    let mut channels = Vec::new();
    for ch in 1..=8 {
        match level(&format!("lavfi.astats.{}.RMS_level", ch)) {
            Some(db) => channels.push(vec![db_to_magnitude(db)]),
            None => break,
        }
    }
    if channels.is_empty() {
        let overall = level("lavfi.astats.Overall.RMS_level")?;
        channels.push(vec![db_to_magnitude(overall)]);
    }
    Some(SpectrumFrame::new(channels))
}

// ── session ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Observed {
    core_idle: Option<bool>,
    pause: bool,
    seeking: bool,
    paused_for_cache: bool,
    loaded: bool,
}

impl Observed {
    fn playing(&self) -> bool {
        self.core_idle == Some(false) && !self.pause
    }
}

/// One tile's mpv process as a [`TransportSession`].
pub struct MpvSession {
    title: String,
    options: MpvOptions,
    driver: MpvDriver,
    handle: Option<MpvHandle>,
    events: Option<mpsc::Receiver<MpvEvent>>,
    obs: Observed,
    spectrum: Option<SpectrumFrame>,
    url: Option<String>,
}

impl MpvSession {
    pub fn new(socket_name: String, title: String, options: MpvOptions) -> Self {
        Self {
            title,
            options,
            driver: MpvDriver::new(socket_name),
            handle: None,
            events: None,
            obs: Observed::default(),
            spectrum: None,
            url: None,
        }
    }

    fn handle(&self) -> Result<&MpvHandle, TransportError> {
        self.handle.as_ref().ok_or(TransportError::Detached)
    }

    async fn load_url(&mut self, url: &str) -> Result<(), TransportError> {
        self.handle()?.send(json!(["loadfile", url, "replace"])).await?;
        Ok(())
    }

    /// Fold one raw mpv event into observed state; returns a session event
    /// when the supervisor needs to hear about it.
    fn absorb(&mut self, evt: MpvEvent) -> Option<SessionEvent> {
        let was_playing = self.obs.playing();

        if let Some((obs_id, data)) = evt.as_property_change() {
            match obs_id {
                OBS_CORE_IDLE => self.obs.core_idle = data.as_bool(),
                OBS_PAUSE => self.obs.pause = data.as_bool().unwrap_or(false),
                OBS_SEEKING => self.obs.seeking = data.as_bool().unwrap_or(false),
                OBS_PAUSED_FOR_CACHE => {
                    let buffering = data.as_bool().unwrap_or(false);
                    let started = buffering && !self.obs.paused_for_cache;
                    self.obs.paused_for_cache = buffering;
                    if started {
                        return Some(SessionEvent::Error {
                            kind: TransportErrorKind::Network,
                            fatal: false,
                            detail: "paused for cache".to_string(),
                        });
                    }
                }
                OBS_AUDIO_LEVEL => {
                    if let Some(frame) = spectrum_from_astats(data) {
                        self.spectrum = Some(frame);
                    }
                }
                _ => {}
            }
        } else {
            match evt.event_name() {
                Some("start-file") => self.obs.loaded = false,
                Some("file-loaded") => self.obs.loaded = true,
                Some("end-file") => {
                    self.obs.loaded = false;
                    self.spectrum = None;
                    let reason = evt.raw.get("reason").and_then(|v| v.as_str()).unwrap_or("unknown");
                    let file_error = evt.raw.get("file_error").and_then(|v| v.as_str()).unwrap_or("");
                    debug!("mpv: end-file reason={} file_error={:?}", reason, file_error);
                    match reason {
                        "error" => {
                            return Some(SessionEvent::Error {
                                kind: classify_file_error(file_error),
                                fatal: true,
                                detail: file_error.to_string(),
                            })
                        }
                        // A live stream never reaches EOF on its own.
                        "eof" => {
                            return Some(SessionEvent::Error {
                                kind: TransportErrorKind::Network,
                                fatal: true,
                                detail: "stream ended".to_string(),
                            })
                        }
                        _ => {}
                    }
                }
                _ => {}
            }
        }

        if self.obs.playing() && !was_playing {
            Some(SessionEvent::Playing)
        } else {
            None
        }
    }

    fn drop_connection(&mut self) {
        self.handle = None;
        self.events = None;
        self.obs = Observed::default();
        self.spectrum = None;
    }
}

impl TransportSession for MpvSession {
    async fn attach(&mut self) -> Result<(), TransportError> {
        let (event_tx, event_rx) = mpsc::channel::<MpvEvent>(256);
        self.drop_connection();
        let handle = self
            .driver
            .spawn_and_connect(&self.title, &self.options, event_tx)
            .await?;
        handle.observe_all_properties().await;
        handle.set_audio_filter().await;
        self.handle = Some(handle);
        self.events = Some(event_rx);
        Ok(())
    }

    async fn detach(&mut self) -> Result<(), TransportError> {
        self.drop_connection();
        self.driver.kill().await;
        Ok(())
    }

    async fn load_source(&mut self, url: &str) -> Result<(), TransportError> {
        self.url = Some(url.to_string());
        self.load_url(url).await
    }

    async fn start_load(&mut self) -> Result<(), TransportError> {
        if self.obs.loaded {
            debug!("mpv: '{}' already loading", self.title);
            return Ok(());
        }
        let url = self.url.clone().ok_or(TransportError::Command("no source loaded".into()))?;
        self.load_url(&url).await
    }

    async fn stop_load(&mut self) -> Result<(), TransportError> {
        self.handle()?.send(json!(["stop"])).await?;
        Ok(())
    }

    async fn recover_media_error(&mut self) -> Result<(), TransportError> {
        let handle = self.handle()?.clone();
        // Fall back to software decoding, then flush the decoders with a no-op seek.
        if let Err(e) = handle.set_property("hwdec", json!("no")).await {
            debug!("mpv: '{}' hwdec fallback failed: {}", self.title, e);
        }
        handle.send(json!(["seek", 0, "relative+exact"])).await?;
        Ok(())
    }

    async fn play(&mut self) -> Result<(), TransportError> {
        self.handle()?.set_property("pause", json!(false)).await
    }

    async fn pause(&mut self) -> Result<(), TransportError> {
        self.handle()?.set_property("pause", json!(true)).await
    }

    async fn set_muted(&mut self, muted: bool) -> Result<(), TransportError> {
        self.handle()?.set_property("mute", json!(muted)).await
    }

    async fn next_event(&mut self) -> SessionEvent {
        loop {
            let Some(rx) = self.events.as_mut() else {
                return std::future::pending().await;
            };
            match rx.recv().await {
                Some(evt) => {
                    if let Some(out) = self.absorb(evt) {
                        return out;
                    }
                }
                None => {
                    warn!("mpv: '{}' IPC connection lost", self.title);
                    self.drop_connection();
                    return SessionEvent::Error {
                        kind: TransportErrorKind::Unknown,
                        fatal: true,
                        detail: "player connection closed".to_string(),
                    };
                }
            }
        }
    }

    fn readiness(&self) -> PlaybackReadiness {
        PlaybackReadiness {
            loaded: self.obs.loaded && self.obs.core_idle == Some(false),
            paused: self.obs.pause,
            seeking: self.obs.seeking,
            buffering: self.obs.paused_for_cache,
        }
    }

    fn latest_spectrum(&self) -> Option<SpectrumFrame> {
        self.spectrum.clone()
    }
}

/// Builds mpv sessions and alarms for the grid supervisor.
pub struct MpvTileFactory {
    options: MpvOptions,
    alarm_sound: Option<PathBuf>,
}

impl MpvTileFactory {
    pub fn from_config(config: &Config) -> Self {
        Self {
            options: MpvOptions::from_config(config),
            alarm_sound: config.alarm.sound_file.clone(),
        }
    }
}

impl TileFactory for MpvTileFactory {
    type Session = MpvSession;
    type Alarm = TileAlarm;

    fn session(&self, index: usize, generation: u64, stream: &StreamDescriptor) -> MpvSession {
        MpvSession::new(
            multiview_proto::platform::mpv_socket_name(index, generation),
            format!("[{}] {}", index + 1, stream.title),
            self.options.clone(),
        )
    }

    fn alarm(&self, index: usize) -> TileAlarm {
        TileAlarm::for_tile(index, self.alarm_sound.clone())
    }
}
