//! Audio sink abstraction and the process-spawning implementation.
//!
//! The synchronizer only ever talks to [`AudioSink`]; the actual rendering is
//! done by an external player process (`mpv` by default).

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::ErrorCode;
use crate::room::PlaybackIntent;

/// How long `stop` waits for a killed player to be reaped.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from starting playback.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The player program could not be launched.
    #[error("failed to launch '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The sink refused the request.
    #[error("sink rejected playback: {0}")]
    Rejected(String),
}

impl ErrorCode for SinkError {
    fn code(&self) -> &'static str {
        match self {
            Self::Spawn { .. } => "sink_spawn_failed",
            Self::Rejected(_) => "sink_rejected",
        }
    }
}

pub type SinkResult<T> = Result<T, SinkError>;

/// How a started playback ended on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkExit {
    Finished,
    Failed(String),
}

/// What to play and from where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackRequest {
    pub media_locator: String,
    pub seek_offset: Duration,
    /// Output device passed through to the player, if any.
    pub device: Option<String>,
}

impl PlaybackRequest {
    pub fn new(intent: PlaybackIntent, device: Option<String>) -> Self {
        Self {
            media_locator: intent.media_locator,
            seek_offset: intent.seek_offset,
            device,
        }
    }
}

/// A started playback.
///
/// `ended` resolves once if the playback ends without a `stop`. Handles must
/// be given back to [`AudioSink::stop`], including ones that already ended.
#[derive(Debug)]
pub struct SinkHandle {
    pub id: u64,
    pub ended: oneshot::Receiver<SinkExit>,
}

impl SinkHandle {
    pub fn new(id: u64, ended: oneshot::Receiver<SinkExit>) -> Self {
        Self { id, ended }
    }
}

/// Something that can render a media locator to audio.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Starts rendering `request`. Returns once the sink accepted it.
    async fn start(&self, request: &PlaybackRequest) -> SinkResult<SinkHandle>;

    /// Stops the playback behind `handle` and releases its resources.
    ///
    /// Returns after the playback is gone. Stopping an already ended
    /// playback is a no-op apart from releasing it.
    async fn stop(&self, handle: SinkHandle);
}

// ─────────────────────────────────────────────────────────────────────────────
// Process sink
// ─────────────────────────────────────────────────────────────────────────────

/// Command line template for the player process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkCommand {
    pub program: String,
    /// Arguments placed before the seek/device arguments.
    pub args: Vec<String>,
    /// Seek argument; `{seconds}` is replaced with the whole-second offset.
    /// Left out when the offset is zero.
    pub seek_arg: Option<String>,
    /// Device argument; `{device}` is replaced with the device name.
    pub device_arg: Option<String>,
}

impl Default for SinkCommand {
    fn default() -> Self {
        Self {
            program: "mpv".to_string(),
            args: vec!["--no-video".to_string(), "--really-quiet".to_string()],
            seek_arg: Some("--start={seconds}".to_string()),
            device_arg: Some("--audio-device={device}".to_string()),
        }
    }
}

impl SinkCommand {
    /// Full argument list for `request`; the locator is always last.
    #[must_use]
    pub fn build_args(&self, request: &PlaybackRequest) -> Vec<String> {
        let mut args = self.args.clone();

        let seconds = request.seek_offset.as_secs();
        if let (Some(template), true) = (&self.seek_arg, seconds > 0) {
            args.push(template.replace("{seconds}", &seconds.to_string()));
        }
        if let (Some(template), Some(device)) = (&self.device_arg, &request.device) {
            args.push(template.replace("{device}", device));
        }

        args.push(request.media_locator.clone());
        args
    }
}

struct RunningPlayer {
    kill: oneshot::Sender<()>,
    waiter: JoinHandle<()>,
}

/// Plays audio by spawning one player process per track.
pub struct ProcessSink {
    command: SinkCommand,
    next_id: AtomicU64,
    running: Mutex<HashMap<u64, RunningPlayer>>,
}

impl ProcessSink {
    pub fn new(command: SinkCommand) -> Self {
        Self {
            command,
            next_id: AtomicU64::new(1),
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Number of players started and not yet stopped.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.running.lock().len()
    }
}

impl Default for ProcessSink {
    fn default() -> Self {
        Self::new(SinkCommand::default())
    }
}

#[async_trait]
impl AudioSink for ProcessSink {
    async fn start(&self, request: &PlaybackRequest) -> SinkResult<SinkHandle> {
        let args = self.command.build_args(request);
        log::debug!("[Sink] Launching {} {:?}", self.command.program, args);

        let mut child = Command::new(&self.command.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SinkError::Spawn {
                program: self.command.program.clone(),
                source,
            })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (ended_tx, ended_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        let waiter = tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let exit = match status {
                        Ok(status) if status.success() => SinkExit::Finished,
                        Ok(status) => SinkExit::Failed(format!("player exited with {status}")),
                        Err(e) => SinkExit::Failed(format!("failed to wait for player: {e}")),
                    };
                    let _ = ended_tx.send(exit);
                }
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        log::warn!("[Sink] Failed to kill player {}: {}", id, e);
                    }
                }
            }
        });

        self.running.lock().insert(id, RunningPlayer { kill: kill_tx, waiter });
        Ok(SinkHandle::new(id, ended_rx))
    }

    async fn stop(&self, handle: SinkHandle) {
        let Some(player) = self.running.lock().remove(&handle.id) else {
            return;
        };
        // Err when the process already exited.
        let _ = player.kill.send(());
        if tokio::time::timeout(STOP_TIMEOUT, player.waiter).await.is_err() {
            log::warn!("[Sink] Player {} did not exit within {:?}", handle.id, STOP_TIMEOUT);
        }
    }
}
