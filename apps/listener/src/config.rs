//! Listener configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use djroom_core::{ConnectionConfig, RetryPolicy, SessionConfig, SinkCommand, SyncPolicy};
use serde::Deserialize;

/// Reconnect settings as written in the config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt; `0` disables reconnecting.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            initial_delay_ms: policy.initial_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            multiplier: policy.multiplier,
        }
    }
}

/// Client configuration loaded from YAML with environment overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server port.
    /// Override: `DJROOM_PORT`
    pub port: u16,

    /// Seconds allowed for the TCP + WebSocket connect.
    pub connect_timeout_secs: u64,

    /// Seconds allowed for the room join handshake.
    pub handshake_timeout_secs: u64,

    pub retry: RetryConfig,

    /// Offsets below this start from the beginning of the track.
    pub sync_tolerance_ms: u64,

    /// How often a failed playback is re-issued.
    pub sink_retries: u32,

    /// Disable audio and only log what would be played.
    pub no_audio: bool,

    /// Audio output device handed to the player.
    /// Override: `DJROOM_AUDIO_DEVICE`
    pub audio_device: Option<String>,

    /// Player command line templates.
    /// Override for the program: `DJROOM_PLAYER`
    pub player: SinkCommand,

    /// Buffered diffs per subscriber.
    pub diff_channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let sync = SyncPolicy::default();
        Self {
            port: 80,
            connect_timeout_secs: 10,
            handshake_timeout_secs: 10,
            retry: RetryConfig::default(),
            sync_tolerance_ms: sync.tolerance.as_millis() as u64,
            sink_retries: sync.max_sink_retries,
            no_audio: false,
            audio_device: None,
            player: SinkCommand::default(),
            diff_channel_capacity: 64,
        }
    }
}

impl ClientConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup("DJROOM_PORT") {
            match val.parse() {
                Ok(port) => self.port = port,
                Err(_) => log::warn!("Ignoring invalid DJROOM_PORT '{}'", val),
            }
        }

        if let Some(val) = lookup("DJROOM_AUDIO_DEVICE") {
            if !val.is_empty() {
                self.audio_device = Some(val);
            }
        }

        if let Some(val) = lookup("DJROOM_PLAYER") {
            if !val.is_empty() {
                self.player.program = val;
            }
        }
    }

    /// Converts to djroom-core's session configuration.
    pub fn to_core_config(&self, host: &str, room: &str) -> SessionConfig {
        let mut connection = ConnectionConfig::new(host, self.port, room);
        connection.connect_timeout = Duration::from_secs(self.connect_timeout_secs);
        connection.handshake_timeout = Duration::from_secs(self.handshake_timeout_secs);

        SessionConfig {
            connection,
            retry: RetryPolicy {
                max_attempts: self.retry.max_attempts,
                initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
                max_delay: Duration::from_millis(self.retry.max_delay_ms),
                multiplier: self.retry.multiplier,
            },
            sync: SyncPolicy {
                audio_enabled: !self.no_audio,
                tolerance: Duration::from_millis(self.sync_tolerance_ms),
                max_sink_retries: self.sink_retries,
                device: self.audio_device.clone(),
            },
            diff_channel_capacity: self.diff_channel_capacity,
        }
    }
}
