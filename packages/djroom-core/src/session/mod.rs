//! Session orchestration.
//!
//! A session joins one room and stays there: each connection attempt gets a
//! fresh [`RoomStateStore`], a playback synchronizer task and a notification
//! task. When the connection ends for a retryable reason the orchestrator
//! backs off and rejoins the same room.

mod backoff;
mod notifications;

pub use backoff::{Backoff, RetryPolicy};
pub use notifications::{
    describe_connection, describe_playback, LogNotifier, NoticeLevel, Notifier, NotifyingEmitter,
    RoomNotices,
};

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::connection::{ConnectionConfig, DisconnectReason, RoomConnection};
use crate::error::ErrorCode;
use crate::events::{ConnectionEvent, EventEmitter};
use crate::playback::{AudioSink, PlaybackSynchronizer, SyncPolicy};
use crate::room::RoomStateStore;

/// Errors that end a session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// The configuration cannot work.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Every allowed attempt failed.
    #[error("gave up after {attempts} attempts, last error: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

impl ErrorCode for SessionError {
    fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig(_) => "invalid_config",
            Self::RetriesExhausted { .. } => "retries_exhausted",
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Everything a session needs to know.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connection: ConnectionConfig,
    pub retry: RetryPolicy,
    pub sync: SyncPolicy,
    /// Per-subscriber diff buffer.
    pub diff_channel_capacity: usize,
}

impl SessionConfig {
    pub fn new(connection: ConnectionConfig) -> Self {
        Self {
            connection,
            retry: RetryPolicy::default(),
            sync: SyncPolicy::default(),
            diff_channel_capacity: 64,
        }
    }

    /// Checks for values that would make the session misbehave.
    pub fn validate(&self) -> SessionResult<()> {
        let invalid = |msg: &str| Err(SessionError::InvalidConfig(msg.to_string()));

        if self.connection.host.trim().is_empty() {
            return invalid("host must not be empty");
        }
        if self.connection.room.trim().is_empty() {
            return invalid("room must not be empty");
        }
        if self.connection.port == 0 {
            return invalid("port must not be 0");
        }
        if self.connection.connect_timeout.is_zero() || self.connection.handshake_timeout.is_zero() {
            return invalid("timeouts must be greater than zero");
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return invalid("retry multiplier must be a finite number >= 1");
        }
        if self.retry.initial_delay > self.retry.max_delay {
            return invalid("retry initial delay must not exceed the max delay");
        }
        if self.diff_channel_capacity == 0 {
            return invalid("diff channel capacity must be at least 1");
        }
        Ok(())
    }
}

/// Runs one listening session until it is over for good.
pub struct SessionOrchestrator {
    config: SessionConfig,
    sink: Arc<dyn AudioSink>,
    notifier: Arc<dyn Notifier>,
    emitter: Arc<dyn EventEmitter>,
}

impl SessionOrchestrator {
    pub fn new(config: SessionConfig, sink: Arc<dyn AudioSink>, notifier: Arc<dyn Notifier>) -> Self {
        let emitter = Arc::new(NotifyingEmitter::new(notifier.clone()));
        Self {
            config,
            sink,
            notifier,
            emitter,
        }
    }

    /// Connects, plays along and reconnects until a non-retryable
    /// disconnect, cancellation or retry exhaustion.
    ///
    /// Cancelling `cancel` leaves the room gracefully and returns
    /// `Ok(DisconnectReason::Requested)`.
    pub async fn run(&self, cancel: CancellationToken) -> SessionResult<DisconnectReason> {
        self.config.validate()?;

        let url = self.config.connection.url();
        let mut backoff = self.config.retry.backoff();
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Ok(DisconnectReason::Requested);
            }
            attempt += 1;
            self.emitter.emit_connection(ConnectionEvent::Connecting {
                url: url.clone(),
                attempt,
            });

            let connected = tokio::select! {
                _ = cancel.cancelled() => return Ok(DisconnectReason::Requested),
                result = RoomConnection::connect(
                    &self.config.connection,
                    self.emitter.clone(),
                    cancel.child_token(),
                ) => result,
            };

            let last_error = match connected {
                Ok(connection) => {
                    backoff.reset();
                    let reason = self.run_attempt(connection).await;
                    if !reason.is_retryable() {
                        log::info!("[Session] Session ended: {}", reason);
                        return Ok(reason);
                    }
                    reason.to_string()
                }
                Err(e) => {
                    log::warn!(
                        "[Session] Attempt {} failed ({}): {}",
                        attempt,
                        e.code(),
                        e
                    );
                    self.emitter.emit_connection(ConnectionEvent::AttemptFailed {
                        attempt,
                        code: e.code(),
                        error: e.to_string(),
                    });
                    e.to_string()
                }
            };

            let Some(delay) = backoff.next_delay() else {
                let attempts = backoff.retries() + 1;
                log::error!(
                    "[Session] Giving up after {} attempts: {}",
                    attempts,
                    last_error
                );
                return Err(SessionError::RetriesExhausted {
                    attempts,
                    last: last_error,
                });
            };

            self.emitter.emit_connection(ConnectionEvent::Reconnecting {
                delay,
                attempt: attempt + 1,
            });
            tokio::select! {
                _ = cancel.cancelled() => return Ok(DisconnectReason::Requested),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Pumps one joined connection with its own store and subscriber tasks.
    async fn run_attempt(&self, connection: RoomConnection) -> DisconnectReason {
        let store = RoomStateStore::new(self.config.diff_channel_capacity);

        let synchronizer = PlaybackSynchronizer::new(
            self.sink.clone(),
            self.emitter.clone(),
            self.config.sync.clone(),
        );
        let sync_task = tokio::spawn(synchronizer.run(store.subscribe()));
        let notify_task = tokio::spawn(notifications::forward_diffs(
            store.subscribe(),
            self.notifier.clone(),
        ));

        let reason = connection.run(&store).await;

        if let Err(e) = sync_task.await {
            log::error!("[Session] Synchronizer task failed: {}", e);
        }
        if let Err(e) = notify_task.await {
            log::error!("[Session] Notification task failed: {}", e);
        }
        reason
    }
}
