//! Event system for surfacing what the session is doing.
//!
//! This module provides:
//! - [`EventEmitter`] trait that components use to report activity
//! - Event types for playback and connection activity
//!
//! Room state changes travel as [`StateDiff`](crate::room::StateDiff)s; the
//! types here cover everything that is not a room state change.

mod emitter;

pub use emitter::{EventEmitter, NoopEventEmitter};

use std::time::Duration;

use serde::Serialize;

/// Events reported by the playback synchronizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PlaybackEvent {
    /// The sink accepted a start command.
    Started {
        title: String,
        artist: String,
        #[serde(rename = "seekOffsetMs", serialize_with = "as_millis")]
        seek_offset: Duration,
    },
    /// Playback was stopped on request (track stop, new track, shutdown).
    Stopped { title: String },
    /// The sink reached the end of the track on its own.
    Finished { title: String },
    /// The track was already over by the time it was observed.
    Skipped { title: String },
    /// The sink failed and the intent is being re-issued.
    Retrying {
        title: String,
        attempt: u32,
        max_attempts: u32,
        error: String,
    },
    /// Retries are exhausted; no audio until the next track.
    Failed { title: String, error: String },
    /// No-audio mode: what would have been played.
    Observed {
        title: String,
        #[serde(rename = "mediaLocator")]
        media_locator: String,
        #[serde(rename = "seekOffsetMs", serialize_with = "as_millis")]
        seek_offset: Duration,
    },
}

/// Events related to the connection lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ConnectionEvent {
    /// A connection attempt is starting.
    Connecting { url: String, attempt: u32 },
    /// A connection attempt failed before the room was joined.
    AttemptFailed {
        attempt: u32,
        code: &'static str,
        error: String,
    },
    /// Waiting before the next attempt.
    Reconnecting {
        #[serde(rename = "delayMs", serialize_with = "as_millis")]
        delay: Duration,
        attempt: u32,
    },
    /// The server reported an error without closing the session.
    ServerError { message: String },
}

fn as_millis<S: serde::Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_millis() as u64)
}
