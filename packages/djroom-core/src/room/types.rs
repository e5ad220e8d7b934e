//! Room domain types.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

/// A named participant in the room.
///
/// Users are identified by `handle`; two users with the same handle are the
/// same user even if their display names differ.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Human-readable name shown in notifications.
    pub display_name: String,
    /// Unique handle (the server's username).
    pub handle: String,
}

impl User {
    pub fn new(display_name: impl Into<String>, handle: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            handle: handle.into(),
        }
    }
}

/// The track the room is currently playing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub title: String,
    pub artist: String,
    pub duration_seconds: u64,
    /// Server-side position within the track when the start event was sent.
    pub started_at_offset_seconds: u64,
    /// The DJ playing the track, or `None` when the room itself is playing.
    pub playing_user: Option<User>,
    /// Direct media URL, when the server provides one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
}

impl Track {
    /// Returns the locator handed to the audio sink.
    ///
    /// Uses the server-provided URL when present, otherwise a search locator
    /// built from artist and title that `ytdl`-capable players resolve.
    #[must_use]
    pub fn media_locator(&self) -> String {
        match &self.media_url {
            Some(url) if !url.is_empty() => url.clone(),
            _ => format!("ytdl://ytsearch:{} - {}", self.artist, self.title),
        }
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_seconds)
    }

    #[must_use]
    pub fn started_at_offset(&self) -> Duration {
        Duration::from_secs(self.started_at_offset_seconds)
    }
}

/// Snapshot of everything known about the joined room.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomState {
    pub room_name: String,
    pub current_track: Option<Track>,
    /// Anonymous (non-identified) listeners.
    pub listener_count: u64,
    /// Named users keyed by handle.
    pub users: BTreeMap<String, User>,
}

impl RoomState {
    /// Returns `true` if a user with this handle is in the room.
    #[must_use]
    pub fn has_user(&self, handle: &str) -> bool {
        self.users.contains_key(handle)
    }

    /// Iterates users in handle order.
    pub fn users(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }
}

/// A decoded room protocol event.
///
/// Produced by the decoder and consumed exactly once by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    /// The join handshake completed.
    Connected { room_name: String },
    /// A new track started (replaces any current track).
    TrackStarted(Track),
    /// Nothing is playing anymore.
    TrackStopped,
    UserJoined(User),
    UserLeft(User),
    /// The anonymous listener count changed. Signed because the wire value
    /// is an unchecked JSON integer.
    ListenerCountChanged { count: i64 },
    /// Full roster replacement, sent right after joining.
    UserSnapshot(Vec<User>),
    /// This client was removed from the room by the server.
    Kicked { reason: Option<String> },
}

impl RoomEvent {
    /// Short machine-readable name used in log lines.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::TrackStarted(_) => "track_started",
            Self::TrackStopped => "track_stopped",
            Self::UserJoined(_) => "user_joined",
            Self::UserLeft(_) => "user_left",
            Self::ListenerCountChanged { .. } => "listener_count_changed",
            Self::UserSnapshot(_) => "user_snapshot",
            Self::Kicked { .. } => "kicked",
        }
    }
}

/// What the audio sink should be playing right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackIntent {
    pub media_locator: String,
    pub seek_offset: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(url: Option<&str>) -> Track {
        Track {
            title: "Catherine".into(),
            artist: "Magic Man".into(),
            duration_seconds: 216,
            started_at_offset_seconds: 11,
            playing_user: None,
            media_url: url.map(str::to_string),
        }
    }

    #[test]
    fn media_locator_prefers_url() {
        let t = track(Some("https://example.com/catherine.mp3"));
        assert_eq!(t.media_locator(), "https://example.com/catherine.mp3");
    }

    #[test]
    fn media_locator_falls_back_to_search() {
        assert_eq!(
            track(None).media_locator(),
            "ytdl://ytsearch:Magic Man - Catherine"
        );
        assert_eq!(
            track(Some("")).media_locator(),
            "ytdl://ytsearch:Magic Man - Catherine"
        );
    }
}
