//! Human-readable notifications.
//!
//! Everything the user sees about the room goes through here: room diffs,
//! playback events and connection events are turned into one line each and
//! handed to a [`Notifier`].

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use crate::connection::DisconnectReason;
use crate::events::{ConnectionEvent, EventEmitter, PlaybackEvent};
use crate::room::{Change, DiffStream, StateDiff, User};

/// Severity of a notification line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Debug,
    Info,
    Warn,
}

/// Receives formatted notification lines.
pub trait Notifier: Send + Sync {
    fn notify(&self, level: NoticeLevel, message: &str);
}

/// Forwards notifications to the `log` facade.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, level: NoticeLevel, message: &str) {
        match level {
            NoticeLevel::Debug => log::debug!("[Room] {}", message),
            NoticeLevel::Info => log::info!("[Room] {}", message),
            NoticeLevel::Warn => log::warn!("[Room] {}", message),
        }
    }
}

/// Formats room diffs.
///
/// Stateful only for the anonymous listener count, which is reported when it
/// changes. The count starts at zero, so an empty room is not announced.
#[derive(Debug, Default)]
pub struct RoomNotices {
    last_anonymous: u64,
}

impl RoomNotices {
    pub fn describe(&mut self, diff: &StateDiff) -> Option<(NoticeLevel, String)> {
        let notice = match &diff.change {
            Change::Connected { room_name } => (NoticeLevel::Info, format!("Joined room \"{room_name}\"")),
            Change::TrackStarted { track, .. } => {
                let dj = match &track.playing_user {
                    Some(user) => format!("User {}", user.handle),
                    None => "The room".to_string(),
                };
                (
                    NoticeLevel::Info,
                    format!(
                        "{dj} is currently playing \"{}\" by {}",
                        track.title, track.artist
                    ),
                )
            }
            Change::TrackStopped { .. } => {
                (NoticeLevel::Info, "No song is currently playing.".to_string())
            }
            Change::UserJoined { user, updated } => {
                let level = if *updated { NoticeLevel::Debug } else { NoticeLevel::Info };
                (level, format!("{} joined the room.", user.display_name))
            }
            Change::UserLeft { user, was_present } => {
                let level = if *was_present { NoticeLevel::Info } else { NoticeLevel::Debug };
                (level, format!("{} left the room.", user.display_name))
            }
            Change::RosterReplaced { users } => (NoticeLevel::Info, roster_line(users)),
            Change::ListenerCountChanged { current, .. } => {
                if self.last_anonymous == *current {
                    return None;
                }
                self.last_anonymous = *current;
                (NoticeLevel::Info, anonymous_line(*current))
            }
            Change::Kicked { reason: Some(reason) } => (
                NoticeLevel::Info,
                format!("Kicked from the room. Reason: {reason}"),
            ),
            Change::Kicked { reason: None } => {
                (NoticeLevel::Info, "Kicked from the room.".to_string())
            }
            Change::Disconnected { reason } => match reason {
                DisconnectReason::Requested => (NoticeLevel::Info, "Left the room.".to_string()),
                // Already reported by the Kicked diff.
                DisconnectReason::Kicked { .. } => {
                    (NoticeLevel::Debug, format!("Disconnected: {reason}"))
                }
                other => (NoticeLevel::Warn, format!("Disconnected from the room: {other}")),
            },
        };
        Some(notice)
    }
}

fn roster_line(users: &[User]) -> String {
    if users.is_empty() {
        return "No named users are currently in the room.".to_string();
    }
    let names: Vec<&str> = users.iter().map(|u| u.display_name.as_str()).collect();
    format!("Users currently in the room: {}", names.join(", "))
}

fn anonymous_line(count: u64) -> String {
    if count == 1 {
        "There is currently 1 anonymous listener in the room. It's probably this client."
            .to_string()
    } else {
        format!("There are currently {count} anonymous listeners in the room.")
    }
}

/// `m:ss` rendering of an offset.
fn clock(offset: Duration) -> String {
    let secs = offset.as_secs();
    format!("{}:{:02}", secs / 60, secs % 60)
}

pub fn describe_playback(event: &PlaybackEvent) -> (NoticeLevel, String) {
    match event {
        PlaybackEvent::Started {
            title,
            artist,
            seek_offset,
        } if seek_offset.is_zero() => (NoticeLevel::Info, format!("Playing \"{title}\" by {artist}")),
        PlaybackEvent::Started {
            title,
            artist,
            seek_offset,
        } => (
            NoticeLevel::Info,
            format!("Playing \"{title}\" by {artist} from {}", clock(*seek_offset)),
        ),
        PlaybackEvent::Stopped { title } => (NoticeLevel::Debug, format!("Stopped \"{title}\"")),
        PlaybackEvent::Finished { title } => (NoticeLevel::Debug, format!("Finished \"{title}\"")),
        PlaybackEvent::Skipped { title } => (
            NoticeLevel::Info,
            format!("\"{title}\" has already ended, waiting for the next song."),
        ),
        PlaybackEvent::Retrying {
            title,
            attempt,
            max_attempts,
            error,
        } => (
            NoticeLevel::Warn,
            format!("Playback of \"{title}\" failed ({error}), retrying ({attempt}/{max_attempts})"),
        ),
        PlaybackEvent::Failed { title, error } => (
            NoticeLevel::Warn,
            format!("Could not play \"{title}\": {error}. No audio until the next song."),
        ),
        PlaybackEvent::Observed {
            media_locator,
            seek_offset,
            ..
        } => (
            NoticeLevel::Info,
            format!(
                "Audio disabled, would play {media_locator} from {}",
                clock(*seek_offset)
            ),
        ),
    }
}

pub fn describe_connection(event: &ConnectionEvent) -> (NoticeLevel, String) {
    match event {
        ConnectionEvent::Connecting { url, attempt } => (
            NoticeLevel::Debug,
            format!("Connecting to {url} (attempt {attempt})"),
        ),
        ConnectionEvent::AttemptFailed { attempt, error, .. } => (
            NoticeLevel::Warn,
            format!("Connection attempt {attempt} failed: {error}"),
        ),
        ConnectionEvent::Reconnecting { delay, attempt } => (
            NoticeLevel::Info,
            format!(
                "Reconnecting in {:.1}s (attempt {attempt})",
                delay.as_secs_f64()
            ),
        ),
        ConnectionEvent::ServerError { message } => {
            (NoticeLevel::Warn, format!("Error: {message}"))
        }
    }
}

/// [`EventEmitter`] that formats events and hands them to a [`Notifier`].
pub struct NotifyingEmitter {
    notifier: Arc<dyn Notifier>,
}

impl NotifyingEmitter {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }
}

impl EventEmitter for NotifyingEmitter {
    fn emit_playback(&self, event: PlaybackEvent) {
        tracing::debug!(?event, "playback event");
        let (level, message) = describe_playback(&event);
        self.notifier.notify(level, &message);
    }

    fn emit_connection(&self, event: ConnectionEvent) {
        tracing::debug!(?event, "connection event");
        let (level, message) = describe_connection(&event);
        self.notifier.notify(level, &message);
    }
}

/// Turns every diff of one session attempt into a notification line.
pub(crate) async fn forward_diffs(mut diffs: DiffStream, notifier: Arc<dyn Notifier>) {
    let mut notices = RoomNotices::default();
    while let Some(diff) = diffs.next().await {
        tracing::debug!(seq = diff.seq, change = ?diff.change, "room diff");
        if let Some((level, message)) = notices.describe(&diff) {
            notifier.notify(level, &message);
        }
        if diff.is_terminal() {
            break;
        }
    }
}
