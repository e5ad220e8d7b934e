//! Room event decoding.
//!
//! Pure functions that turn raw frames into [`RoomEvent`]s. Nothing here
//! touches state or performs I/O.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use super::events;
use super::packet::Packet;
use crate::room::{RoomEvent, Track, User};

/// Errors from decoding a frame.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// The frame does not match any known message shape.
    #[error("malformed message: {0}")]
    MalformedMessage(String),
}

impl DecodeError {
    pub(crate) fn malformed(detail: impl Into<String>) -> Self {
        Self::MalformedMessage(detail.into())
    }
}

pub type DecodeResult<T> = Result<T, DecodeError>;

/// Result of decoding one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A room event for the store.
    Event(RoomEvent),
    /// A transport-level packet (ping, ack, close, ...) for the connection.
    Control(Packet),
    /// The server reported an error through the `error` event.
    ServerError(String),
    /// A well-formed event this client does not know. Tolerated so newer
    /// servers can add events.
    Ignored { kind: String },
}

/// Wire shape of a user.
#[derive(Debug, Deserialize)]
struct UserPayload {
    username: String,
    #[serde(rename = "fullName")]
    full_name: String,
}

impl From<UserPayload> for User {
    fn from(payload: UserPayload) -> Self {
        User {
            display_name: payload.full_name,
            handle: payload.username,
        }
    }
}

/// Wire shape of `room:song:update`.
#[derive(Debug, Deserialize)]
struct SongPayload {
    title: String,
    artist: String,
    /// Track length in seconds.
    duration: u64,
    /// Seconds already played on the server.
    #[serde(default)]
    elapsed: u64,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    dj: Option<UserPayload>,
}

impl From<SongPayload> for Track {
    fn from(payload: SongPayload) -> Self {
        Track {
            title: payload.title,
            artist: payload.artist,
            duration_seconds: payload.duration,
            started_at_offset_seconds: payload.elapsed,
            playing_user: payload.dj.map(User::from),
            media_url: payload.url,
        }
    }
}

/// Wire shape of the `room:join` acknowledgement.
#[derive(Debug, Deserialize)]
struct JoinAckPayload {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    error: Option<Value>,
}

/// Why a `room:join` acknowledgement did not yield a room.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JoinAckError {
    #[error("server refused to join: {0}")]
    Refused(String),
    #[error(transparent)]
    Malformed(#[from] DecodeError),
}

/// Decodes one raw frame.
pub fn decode(raw: &[u8]) -> DecodeResult<Decoded> {
    let text = std::str::from_utf8(raw)
        .map_err(|e| DecodeError::malformed(format!("frame is not UTF-8: {e}")))?;
    match Packet::parse(text)? {
        Packet::Event { name, args, .. } => decode_event(&name, args),
        other => Ok(Decoded::Control(other)),
    }
}

/// Decodes a named event with its arguments.
pub fn decode_event(name: &str, args: Vec<Value>) -> DecodeResult<Decoded> {
    let mut args = args.into_iter();
    let event = match name {
        events::USERS => {
            let users: Vec<UserPayload> = required(name, args.next())?;
            RoomEvent::UserSnapshot(users.into_iter().map(User::from).collect())
        }
        events::USER_JOIN => RoomEvent::UserJoined(required::<UserPayload>(name, args.next())?.into()),
        events::USER_LEAVE => RoomEvent::UserLeft(required::<UserPayload>(name, args.next())?.into()),
        events::NUM_ANONYMOUS => RoomEvent::ListenerCountChanged {
            count: required(name, args.next())?,
        },
        events::SONG_UPDATE => RoomEvent::TrackStarted(required::<SongPayload>(name, args.next())?.into()),
        events::SONG_STOP => RoomEvent::TrackStopped,
        events::KICK => RoomEvent::Kicked {
            reason: optional_text(args.next()),
        },
        events::ERROR => {
            let message = optional_text(args.next()).unwrap_or_else(|| "unknown error".to_string());
            return Ok(Decoded::ServerError(message));
        }
        other => {
            return Ok(Decoded::Ignored {
                kind: other.to_string(),
            })
        }
    };
    Ok(Decoded::Event(event))
}

/// Decodes the acknowledgement of a `room:join` request into `Connected`.
pub fn decode_join_ack(args: Vec<Value>) -> Result<RoomEvent, JoinAckError> {
    let payload = args
        .into_iter()
        .next()
        .ok_or_else(|| DecodeError::malformed("join acknowledgement without data"))?;
    let ack: JoinAckPayload = serde_json::from_value(payload)
        .map_err(|e| DecodeError::malformed(format!("invalid join acknowledgement: {e}")))?;

    if let Some(error) = ack.error {
        let message = match error {
            Value::String(text) => text,
            other => other.to_string(),
        };
        return Err(JoinAckError::Refused(message));
    }
    let room_name = ack
        .name
        .ok_or_else(|| DecodeError::malformed("join acknowledgement without room name"))?;
    Ok(RoomEvent::Connected { room_name })
}

fn required<T: DeserializeOwned>(event: &str, value: Option<Value>) -> DecodeResult<T> {
    let value = value.ok_or_else(|| DecodeError::malformed(format!("{event}: missing payload")))?;
    serde_json::from_value(value).map_err(|e| DecodeError::malformed(format!("{event}: {e}")))
}

fn optional_text(value: Option<Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(text) => Some(text),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| Some(Value::Object(map).to_string())),
        other => Some(other.to_string()),
    }
}
