//! djroom core - client library for listening along in a DJ room.
//!
//! This crate joins a room on a DJ server over Socket.IO, keeps a local copy
//! of the room state, and plays the current track on a local audio sink at
//! the same position as everyone else. The `djroom` binary is a thin CLI on
//! top of it.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`protocol`]: Packet framing and the room event decoder
//! - [`room`]: Room domain types and the state store that publishes diffs
//! - [`connection`]: WebSocket transport, join handshake and the frame pump
//! - [`playback`]: Audio sink seam and the playback synchronizer
//! - [`session`]: Orchestration, reconnect backoff and notifications
//! - [`events`]: Event types for playback and connection activity
//! - [`error`]: Centralized error types
//!
//! # Abstraction Traits
//!
//! - [`AudioSink`](playback::AudioSink): Rendering a track (default: `mpv`)
//! - [`EventEmitter`](events::EventEmitter): Reporting activity
//! - [`Notifier`](session::Notifier): Receiving human-readable lines

#![allow(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
pub mod error;
pub mod events;
pub mod playback;
pub mod protocol;
pub mod room;
pub mod session;

// Re-export commonly used types at the crate root
pub use connection::{ConnectError, ConnectionConfig, DisconnectHandle, DisconnectReason, RoomConnection};
pub use error::ErrorCode;
pub use events::{ConnectionEvent, EventEmitter, NoopEventEmitter, PlaybackEvent};
pub use playback::{AudioSink, PlaybackSynchronizer, ProcessSink, SinkCommand, SyncPolicy};
pub use room::{Change, RoomEvent, RoomState, RoomStateStore, StateDiff, Track, User};
pub use session::{
    LogNotifier, NoticeLevel, Notifier, RetryPolicy, SessionConfig, SessionError,
    SessionOrchestrator,
};
