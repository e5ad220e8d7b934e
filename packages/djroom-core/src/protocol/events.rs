//! Fixed room protocol names defined by the DJ server.
//!
//! These must match the server exactly; they are not tunable.

// ─────────────────────────────────────────────────────────────────────────────
// Inbound events
// ─────────────────────────────────────────────────────────────────────────────

/// Full list of users in the room, sent after joining.
pub const USERS: &str = "room:users";

/// A named user joined the room.
pub const USER_JOIN: &str = "room:user:join";

/// A named user left the room.
pub const USER_LEAVE: &str = "room:user:leave";

/// Number of anonymous listeners (this client is usually one of them).
pub const NUM_ANONYMOUS: &str = "room:num_anonymous";

/// A new song started playing.
pub const SONG_UPDATE: &str = "room:song:update";

/// Nothing is playing anymore.
pub const SONG_STOP: &str = "room:song:stop";

/// This client was kicked from the room.
pub const KICK: &str = "kick";

/// Server-side error report.
pub const ERROR: &str = "error";

// ─────────────────────────────────────────────────────────────────────────────
// Outbound events
// ─────────────────────────────────────────────────────────────────────────────

/// Join a room by short name. Answered with an ack carrying the room data.
pub const JOIN: &str = "room:join";

/// Leave the current room.
pub const LEAVE: &str = "room:leave";

// ─────────────────────────────────────────────────────────────────────────────
// Transport
// ─────────────────────────────────────────────────────────────────────────────

/// Engine.IO endpoint path, protocol revision 3 over WebSocket.
pub const ENGINE_PATH: &str = "/socket.io/?EIO=3&transport=websocket";
