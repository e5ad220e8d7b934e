//! Shared test fixtures for room protocol frames.

/// `room:song:update` for "Catherine" by Magic Man, 11s in, DJ'd by drew.
pub const SONG_UPDATE_CATHERINE: &str = r#"42["room:song:update",{"title":"Catherine","artist":"Magic Man","duration":216,"elapsed":11,"dj":{"username":"drew","fullName":"Drew Smith"}}]"#;

/// `room:song:update` played by the room itself, with a direct URL.
pub const SONG_UPDATE_NO_DJ: &str = r#"42["room:song:update",{"title":"Paris","artist":"Magic Man","duration":190,"url":"https://cdn.example/paris.mp3","dj":null}]"#;

pub const SONG_STOP: &str = r#"42["room:song:stop"]"#;

pub const USERS_TWO: &str = r#"42["room:users",[{"username":"drew","fullName":"Drew Smith"},{"username":"ana","fullName":"Ana Lee"}]]"#;

pub const USER_JOIN_DREW: &str = r#"42["room:user:join",{"username":"drew","fullName":"Drew Smith"}]"#;

pub const USER_LEAVE_DREW: &str = r#"42["room:user:leave",{"username":"drew","fullName":"Drew Smith"}]"#;

pub const NUM_ANONYMOUS_ONE: &str = r#"42["room:num_anonymous",1]"#;

/// Looks like an event but the JSON is cut off.
pub const MALFORMED_FRAME: &str = r#"42["room:user:join",{"username":"#;

/// Engine.IO open packet with short timers for tests.
pub const OPEN_FAST: &str = r#"0{"sid":"test-sid","upgrades":[],"pingInterval":50,"pingTimeout":100}"#;

/// Engine.IO open packet with timers long enough to never fire in a test.
pub const OPEN_SLOW: &str = r#"0{"sid":"test-sid","upgrades":[],"pingInterval":60000,"pingTimeout":60000}"#;
