//! Room state: domain types and the authoritative state store.

pub mod store;
pub mod types;

pub use store::{Change, DiffStream, RoomStateStore, StateDiff, StoreError, StoreResult};
pub use types::{PlaybackIntent, RoomEvent, RoomState, Track, User};
