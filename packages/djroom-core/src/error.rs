//! Centralized error types for the djroom core library.
//!
//! Each module defines its own `thiserror` enum. [`ErrorCode`] gives every
//! one of them a machine-readable code for log lines and events.

use crate::protocol::DecodeError;
use crate::room::StoreError;

/// Trait for error types that provide machine-readable error codes.
pub trait ErrorCode {
    /// Returns a short, stable, snake_case error code.
    fn code(&self) -> &'static str;
}

impl ErrorCode for DecodeError {
    fn code(&self) -> &'static str {
        match self {
            Self::MalformedMessage(_) => "malformed_message",
        }
    }
}

impl ErrorCode for StoreError {
    fn code(&self) -> &'static str {
        match self {
            Self::InvalidState(_) => "invalid_state",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Result Type Aliases
// ─────────────────────────────────────────────────────────────────────────────

// Re-export Result type aliases from their defining modules
pub use crate::connection::ConnectResult;
pub use crate::playback::SinkResult;
pub use crate::protocol::DecodeResult;
pub use crate::room::StoreResult;
pub use crate::session::SessionResult;
