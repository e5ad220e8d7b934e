//! Event emitter abstraction for decoupling components from presentation.
//!
//! The connection manager and playback synchronizer depend on the
//! [`EventEmitter`] trait rather than on a logger, so formatting stays in one
//! place (the session's notification layer) and tests can record events.

use super::{ConnectionEvent, PlaybackEvent};

/// Trait for emitting session events without knowledge of how they are shown.
///
/// # Example
///
/// ```ignore
/// struct MyComponent {
///     emitter: Arc<dyn EventEmitter>,
/// }
///
/// impl MyComponent {
///     fn on_failure(&self, message: String) {
///         self.emitter.emit_connection(ConnectionEvent::ServerError { message });
///     }
/// }
/// ```
pub trait EventEmitter: Send + Sync {
    /// Emits a playback lifecycle event.
    fn emit_playback(&self, event: PlaybackEvent);

    /// Emits a connection lifecycle event.
    fn emit_connection(&self, event: ConnectionEvent);
}

/// No-op emitter for embedding or testing.
///
/// Events are silently discarded.
pub struct NoopEventEmitter;

impl EventEmitter for NoopEventEmitter {
    fn emit_playback(&self, _event: PlaybackEvent) {
        // No-op
    }

    fn emit_connection(&self, _event: ConnectionEvent) {
        // No-op
    }
}
