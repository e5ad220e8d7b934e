//! Local playback: the audio sink seam and the synchronizer that drives it.

pub mod sink;
pub mod synchronizer;

pub use sink::{
    AudioSink, PlaybackRequest, ProcessSink, SinkCommand, SinkError, SinkExit, SinkHandle,
    SinkResult,
};
pub use synchronizer::{PlaybackSynchronizer, SyncPolicy, SyncState};
