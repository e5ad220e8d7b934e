//! Keeps the local audio sink in step with the room's current track.
//!
//! The synchronizer is a single task consuming room diffs. Every sink command
//! is issued from that task, so there is never more than one start or stop in
//! flight.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::time::Instant;

use super::sink::{AudioSink, PlaybackRequest, SinkExit, SinkHandle};
use crate::events::{EventEmitter, PlaybackEvent};
use crate::room::{Change, DiffStream, PlaybackIntent, StateDiff, Track};

/// Tunables for the synchronizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPolicy {
    /// `false` runs in observe-only mode: no sink commands at all.
    pub audio_enabled: bool,
    /// Offsets up to this value start from the beginning, and a sink that
    /// ends this close to the track end counts as finished.
    pub tolerance: Duration,
    /// How often a failed playback is re-issued before giving up.
    pub max_sink_retries: u32,
    /// Output device passed to the sink.
    pub device: Option<String>,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            audio_enabled: true,
            tolerance: Duration::from_secs(2),
            max_sink_retries: 1,
            device: None,
        }
    }
}

/// Where the synchronizer is in the playback lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    /// A start with a non-zero seek has been issued and not yet accepted.
    Seeking,
    Playing,
}

struct ActiveTrack {
    track: Track,
    observed_at: Instant,
    handle: Option<SinkHandle>,
    retries: u32,
}

impl ActiveTrack {
    /// Server-side position right now.
    fn position(&self) -> Duration {
        self.track.started_at_offset() + self.observed_at.elapsed()
    }
}

/// Drives an [`AudioSink`] from a stream of room diffs.
pub struct PlaybackSynchronizer {
    sink: Arc<dyn AudioSink>,
    emitter: Arc<dyn EventEmitter>,
    policy: SyncPolicy,
    state: watch::Sender<SyncState>,
    active: Option<ActiveTrack>,
}

impl PlaybackSynchronizer {
    pub fn new(sink: Arc<dyn AudioSink>, emitter: Arc<dyn EventEmitter>, policy: SyncPolicy) -> Self {
        Self {
            sink,
            emitter,
            policy,
            state: watch::channel(SyncState::Idle).0,
            active: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    /// Follows state transitions while [`run`](Self::run) owns the
    /// synchronizer.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: SyncState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            log::debug!("[Sync] {:?} -> {:?}", previous, state);
        }
    }

    /// Consumes diffs until the terminal `Disconnected` diff or the end of
    /// the stream. Any live playback is stopped before returning.
    pub async fn run(mut self, mut diffs: DiffStream) -> SyncState {
        loop {
            tokio::select! {
                biased;

                exit = wait_ended(self.active.as_mut()) => {
                    self.on_sink_ended(exit).await;
                }
                diff = diffs.next() => match diff {
                    Some(diff) => {
                        let terminal = diff.is_terminal();
                        self.on_diff(diff).await;
                        if terminal {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        self.stop_current().await;
        log::debug!("[Sync] Synchronizer finished");
        self.state()
    }

    async fn on_diff(&mut self, diff: StateDiff) {
        match diff.change {
            Change::TrackStarted { track, observed_at } => {
                self.stop_current().await;
                self.active = Some(ActiveTrack {
                    track,
                    observed_at,
                    handle: None,
                    retries: 0,
                });
                self.launch().await;
            }
            Change::TrackStopped { .. } | Change::Kicked { .. } | Change::Disconnected { .. } => {
                self.stop_current().await;
            }
            _ => {}
        }
    }

    /// Starts the active track at its current position, retrying start
    /// failures within the policy.
    async fn launch(&mut self) {
        loop {
            let Some(active) = self.active.as_ref() else {
                self.set_state(SyncState::Idle);
                return;
            };
            let title = active.track.title.clone();
            let position = active.position();

            if position >= active.track.duration() {
                log::info!("[Sync] '{}' is already over ({:?} in), skipping", title, position);
                self.active = None;
                self.set_state(SyncState::Idle);
                self.emitter.emit_playback(PlaybackEvent::Skipped { title });
                return;
            }

            let intent = PlaybackIntent {
                media_locator: active.track.media_locator(),
                seek_offset: if position <= self.policy.tolerance {
                    Duration::ZERO
                } else {
                    position
                },
            };

            if !self.policy.audio_enabled {
                log::info!(
                    "[Sync] Would play {} from {:?}",
                    intent.media_locator,
                    intent.seek_offset
                );
                self.active = None;
                self.set_state(SyncState::Idle);
                self.emitter.emit_playback(PlaybackEvent::Observed {
                    title,
                    media_locator: intent.media_locator,
                    seek_offset: intent.seek_offset,
                });
                return;
            }

            let artist = active.track.artist.clone();
            let seek_offset = intent.seek_offset;
            self.set_state(if seek_offset.is_zero() {
                SyncState::Playing
            } else {
                SyncState::Seeking
            });

            let request = PlaybackRequest::new(intent, self.policy.device.clone());
            match self.sink.start(&request).await {
                Ok(handle) => {
                    log::info!("[Sync] Playing '{}' from {:?}", title, seek_offset);
                    if let Some(active) = self.active.as_mut() {
                        active.handle = Some(handle);
                    }
                    self.set_state(SyncState::Playing);
                    self.emitter.emit_playback(PlaybackEvent::Started {
                        title,
                        artist,
                        seek_offset,
                    });
                    return;
                }
                Err(e) => {
                    if !self.retry_after(e.to_string()) {
                        return;
                    }
                }
            }
        }
    }

    async fn on_sink_ended(&mut self, exit: SinkExit) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        if let Some(handle) = active.handle.take() {
            self.sink.stop(handle).await;
        }

        let title = active.track.title.clone();
        if active.position() + self.policy.tolerance >= active.track.duration() {
            log::info!("[Sync] '{}' finished", title);
            self.set_state(SyncState::Idle);
            self.emitter.emit_playback(PlaybackEvent::Finished { title });
            return;
        }

        let error = match exit {
            SinkExit::Finished => "player exited before the end of the track".to_string(),
            SinkExit::Failed(reason) => reason,
        };
        self.active = Some(active);
        if self.retry_after(error) {
            self.launch().await;
        }
    }

    /// Records a failure of the active track. Returns `true` when another
    /// start should be attempted.
    fn retry_after(&mut self, error: String) -> bool {
        let max_attempts = self.policy.max_sink_retries;
        let Some(active) = self.active.as_mut() else {
            return false;
        };
        let title = active.track.title.clone();

        if active.retries < max_attempts {
            active.retries += 1;
            log::warn!(
                "[Sync] Playback of '{}' failed ({}), retrying ({}/{})",
                title,
                error,
                active.retries,
                max_attempts
            );
            self.emitter.emit_playback(PlaybackEvent::Retrying {
                title,
                attempt: active.retries,
                max_attempts,
                error,
            });
            return true;
        }

        log::warn!("[Sync] Giving up on '{}': {}", title, error);
        self.active = None;
        self.set_state(SyncState::Idle);
        self.emitter
            .emit_playback(PlaybackEvent::Failed { title, error });
        false
    }

    async fn stop_current(&mut self) {
        if let Some(mut active) = self.active.take() {
            if let Some(handle) = active.handle.take() {
                self.sink.stop(handle).await;
                log::debug!("[Sync] Stopped '{}'", active.track.title);
                self.emitter.emit_playback(PlaybackEvent::Stopped {
                    title: active.track.title,
                });
            }
        }
        self.set_state(SyncState::Idle);
    }
}

/// Resolves when the active playback ends on its own; pending otherwise.
async fn wait_ended(active: Option<&mut ActiveTrack>) -> SinkExit {
    match active.and_then(|active| active.handle.as_mut()) {
        Some(handle) => (&mut handle.ended)
            .await
            .unwrap_or_else(|_| SinkExit::Failed("sink dropped the playback".to_string())),
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::DisconnectReason;
    use crate::playback::sink::{SinkError, SinkResult};
    use crate::room::{RoomEvent, RoomStateStore};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use tokio::sync::oneshot;

    /// What a mock playback does after it starts.
    enum Script {
        /// Keeps playing until stopped.
        Hold,
        /// Ends right away.
        End(SinkExit),
        /// Ends after the given time.
        EndAfter(Duration, SinkExit),
        /// `start` itself fails.
        Refuse,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Start(String),
        Stop,
    }

    #[derive(Default)]
    struct MockSink {
        scripts: Mutex<VecDeque<Script>>,
        calls: Mutex<Vec<Call>>,
        requests: Mutex<Vec<PlaybackRequest>>,
        held: Mutex<Vec<oneshot::Sender<SinkExit>>>,
        live: Mutex<usize>,
        max_live: Mutex<usize>,
        next_id: Mutex<u64>,
    }

    impl MockSink {
        fn scripted(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                ..Self::default()
            })
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }

        fn starts(&self) -> usize {
            self.calls().iter().filter(|c| matches!(c, Call::Start(_))).count()
        }
    }

    #[async_trait]
    impl AudioSink for MockSink {
        async fn start(&self, request: &PlaybackRequest) -> SinkResult<SinkHandle> {
            self.calls.lock().push(Call::Start(request.media_locator.clone()));
            self.requests.lock().push(request.clone());

            let script = self.scripts.lock().pop_front().unwrap_or(Script::Hold);
            if let Script::Refuse = script {
                return Err(SinkError::Rejected("no output device".into()));
            }

            let (tx, rx) = oneshot::channel();
            match script {
                Script::Hold => self.held.lock().push(tx),
                Script::End(exit) => {
                    let _ = tx.send(exit);
                }
                Script::EndAfter(delay, exit) => {
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(exit);
                    });
                }
                Script::Refuse => unreachable!(),
            }

            let mut live = self.live.lock();
            *live += 1;
            let mut max_live = self.max_live.lock();
            *max_live = (*max_live).max(*live);

            let mut id = self.next_id.lock();
            *id += 1;
            Ok(SinkHandle::new(*id, rx))
        }

        async fn stop(&self, _handle: SinkHandle) {
            self.calls.lock().push(Call::Stop);
            *self.live.lock() -= 1;
        }
    }

    #[derive(Default)]
    struct RecordingEmitter {
        events: Mutex<Vec<PlaybackEvent>>,
    }

    impl EventEmitter for RecordingEmitter {
        fn emit_playback(&self, event: PlaybackEvent) {
            self.events.lock().push(event);
        }

        fn emit_connection(&self, _event: crate::events::ConnectionEvent) {}
    }

    impl RecordingEmitter {
        fn events(&self) -> Vec<PlaybackEvent> {
            self.events.lock().clone()
        }
    }

    fn track(title: &str, duration: u64, offset: u64) -> Track {
        Track {
            title: title.into(),
            artist: "Magic Man".into(),
            duration_seconds: duration,
            started_at_offset_seconds: offset,
            playing_user: None,
            media_url: None,
        }
    }

    struct Harness {
        store: RoomStateStore,
        sink: Arc<MockSink>,
        emitter: Arc<RecordingEmitter>,
        task: tokio::task::JoinHandle<SyncState>,
    }

    impl Harness {
        fn new(scripts: Vec<Script>, policy: SyncPolicy) -> Self {
            let store = RoomStateStore::new(8);
            let sink = MockSink::scripted(scripts);
            let emitter = Arc::new(RecordingEmitter::default());
            let sync = PlaybackSynchronizer::new(sink.clone(), emitter.clone(), policy);
            let task = tokio::spawn(sync.run(store.subscribe()));
            Self {
                store,
                sink,
                emitter,
                task,
            }
        }

        async fn send(&self, event: RoomEvent) {
            self.store.apply_and_publish(event).await.unwrap();
        }

        async fn finish(self) -> (Arc<MockSink>, Arc<RecordingEmitter>, SyncState) {
            self.store.terminate(DisconnectReason::Requested).await;
            let state = self.task.await.unwrap();
            (self.sink, self.emitter, state)
        }
    }

    #[tokio::test]
    async fn new_track_stops_previous_before_starting() {
        let harness = Harness::new(vec![], SyncPolicy::default());
        harness.send(RoomEvent::TrackStarted(track("Catherine", 216, 11))).await;
        harness.send(RoomEvent::TrackStarted(track("Paris", 190, 0))).await;
        let (sink, emitter, state) = harness.finish().await;

        assert_eq!(
            sink.calls(),
            vec![
                Call::Start("ytdl://ytsearch:Magic Man - Catherine".into()),
                Call::Stop,
                Call::Start("ytdl://ytsearch:Magic Man - Paris".into()),
                Call::Stop,
            ]
        );
        assert_eq!(*sink.max_live.lock(), 1);
        assert_eq!(state, SyncState::Idle);

        let requests = sink.requests.lock().clone();
        assert!(requests[0].seek_offset >= Duration::from_secs(11));
        assert!(requests[0].seek_offset < Duration::from_secs(13));
        assert_eq!(requests[1].seek_offset, Duration::ZERO);
        assert!(matches!(emitter.events()[1], PlaybackEvent::Stopped { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn seek_includes_time_since_the_event_was_applied() {
        let store = RoomStateStore::new(8);
        let diffs = store.subscribe();
        store
            .apply_and_publish(RoomEvent::TrackStarted(track("Catherine", 216, 11)))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;

        let sink = MockSink::scripted(vec![]);
        let sync = PlaybackSynchronizer::new(
            sink.clone(),
            Arc::new(RecordingEmitter::default()),
            SyncPolicy::default(),
        );
        let task = tokio::spawn(sync.run(diffs));
        store.terminate(DisconnectReason::Requested).await;
        task.await.unwrap();

        let seek_offset = sink.requests.lock()[0].seek_offset;
        assert!(seek_offset >= Duration::from_secs(41), "got {seek_offset:?}");
        assert!(seek_offset < Duration::from_secs(42), "got {seek_offset:?}");
    }

    /// Sink whose `start` waits until the test opens the gate.
    struct GatedSink {
        gate: tokio::sync::Semaphore,
        held: Mutex<Vec<oneshot::Sender<SinkExit>>>,
    }

    #[async_trait]
    impl AudioSink for GatedSink {
        async fn start(&self, _request: &PlaybackRequest) -> SinkResult<SinkHandle> {
            self.gate.acquire().await.unwrap().forget();
            let (tx, rx) = oneshot::channel();
            self.held.lock().push(tx);
            Ok(SinkHandle::new(1, rx))
        }

        async fn stop(&self, _handle: SinkHandle) {}
    }

    async fn wait_for_state(states: &mut watch::Receiver<SyncState>, want: SyncState) {
        tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == want))
            .await
            .expect("state transition timed out")
            .unwrap();
    }

    #[tokio::test]
    async fn state_moves_through_seeking_and_playing_to_idle() {
        let store = RoomStateStore::new(8);
        let sink = Arc::new(GatedSink {
            gate: tokio::sync::Semaphore::new(0),
            held: Mutex::new(Vec::new()),
        });
        let sync = PlaybackSynchronizer::new(
            sink.clone(),
            Arc::new(RecordingEmitter::default()),
            SyncPolicy::default(),
        );
        let mut states = sync.state_receiver();
        assert_eq!(*states.borrow(), SyncState::Idle);
        let task = tokio::spawn(sync.run(store.subscribe()));

        store
            .apply_and_publish(RoomEvent::TrackStarted(track("Catherine", 216, 30)))
            .await
            .unwrap();
        wait_for_state(&mut states, SyncState::Seeking).await;

        sink.gate.add_permits(1);
        wait_for_state(&mut states, SyncState::Playing).await;

        store.apply_and_publish(RoomEvent::TrackStopped).await.unwrap();
        wait_for_state(&mut states, SyncState::Idle).await;

        store.terminate(DisconnectReason::Requested).await;
        assert_eq!(task.await.unwrap(), SyncState::Idle);
    }

    #[tokio::test]
    async fn small_offset_starts_from_zero() {
        let harness = Harness::new(vec![], SyncPolicy::default());
        harness.send(RoomEvent::TrackStarted(track("Catherine", 216, 1))).await;
        let (sink, _, _) = harness.finish().await;

        assert_eq!(sink.requests.lock()[0].seek_offset, Duration::ZERO);
    }

    #[tokio::test]
    async fn finished_track_is_skipped() {
        let harness = Harness::new(vec![], SyncPolicy::default());
        harness.send(RoomEvent::TrackStarted(track("Catherine", 10, 10))).await;
        let (sink, emitter, _) = harness.finish().await;

        assert_eq!(sink.starts(), 0);
        assert_eq!(
            emitter.events(),
            vec![PlaybackEvent::Skipped {
                title: "Catherine".into()
            }]
        );
    }

    #[tokio::test]
    async fn track_stop_stops_the_sink() {
        let harness = Harness::new(vec![], SyncPolicy::default());
        harness.send(RoomEvent::TrackStarted(track("Catherine", 216, 0))).await;
        harness.send(RoomEvent::TrackStopped).await;
        harness.send(RoomEvent::ListenerCountChanged { count: 2 }).await;
        let (sink, _, _) = harness.finish().await;

        assert_eq!(
            sink.calls(),
            vec![
                Call::Start("ytdl://ytsearch:Magic Man - Catherine".into()),
                Call::Stop,
            ]
        );
    }

    #[tokio::test]
    async fn unexpected_exit_is_retried_once_then_reported() {
        let harness = Harness::new(
            vec![
                Script::End(SinkExit::Failed("decoder crashed".into())),
                Script::End(SinkExit::Failed("decoder crashed".into())),
            ],
            SyncPolicy::default(),
        );
        harness.send(RoomEvent::TrackStarted(track("Catherine", 216, 11))).await;
        harness.send(RoomEvent::TrackStarted(track("Paris", 190, 0))).await;
        let (sink, emitter, _) = harness.finish().await;

        // Two attempts for Catherine, then Paris still plays.
        assert_eq!(sink.starts(), 3);
        let events = emitter.events();
        let retries = events
            .iter()
            .filter(|e| matches!(e, PlaybackEvent::Retrying { .. }))
            .count();
        assert_eq!(retries, 1);
        assert!(events.contains(&PlaybackEvent::Failed {
            title: "Catherine".into(),
            error: "decoder crashed".into(),
        }));
        assert!(matches!(
            events.last(),
            Some(PlaybackEvent::Stopped { title }) if title == "Paris"
        ));
    }

    #[tokio::test]
    async fn start_failure_follows_retry_path() {
        let harness = Harness::new(vec![Script::Refuse, Script::Refuse], SyncPolicy::default());
        harness.send(RoomEvent::TrackStarted(track("Catherine", 216, 0))).await;
        let (sink, emitter, state) = harness.finish().await;

        assert_eq!(sink.starts(), 2);
        assert_eq!(*sink.max_live.lock(), 0);
        assert!(matches!(
            emitter.events().last(),
            Some(PlaybackEvent::Failed { .. })
        ));
        assert_eq!(state, SyncState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn exit_near_track_end_is_a_natural_finish() {
        let harness = Harness::new(
            vec![Script::EndAfter(Duration::from_secs(4), SinkExit::Finished)],
            SyncPolicy::default(),
        );
        harness.send(RoomEvent::TrackStarted(track("Catherine", 5, 0))).await;
        tokio::time::sleep(Duration::from_secs(6)).await;
        let (sink, emitter, _) = harness.finish().await;

        assert_eq!(sink.starts(), 1);
        assert!(emitter.events().contains(&PlaybackEvent::Finished {
            title: "Catherine".into()
        }));
        assert!(!emitter
            .events()
            .iter()
            .any(|e| matches!(e, PlaybackEvent::Retrying { .. })));
    }

    #[tokio::test]
    async fn no_audio_mode_only_observes() {
        let policy = SyncPolicy {
            audio_enabled: false,
            ..SyncPolicy::default()
        };
        let harness = Harness::new(vec![], policy);
        harness.send(RoomEvent::TrackStarted(track("Catherine", 216, 0))).await;
        harness.send(RoomEvent::TrackStopped).await;
        let (sink, emitter, _) = harness.finish().await;

        assert!(sink.calls().is_empty());
        assert_eq!(
            emitter.events(),
            vec![PlaybackEvent::Observed {
                title: "Catherine".into(),
                media_locator: "ytdl://ytsearch:Magic Man - Catherine".into(),
                seek_offset: Duration::ZERO,
            }]
        );
    }

    #[tokio::test]
    async fn device_is_forwarded() {
        let policy = SyncPolicy {
            device: Some("pulse/headphones".into()),
            ..SyncPolicy::default()
        };
        let harness = Harness::new(vec![], policy);
        harness.send(RoomEvent::TrackStarted(track("Catherine", 216, 0))).await;
        let (sink, _, _) = harness.finish().await;

        assert_eq!(
            sink.requests.lock()[0].device.as_deref(),
            Some("pulse/headphones")
        );
    }
}
