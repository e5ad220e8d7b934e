//! Authoritative room state with ordered change notification.
//!
//! The store is the only owner of [`RoomState`]. Events are applied one at a
//! time under a single write lock, so readers never observe a half-applied
//! event. Every applied event yields exactly one [`StateDiff`], which is
//! delivered to each subscriber through its own bounded channel in
//! application order.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;

use crate::connection::DisconnectReason;
use crate::room::types::{RoomEvent, RoomState, Track, User};

/// Errors from applying an event to the store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The event would leave the room in an inconsistent state.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Stream of diffs handed to a subscriber.
pub type DiffStream = ReceiverStream<StateDiff>;

/// One applied change, tagged with its position in the application order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateDiff {
    /// Monotonic sequence number, starting at 1 for each store.
    pub seq: u64,
    pub change: Change,
}

impl StateDiff {
    /// Returns `true` for the last diff a subscriber will ever see.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self.change, Change::Disconnected { .. })
    }
}

/// What changed as the result of one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Connected {
        room_name: String,
    },
    TrackStarted {
        track: Track,
        /// When the event was applied locally; the playback offset grows
        /// from here.
        observed_at: Instant,
    },
    TrackStopped {
        previous: Option<Track>,
    },
    UserJoined {
        user: User,
        /// `true` when the handle was already present (duplicate join).
        updated: bool,
    },
    UserLeft {
        user: User,
        /// `false` when the handle was unknown and nothing changed.
        was_present: bool,
    },
    ListenerCountChanged {
        previous: u64,
        current: u64,
    },
    RosterReplaced {
        users: Vec<User>,
    },
    Kicked {
        reason: Option<String>,
    },
    /// Terminal: the session's connection is gone.
    Disconnected {
        reason: DisconnectReason,
    },
}

/// Owns the room state for one session.
pub struct RoomStateStore {
    state: RwLock<RoomState>,
    seq: AtomicU64,
    subscribers: Mutex<Vec<mpsc::Sender<StateDiff>>>,
    channel_capacity: usize,
}

impl RoomStateStore {
    /// Creates an empty store whose subscriber channels hold
    /// `channel_capacity` diffs each.
    pub fn new(channel_capacity: usize) -> Self {
        Self {
            state: RwLock::new(RoomState::default()),
            seq: AtomicU64::new(0),
            subscribers: Mutex::new(Vec::new()),
            channel_capacity: channel_capacity.max(1),
        }
    }

    /// Returns an immutable copy of the current state.
    #[must_use]
    pub fn snapshot(&self) -> RoomState {
        self.state.read().clone()
    }

    /// Registers a new subscriber. It receives every diff published after
    /// this call, in order.
    pub fn subscribe(&self) -> DiffStream {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        self.subscribers.lock().push(tx);
        ReceiverStream::new(rx)
    }

    /// Applies one event atomically and returns the resulting diff.
    ///
    /// Rejected events leave the state untouched and do not consume a
    /// sequence number.
    pub fn apply(&self, event: RoomEvent) -> StoreResult<StateDiff> {
        let mut state = self.state.write();
        let change = Self::transition(&mut state, event)?;
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(StateDiff { seq, change })
    }

    /// Applies an event and delivers the diff to all subscribers.
    pub async fn apply_and_publish(&self, event: RoomEvent) -> StoreResult<StateDiff> {
        let diff = self.apply(event)?;
        self.publish(&diff).await;
        Ok(diff)
    }

    /// Delivers a diff to every live subscriber.
    ///
    /// Waits for channel capacity rather than dropping; subscribers whose
    /// receiver is gone are pruned.
    pub async fn publish(&self, diff: &StateDiff) {
        let senders: Vec<mpsc::Sender<StateDiff>> = self.subscribers.lock().clone();
        let mut closed = false;
        for tx in &senders {
            if tx.send(diff.clone()).await.is_err() {
                closed = true;
            }
        }
        if closed {
            self.subscribers.lock().retain(|tx| !tx.is_closed());
        }
    }

    /// Publishes the terminal `Disconnected` diff and closes every
    /// subscriber channel.
    pub async fn terminate(&self, reason: DisconnectReason) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let diff = StateDiff {
            seq,
            change: Change::Disconnected { reason },
        };
        self.publish(&diff).await;
        self.subscribers.lock().clear();
    }

    /// Number of subscribers that still hold a receiver.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }

    fn transition(state: &mut RoomState, event: RoomEvent) -> StoreResult<Change> {
        let change = match event {
            RoomEvent::Connected { room_name } => {
                state.room_name = room_name.clone();
                Change::Connected { room_name }
            }
            RoomEvent::TrackStarted(track) => {
                if track.started_at_offset_seconds > track.duration_seconds {
                    return Err(StoreError::InvalidState(format!(
                        "track \"{}\" starts at {}s but is only {}s long",
                        track.title, track.started_at_offset_seconds, track.duration_seconds
                    )));
                }
                state.current_track = Some(track.clone());
                Change::TrackStarted {
                    track,
                    observed_at: Instant::now(),
                }
            }
            RoomEvent::TrackStopped => Change::TrackStopped {
                previous: state.current_track.take(),
            },
            RoomEvent::UserJoined(user) => {
                let updated = state.users.insert(user.handle.clone(), user.clone()).is_some();
                Change::UserJoined { user, updated }
            }
            RoomEvent::UserLeft(user) => {
                let was_present = state.users.remove(&user.handle).is_some();
                Change::UserLeft { user, was_present }
            }
            RoomEvent::ListenerCountChanged { count } => {
                let current = u64::try_from(count).map_err(|_| {
                    StoreError::InvalidState(format!("negative listener count {count}"))
                })?;
                let previous = std::mem::replace(&mut state.listener_count, current);
                Change::ListenerCountChanged { previous, current }
            }
            RoomEvent::UserSnapshot(users) => {
                let roster: BTreeMap<String, User> = users
                    .into_iter()
                    .map(|user| (user.handle.clone(), user))
                    .collect();
                state.users = roster;
                Change::RosterReplaced {
                    users: state.users.values().cloned().collect(),
                }
            }
            RoomEvent::Kicked { reason } => {
                state.current_track = None;
                state.users.clear();
                state.listener_count = 0;
                Change::Kicked { reason }
            }
        };
        Ok(change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn drew() -> User {
        User::new("Drew Smith", "drew")
    }

    fn catherine() -> Track {
        Track {
            title: "Catherine".into(),
            artist: "Magic Man".into(),
            duration_seconds: 216,
            started_at_offset_seconds: 11,
            playing_user: Some(drew()),
            media_url: None,
        }
    }

    #[test]
    fn scenario_join_play_and_count() {
        let store = RoomStateStore::new(8);
        store.apply(RoomEvent::UserSnapshot(vec![])).unwrap();
        store.apply(RoomEvent::TrackStarted(catherine())).unwrap();
        store
            .apply(RoomEvent::ListenerCountChanged { count: 1 })
            .unwrap();

        let snapshot = store.snapshot();
        assert_eq!(
            snapshot.current_track.map(|t| t.title).as_deref(),
            Some("Catherine")
        );
        assert_eq!(snapshot.listener_count, 1);
        assert!(snapshot.users.is_empty());
    }

    #[test]
    fn duplicate_join_updates_instead_of_inserting() {
        let store = RoomStateStore::new(8);
        let first = store.apply(RoomEvent::UserJoined(drew())).unwrap();
        let renamed = User::new("Drew S.", "drew");
        let second = store.apply(RoomEvent::UserJoined(renamed)).unwrap();

        assert_eq!(
            first.change,
            Change::UserJoined {
                user: drew(),
                updated: false
            }
        );
        assert!(matches!(second.change, Change::UserJoined { updated: true, .. }));

        let snapshot = store.snapshot();
        assert_eq!(snapshot.users.len(), 1);
        assert_eq!(snapshot.users["drew"].display_name, "Drew S.");
    }

    #[test]
    fn leaving_absent_user_is_noop() {
        let store = RoomStateStore::new(8);
        store.apply(RoomEvent::UserJoined(drew())).unwrap();
        let before = store.snapshot();

        let diff = store
            .apply(RoomEvent::UserLeft(User::new("Ghost", "ghost")))
            .unwrap();

        assert!(matches!(diff.change, Change::UserLeft { was_present: false, .. }));
        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn negative_listener_count_is_rejected() {
        let store = RoomStateStore::new(8);
        store
            .apply(RoomEvent::ListenerCountChanged { count: 3 })
            .unwrap();

        let result = store.apply(RoomEvent::ListenerCountChanged { count: -1 });

        assert!(matches!(result, Err(StoreError::InvalidState(_))));
        assert_eq!(store.snapshot().listener_count, 3);
    }

    #[test]
    fn rejected_event_does_not_consume_sequence() {
        let store = RoomStateStore::new(8);
        let _ = store.apply(RoomEvent::ListenerCountChanged { count: -5 });
        let diff = store.apply(RoomEvent::TrackStopped).unwrap();
        assert_eq!(diff.seq, 1);
    }

    #[test]
    fn track_offset_beyond_duration_is_rejected() {
        let store = RoomStateStore::new(8);
        let mut track = catherine();
        track.started_at_offset_seconds = 300;

        let result = store.apply(RoomEvent::TrackStarted(track));

        assert!(matches!(result, Err(StoreError::InvalidState(_))));
        assert!(store.snapshot().current_track.is_none());
    }

    #[test]
    fn track_started_replaces_and_stopped_clears() {
        let store = RoomStateStore::new(8);
        store.apply(RoomEvent::TrackStarted(catherine())).unwrap();
        let mut next = catherine();
        next.title = "Paris".into();
        store.apply(RoomEvent::TrackStarted(next)).unwrap();
        assert_eq!(store.snapshot().current_track.unwrap().title, "Paris");

        let diff = store.apply(RoomEvent::TrackStopped).unwrap();
        match diff.change {
            Change::TrackStopped { previous } => assert_eq!(previous.unwrap().title, "Paris"),
            other => panic!("unexpected change: {other:?}"),
        }
        assert!(store.snapshot().current_track.is_none());
    }

    #[test]
    fn snapshot_replaces_roster() {
        let store = RoomStateStore::new(8);
        store.apply(RoomEvent::UserJoined(drew())).unwrap();
        store
            .apply(RoomEvent::UserSnapshot(vec![
                User::new("Ana", "ana"),
                User::new("Ben", "ben"),
                User::new("Ana Again", "ana"),
            ]))
            .unwrap();

        let snapshot = store.snapshot();
        let handles: Vec<&str> = snapshot.users().map(|u| u.handle.as_str()).collect();
        assert_eq!(handles, vec!["ana", "ben"]);
        assert!(!snapshot.has_user("drew"));
    }

    #[test]
    fn kick_clears_room() {
        let store = RoomStateStore::new(8);
        store.apply(RoomEvent::UserJoined(drew())).unwrap();
        store.apply(RoomEvent::TrackStarted(catherine())).unwrap();
        store
            .apply(RoomEvent::ListenerCountChanged { count: 4 })
            .unwrap();

        store
            .apply(RoomEvent::Kicked {
                reason: Some("spam".into()),
            })
            .unwrap();

        let snapshot = store.snapshot();
        assert!(snapshot.current_track.is_none());
        assert!(snapshot.users.is_empty());
        assert_eq!(snapshot.listener_count, 0);
    }

    #[test]
    fn valid_event_sequences_keep_invariants() {
        let store = RoomStateStore::new(8);
        let users: Vec<User> = (0..5)
            .map(|i| User::new(format!("User {i}"), format!("u{i}")))
            .collect();

        for step in 0..200u64 {
            let user = users[(step % 5) as usize].clone();
            let event = match step % 7 {
                0 => RoomEvent::UserJoined(user),
                1 => RoomEvent::UserLeft(user),
                2 => RoomEvent::ListenerCountChanged {
                    count: (step % 13) as i64,
                },
                3 => RoomEvent::TrackStarted(Track {
                    started_at_offset_seconds: step % 100,
                    ..catherine()
                }),
                4 => RoomEvent::TrackStopped,
                5 => RoomEvent::UserSnapshot(users[..(step % 5) as usize].to_vec()),
                _ => RoomEvent::UserJoined(user),
            };
            store.apply(event).expect("valid event rejected");

            let snapshot = store.snapshot();
            for (handle, user) in &snapshot.users {
                assert_eq!(handle, &user.handle);
            }
        }
    }

    #[tokio::test]
    async fn subscribers_receive_diffs_in_order() {
        let store = RoomStateStore::new(4);
        let mut first = store.subscribe();
        let mut second = store.subscribe();

        let events = vec![
            RoomEvent::Connected {
                room_name: "Lounge".into(),
            },
            RoomEvent::UserJoined(drew()),
            RoomEvent::ListenerCountChanged { count: 2 },
            RoomEvent::TrackStopped,
        ];
        let mut applied = Vec::new();
        for event in events {
            applied.push(store.apply_and_publish(event).await.unwrap());
        }

        for stream in [&mut first, &mut second] {
            for expected in &applied {
                assert_eq!(stream.next().await.as_ref(), Some(expected));
            }
        }
        let seqs: Vec<u64> = applied.iter().map(|d| d.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn terminate_sends_final_diff_and_closes_streams() {
        let store = RoomStateStore::new(4);
        let mut stream = store.subscribe();
        store.apply_and_publish(RoomEvent::TrackStopped).await.unwrap();

        store.terminate(DisconnectReason::ServerClosed).await;

        assert!(stream.next().await.is_some());
        let last = stream.next().await.unwrap();
        assert!(last.is_terminal());
        assert_eq!(
            last.change,
            Change::Disconnected {
                reason: DisconnectReason::ServerClosed
            }
        );
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let store = RoomStateStore::new(4);
        let kept = store.subscribe();
        drop(store.subscribe());

        store.apply_and_publish(RoomEvent::TrackStopped).await.unwrap();

        assert_eq!(store.subscriber_count(), 1);
        drop(kept);
    }
}
