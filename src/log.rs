//! Storage SPI and the in-memory reference log.
//!
//! Every bundled log shares one commit path ([`LogCore`]): a single mutex
//! guards the indexes, the subscriber table, and the journal, so
//! check-and-register in [`EventLog::subscribe_or_catch_up`] is atomic with
//! respect to appends. Subscribers are notified after the lock is released.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::clock::{Clock, SystemClock};
use crate::error::LogError;
use crate::event::{EncodedEvent, EventId, StoredEvent};
use crate::storage::FileEventLog;

/// Callback registered by [`EventLog::subscribe_or_catch_up`].
///
/// Invoked synchronously on the committing thread, after the commit and
/// outside the log's lock. Must not block for long.
pub type SubscriberFn = Arc<dyn Fn(&StoredEvent) + Send + Sync>;

/// Outcome of [`EventLog::subscribe_or_catch_up`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatchUp {
    /// Nothing matched at or after `since`; the callback is now registered.
    Subscribed,
    /// Matching history exists; nothing was registered. Contains at least
    /// every matching event stored exactly at `since`, ordered by
    /// `(stored_at, id)`.
    Replay(Vec<StoredEvent>),
}

/// Durable, ordered, append-only record of events per aggregate stream.
///
/// Commit timestamps are clock time, never decreasing, and shared by every
/// event of one batch. Several commits may share an instant; `(stored_at,
/// id)` is commit order. Once [`EventLog::now`] has returned an instant past
/// `t`, no later commit can add another event at `t`.
pub trait EventLog: Send + Sync + 'static {
    /// Events of one stream with `sequence > from_sequence`, in sequence
    /// order.
    ///
    /// # Errors
    ///
    /// Returns [`LogError`] if the backend cannot be read.
    fn read(
        &self,
        origin: &str,
        aggregate_id: &str,
        from_sequence: u64,
    ) -> Result<Vec<StoredEvent>, LogError>;

    /// Append one event with the next sequence of its stream.
    ///
    /// # Errors
    ///
    /// Returns [`LogError`] if the commit could not be made durable. Nothing
    /// is visible to readers or subscribers in that case.
    fn append(
        &self,
        origin: &str,
        aggregate_id: &str,
        event_type: &str,
        payload: String,
    ) -> Result<StoredEvent, LogError>;

    /// Append a batch atomically, possibly across several streams.
    ///
    /// Every event gets `cause_id`; `corr_id` defaults to each event's own
    /// id. Returns the number of events written.
    ///
    /// # Errors
    ///
    /// Returns [`LogError`] if the commit could not be made durable. No
    /// event of the batch is visible in that case.
    fn append_batch(
        &self,
        cause_id: Option<EventId>,
        corr_id: Option<EventId>,
        events: Vec<EncodedEvent>,
    ) -> Result<usize, LogError>;

    /// Atomically either register `callback` for future `(origin,
    /// event_type)` commits or hand back the history that must be replayed
    /// first.
    ///
    /// # Errors
    ///
    /// Returns [`LogError`] if the backend cannot be read.
    fn subscribe_or_catch_up(
        &self,
        origin: &str,
        event_type: &str,
        since: u64,
        callback: SubscriberFn,
    ) -> Result<CatchUp, LogError>;

    /// Remove a callback registered by
    /// [`subscribe_or_catch_up`](EventLog::subscribe_or_catch_up), matched by
    /// pointer. Returns `true` if it was registered.
    ///
    /// A commit that collected its deliveries before this call may still
    /// invoke the callback once.
    fn unsubscribe(&self, origin: &str, event_type: &str, callback: &SubscriberFn) -> bool;

    /// Current commit instant. No commit made after this call is stamped
    /// earlier than the returned value.
    fn now(&self) -> u64;
}

/// Builder for the bundled logs.
///
/// # Examples
///
/// ```
/// use eventpipe_es::{EventLog, LogBuilder, ManualClock};
///
/// let log = LogBuilder::new()
///     .clock(ManualClock::new(1_000))
///     .replay_limit(500)
///     .memory();
/// let stored = log.append("rabbit", "r1", "added", "{}".into()).unwrap();
/// assert_eq!(stored.stored_at, 1_000);
/// ```
#[derive(Clone)]
pub struct LogBuilder {
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) replay_limit: Option<usize>,
    pub(crate) sync_writes: bool,
}

impl LogBuilder {
    /// System clock, unbounded replays, no `fsync`.
    pub fn new() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            replay_limit: None,
            sync_writes: false,
        }
    }

    /// Source of commit timestamps.
    pub fn clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Cap on events returned by one catch-up replay. The first instant of a
    /// replay is never split, so a small limit still makes progress.
    pub fn replay_limit(mut self, limit: usize) -> Self {
        self.replay_limit = Some(limit.max(1));
        self
    }

    /// `fsync` the journal after every commit. File logs only.
    pub fn sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    /// Build an in-memory log.
    pub fn memory(self) -> MemoryEventLog {
        MemoryEventLog {
            core: LogCore::new(LogIndex::default(), NoJournal, &self),
        }
    }

    /// Open (or create) a file-backed log in `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`LogError`] if the journal cannot be opened or is corrupt.
    pub fn open_file(self, dir: impl AsRef<Path>) -> Result<FileEventLog, LogError> {
        FileEventLog::open_with(dir.as_ref(), &self)
    }
}

impl Default for LogBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LogBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogBuilder")
            .field("replay_limit", &self.replay_limit)
            .field("sync_writes", &self.sync_writes)
            .finish_non_exhaustive()
    }
}

/// Persistence hook invoked under the log lock before a commit is applied.
pub(crate) trait Journal: Send + 'static {
    fn persist(&mut self, batch: &[StoredEvent]) -> Result<(), LogError>;
}

/// Journal of the in-memory log.
pub(crate) struct NoJournal;

impl Journal for NoJournal {
    fn persist(&mut self, _batch: &[StoredEvent]) -> Result<(), LogError> {
        Ok(())
    }
}

type StreamKey = (String, String);

/// Committed events plus lookup indexes. Events are kept in commit order,
/// which is also `(stored_at, id)` order.
#[derive(Default)]
pub(crate) struct LogIndex {
    events: Vec<StoredEvent>,
    streams: HashMap<StreamKey, Vec<usize>>,
    by_type: HashMap<StreamKey, Vec<usize>>,
    last_id: u64,
    last_stored_at: u64,
}

impl LogIndex {
    fn stream_len(&self, origin: &str, aggregate_id: &str) -> u64 {
        self.streams
            .get(&(origin.to_owned(), aggregate_id.to_owned()))
            .map_or(0, |idx| idx.len() as u64)
    }

    /// Apply an already-committed batch. Used by commits and journal replay.
    ///
    /// # Errors
    ///
    /// Returns a description of the first record that breaks the id,
    /// timestamp, or sequence invariants.
    pub(crate) fn apply(&mut self, batch: &[StoredEvent]) -> Result<(), String> {
        for event in batch {
            if event.id.get() <= self.last_id {
                return Err(format!("event id {} is not increasing", event.id));
            }
            if event.stored_at < self.last_stored_at {
                return Err(format!("event {} goes back in time", event.id));
            }
            let expected = self.stream_len(&event.origin, &event.aggregate_id) + 1;
            if event.sequence != expected {
                return Err(format!(
                    "event {} has sequence {} on {}, expected {expected}",
                    event.id,
                    event.sequence,
                    event.stream_key()
                ));
            }

            let pos = self.events.len();
            self.streams
                .entry((event.origin.clone(), event.aggregate_id.clone()))
                .or_default()
                .push(pos);
            self.by_type
                .entry((event.origin.clone(), event.event_type.clone()))
                .or_default()
                .push(pos);
            self.last_id = event.id.get();
            self.last_stored_at = event.stored_at;
            self.events.push(event.clone());
        }
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.events.len()
    }
}

struct LogState<J> {
    index: LogIndex,
    subscribers: HashMap<StreamKey, Vec<SubscriberFn>>,
    journal: J,
    /// Highest instant promised by [`LogCore::now`]; commits never go below it.
    horizon: u64,
}

/// Commit path shared by [`MemoryEventLog`] and [`FileEventLog`].
pub(crate) struct LogCore<J> {
    state: Mutex<LogState<J>>,
    clock: Arc<dyn Clock>,
    replay_limit: Option<usize>,
}

impl<J: Journal> LogCore<J> {
    pub(crate) fn new(index: LogIndex, journal: J, builder: &LogBuilder) -> Self {
        let horizon = index.last_stored_at;
        Self {
            state: Mutex::new(LogState {
                index,
                subscribers: HashMap::new(),
                journal,
                horizon,
            }),
            clock: Arc::clone(&builder.clock),
            replay_limit: builder.replay_limit,
        }
    }

    // Subscriber panics are caught outside the lock, so poisoning can only
    // come from a panic inside this module; the indexes are still consistent.
    fn lock(&self) -> MutexGuard<'_, LogState<J>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().index.len()
    }

    // The clock may step backwards; stamps never do.
    fn stamp(&self, state: &LogState<J>) -> u64 {
        self.clock
            .now_millis()
            .max(state.index.last_stored_at)
            .max(state.horizon)
    }

    pub(crate) fn now(&self) -> u64 {
        let mut state = self.lock();
        let now = self.stamp(&state);
        state.horizon = now;
        now
    }

    pub(crate) fn read(&self, origin: &str, aggregate_id: &str, from_sequence: u64) -> Vec<StoredEvent> {
        let state = self.lock();
        let key = (origin.to_owned(), aggregate_id.to_owned());
        let Some(positions) = state.index.streams.get(&key) else {
            return Vec::new();
        };
        // Position i holds sequence i + 1.
        let start = usize::try_from(from_sequence).unwrap_or(usize::MAX);
        positions
            .iter()
            .skip(start)
            .map(|&pos| state.index.events[pos].clone())
            .collect()
    }

    pub(crate) fn commit(
        &self,
        cause_id: Option<EventId>,
        corr_id: Option<EventId>,
        events: Vec<EncodedEvent>,
    ) -> Result<Vec<StoredEvent>, LogError> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let (records, deliveries) = {
            let mut state = self.lock();
            let stored_at = self.stamp(&state);

            let mut sequences: HashMap<StreamKey, u64> = HashMap::new();
            let mut records = Vec::with_capacity(events.len());
            let mut next_id = state.index.last_id;
            for event in events {
                next_id += 1;
                let id = EventId::new(next_id);
                let key = (event.origin, event.aggregate_id);
                let sequence = sequences
                    .entry(key.clone())
                    .or_insert_with(|| state.index.stream_len(&key.0, &key.1));
                *sequence += 1;
                records.push(StoredEvent {
                    id,
                    sequence: *sequence,
                    origin: key.0,
                    aggregate_id: key.1,
                    event_type: event.event_type,
                    payload: event.payload,
                    cause_id,
                    corr_id: corr_id.unwrap_or(id),
                    stored_at,
                });
            }

            state.journal.persist(&records)?;
            state
                .index
                .apply(&records)
                .map_err(|reason| LogError::Corrupt {
                    line: 0,
                    reason,
                })?;

            let mut deliveries: Vec<(SubscriberFn, usize)> = Vec::new();
            for (i, record) in records.iter().enumerate() {
                let key = (record.origin.clone(), record.event_type.clone());
                if let Some(subs) = state.subscribers.get(&key) {
                    deliveries.extend(subs.iter().map(|cb| (Arc::clone(cb), i)));
                }
            }
            (records, deliveries)
        };

        tracing::trace!(count = records.len(), "committed batch");
        for (callback, i) in deliveries {
            let event = &records[i];
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                tracing::error!(
                    origin = %event.origin,
                    event_type = %event.event_type,
                    event_id = %event.id,
                    "subscriber panicked; commit unaffected"
                );
            }
        }
        Ok(records)
    }

    pub(crate) fn subscribe_or_catch_up(
        &self,
        origin: &str,
        event_type: &str,
        since: u64,
        callback: SubscriberFn,
    ) -> CatchUp {
        let mut guard = self.lock();
        let state = &mut *guard;
        let key = (origin.to_owned(), event_type.to_owned());
        let positions = state.index.by_type.get(&key).map(Vec::as_slice).unwrap_or_default();
        let events = &state.index.events;
        let start = positions.partition_point(|&pos| events[pos].stored_at < since);
        let pending = &positions[start..];

        if pending.is_empty() {
            state.subscribers.entry(key).or_default().push(callback);
            tracing::debug!(origin, event_type, since, "subscriber registered");
            return CatchUp::Subscribed;
        }

        let take = match self.replay_limit {
            Some(limit) => {
                let first_instant = events[pending[0]].stored_at;
                let head = pending
                    .iter()
                    .take_while(|&&pos| events[pos].stored_at == first_instant)
                    .count();
                limit.max(head).min(pending.len())
            }
            None => pending.len(),
        };
        let replay: Vec<StoredEvent> = pending[..take].iter().map(|&pos| events[pos].clone()).collect();
        tracing::debug!(origin, event_type, since, count = replay.len(), "replay required");
        CatchUp::Replay(replay)
    }
}

impl<J> LogCore<J> {
    pub(crate) fn unsubscribe(&self, origin: &str, event_type: &str, callback: &SubscriberFn) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (origin.to_owned(), event_type.to_owned());
        let Some(subs) = state.subscribers.get_mut(&key) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|cb| !Arc::ptr_eq(cb, callback));
        let removed = subs.len() < before;
        if subs.is_empty() {
            state.subscribers.remove(&key);
        }
        if removed {
            tracing::debug!(origin, event_type, "subscriber removed");
        }
        removed
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.subscribers.values().map(Vec::len).sum()
    }
}

/// In-process [`EventLog`]. Nothing survives the process.
///
/// Built with [`MemoryEventLog::new`] or [`LogBuilder::memory`].
pub struct MemoryEventLog {
    core: LogCore<NoJournal>,
}

impl MemoryEventLog {
    /// Empty log on the system clock.
    pub fn new() -> Self {
        LogBuilder::new().memory()
    }

    /// Total number of committed events across all streams.
    pub fn len(&self) -> usize {
        self.core.len()
    }

    /// Returns `true` if nothing has been committed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryEventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryEventLog")
            .field("events", &self.len())
            .finish()
    }
}

impl EventLog for MemoryEventLog {
    fn read(
        &self,
        origin: &str,
        aggregate_id: &str,
        from_sequence: u64,
    ) -> Result<Vec<StoredEvent>, LogError> {
        Ok(self.core.read(origin, aggregate_id, from_sequence))
    }

    fn append(
        &self,
        origin: &str,
        aggregate_id: &str,
        event_type: &str,
        payload: String,
    ) -> Result<StoredEvent, LogError> {
        let event = EncodedEvent::new(origin, aggregate_id, event_type, payload);
        let mut committed = self.core.commit(None, None, vec![event])?;
        committed.pop().ok_or_else(|| LogError::Corrupt {
            line: 0,
            reason: "single-event commit returned nothing".to_owned(),
        })
    }

    fn append_batch(
        &self,
        cause_id: Option<EventId>,
        corr_id: Option<EventId>,
        events: Vec<EncodedEvent>,
    ) -> Result<usize, LogError> {
        Ok(self.core.commit(cause_id, corr_id, events)?.len())
    }

    fn subscribe_or_catch_up(
        &self,
        origin: &str,
        event_type: &str,
        since: u64,
        callback: SubscriberFn,
    ) -> Result<CatchUp, LogError> {
        Ok(self.core.subscribe_or_catch_up(origin, event_type, since, callback))
    }

    fn unsubscribe(&self, origin: &str, event_type: &str, callback: &SubscriberFn) -> bool {
        self.core.unsubscribe(origin, event_type, callback)
    }

    fn now(&self) -> u64 {
        self.core.now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn log_at(millis: u64) -> (MemoryEventLog, ManualClock) {
        let clock = ManualClock::new(millis);
        (LogBuilder::new().clock(clock.clone()).memory(), clock)
    }

    fn noop() -> SubscriberFn {
        Arc::new(|_| {})
    }

    fn counter() -> (SubscriberFn, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        let cb: SubscriberFn = Arc::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (cb, hits)
    }

    #[test]
    fn append_assigns_sequence_id_and_timestamp() {
        let (log, _clock) = log_at(1_000);
        let first = log.append("rabbit", "r1", "added", "{}".into()).unwrap();
        let second = log.append("rabbit", "r1", "name_updated", "{}".into()).unwrap();
        let other = log.append("rabbit", "r2", "added", "{}".into()).unwrap();

        assert_eq!((first.sequence, second.sequence, other.sequence), (1, 2, 1));
        assert!(first.id < second.id && second.id < other.id);
        assert_eq!(first.corr_id, first.id);
        assert!(first.cause_id.is_none());
        // Clock is frozen; commits share the instant and ids break the tie.
        assert_eq!(first.stored_at, 1_000);
        assert_eq!(second.stored_at, 1_000);
        assert_eq!(other.stored_at, 1_000);
    }

    #[test]
    fn stamps_follow_the_clock_under_load() {
        let (log, clock) = log_at(5_000);
        for _ in 0..10_000 {
            log.append("A", "1", "X", "{}".into()).unwrap();
        }
        let last = log.read("A", "1", 9_999).unwrap();
        assert_eq!(last[0].stored_at, 5_000);
        assert_eq!(log.now(), 5_000);

        clock.advance(Duration::from_millis(3));
        assert_eq!(log.append("A", "1", "X", "{}".into()).unwrap().stored_at, 5_003);
    }

    #[test]
    fn stamps_never_go_back_with_the_clock() {
        let (log, clock) = log_at(5_000);
        log.append("A", "1", "X", "{}".into()).unwrap();
        clock.set(4_000);
        assert_eq!(log.now(), 5_000);
        assert_eq!(log.append("A", "1", "X", "{}".into()).unwrap().stored_at, 5_000);

        // An instant handed out by `now` is a floor for later commits.
        clock.set(6_000);
        assert_eq!(log.now(), 6_000);
        clock.set(5_500);
        assert_eq!(log.append("A", "1", "X", "{}".into()).unwrap().stored_at, 6_000);
    }

    #[test]
    fn read_is_exclusive_of_from_sequence() {
        let (log, _clock) = log_at(0);
        for _ in 0..5 {
            log.append("rabbit", "r1", "added", "{}".into()).unwrap();
        }
        let tail = log.read("rabbit", "r1", 3).unwrap();
        let seqs: Vec<u64> = tail.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![4, 5]);
        assert!(log.read("rabbit", "missing", 0).unwrap().is_empty());
        assert!(log.read("rabbit", "r1", 99).unwrap().is_empty());
    }

    #[test]
    fn batch_shares_timestamp_cause_and_spans_streams() {
        let (log, _clock) = log_at(50);
        let cause = log.append("rabbit", "r1", "added", "{}".into()).unwrap();
        let written = log
            .append_batch(
                Some(cause.id),
                Some(cause.corr_id),
                vec![
                    EncodedEvent::new("rabbits", "0000", "even", "null"),
                    EncodedEvent::new("handlers", "counter", "handled", "null"),
                    EncodedEvent::new("rabbits", "0000", "even", "null"),
                ],
            )
            .unwrap();
        assert_eq!(written, 3);

        let singleton = log.read("rabbits", "0000", 0).unwrap();
        let marker = log.read("handlers", "counter", 0).unwrap();
        assert_eq!(singleton.len(), 2);
        assert_eq!(singleton[1].sequence, 2);
        assert_eq!(marker[0].cause_id, Some(cause.id));
        assert_eq!(marker[0].corr_id, cause.corr_id);
        assert_eq!(singleton[0].stored_at, marker[0].stored_at);
        assert!(singleton[0].id > cause.id);
    }

    #[test]
    fn empty_batch_writes_nothing() {
        let (log, _clock) = log_at(0);
        assert_eq!(log.append_batch(None, None, Vec::new()).unwrap(), 0);
        assert!(log.is_empty());
    }

    #[test]
    fn subscribe_registers_when_nothing_since() {
        let (log, clock) = log_at(1_000);
        log.append("A", "1", "X", "{}".into()).unwrap();
        clock.advance(Duration::from_secs(1));

        let (cb, hits) = counter();
        let outcome = log.subscribe_or_catch_up("A", "X", 1_001, cb).unwrap();
        assert_eq!(outcome, CatchUp::Subscribed);

        log.append("A", "1", "X", "{}".into()).unwrap();
        log.append("A", "1", "Y", "{}".into()).unwrap();
        log.append("B", "1", "X", "{}".into()).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscribe_replays_event_at_since_without_registering() {
        let (log, _clock) = log_at(2_000);
        let stored = log.append("A", "1", "X", "{}".into()).unwrap();

        let (cb, hits) = counter();
        match log.subscribe_or_catch_up("A", "X", stored.stored_at, cb).unwrap() {
            CatchUp::Replay(events) => {
                assert_eq!(events.len(), 1);
                assert_eq!(events[0].id, stored.id);
            }
            CatchUp::Subscribed => panic!("expected replay"),
        }
        log.append("A", "1", "X", "{}".into()).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0, "nothing must be registered");
    }

    #[test]
    fn replay_limit_never_splits_first_instant() {
        let clock = ManualClock::new(10);
        let builder = LogBuilder::new().clock(clock.clone()).replay_limit(2);
        let log = LogCore::new(LogIndex::default(), NoJournal, &builder);
        log.commit(
            None,
            None,
            (0..4).map(|_| EncodedEvent::new("A", "1", "X", "{}")).collect(),
        )
        .unwrap();
        clock.set(20);
        log.commit(None, None, vec![EncodedEvent::new("A", "1", "X", "{}")])
            .unwrap();
        log.commit(None, None, vec![EncodedEvent::new("A", "1", "X", "{}")])
            .unwrap();

        match log.subscribe_or_catch_up("A", "X", 0, noop()) {
            CatchUp::Replay(events) => {
                assert_eq!(events.len(), 4);
                assert!(events.iter().all(|e| e.stored_at == 10));
            }
            CatchUp::Subscribed => panic!("expected replay"),
        }
        match log.subscribe_or_catch_up("A", "X", 11, noop()) {
            CatchUp::Replay(events) => {
                let stamps: Vec<u64> = events.iter().map(|e| e.stored_at).collect();
                assert_eq!(stamps, vec![20, 20]);
            }
            CatchUp::Subscribed => panic!("expected replay"),
        }
    }

    #[test]
    fn unsubscribe_removes_only_that_callback() {
        let (log, _clock) = log_at(0);
        let (first, first_hits) = counter();
        let (second, second_hits) = counter();
        log.subscribe_or_catch_up("A", "X", 0, Arc::clone(&first)).unwrap();
        log.subscribe_or_catch_up("A", "X", 0, second).unwrap();
        assert_eq!(log.core.subscriber_count(), 2);

        assert!(log.unsubscribe("A", "X", &first));
        assert!(!log.unsubscribe("A", "X", &first), "already removed");
        assert!(!log.unsubscribe("A", "Y", &first));
        log.append("A", "1", "X", "{}".into()).unwrap();

        assert_eq!(first_hits.load(Ordering::SeqCst), 0);
        assert_eq!(second_hits.load(Ordering::SeqCst), 1);
        assert_eq!(log.core.subscriber_count(), 1);
    }

    #[test]
    fn panicking_subscriber_does_not_abort_commit() {
        let (log, _clock) = log_at(0);
        log.subscribe_or_catch_up("A", "X", 0, Arc::new(|_| panic!("boom")))
            .unwrap();
        let (cb, hits) = counter();
        log.subscribe_or_catch_up("A", "X", 0, cb).unwrap();

        let stored = log.append("A", "1", "X", "{}".into()).unwrap();
        assert_eq!(stored.sequence, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(log.read("A", "1", 0).unwrap().len(), 1);
    }

    #[test]
    fn subscriber_may_read_the_log_reentrantly() {
        let (log, _clock) = log_at(0);
        let log = Arc::new(log);
        let observed = Arc::new(StdMutex::new(Vec::new()));
        let (inner_log, inner_obs) = (Arc::clone(&log), Arc::clone(&observed));
        log.subscribe_or_catch_up(
            "A",
            "X",
            0,
            Arc::new(move |event| {
                let len = inner_log.read("A", "1", 0).unwrap().len();
                inner_obs.lock().unwrap().push((event.sequence, len));
            }),
        )
        .unwrap();

        log.append("A", "1", "X", "{}".into()).unwrap();
        log.append("A", "1", "X", "{}".into()).unwrap();
        assert_eq!(*observed.lock().unwrap(), vec![(1, 1), (2, 2)]);
    }

    #[test]
    fn concurrent_writers_keep_streams_gapless() {
        let log = Arc::new(MemoryEventLog::new());
        let (cb, hits) = counter();
        log.subscribe_or_catch_up("A", "X", u64::MAX, cb).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        log.append("B", &format!("b{t}"), "Y", "{}".into()).unwrap();
                    }
                })
            })
            .collect();
        for _ in 0..50 {
            log.append("A", "1", "X", "{}".into()).unwrap();
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let seqs: Vec<u64> = log.read("A", "1", 0).unwrap().iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, (1..=50).collect::<Vec<_>>());
        for t in 0..4 {
            assert_eq!(log.read("B", &format!("b{t}"), 0).unwrap().len(), 50);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 50);
        assert_eq!(log.len(), 250);
    }

    #[test]
    fn index_rejects_sequence_gap() {
        let mut index = LogIndex::default();
        let event = StoredEvent {
            id: EventId::new(1),
            sequence: 2,
            origin: "A".into(),
            aggregate_id: "1".into(),
            event_type: "X".into(),
            payload: "{}".into(),
            cause_id: None,
            corr_id: EventId::new(1),
            stored_at: 5,
        };
        let err = index.apply(&[event]).unwrap_err();
        assert!(err.contains("expected 1"), "got: {err}");
    }
}
