//! Aggregates, their replay wrapper, and the repository that loads them.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Serialize, de::DeserializeOwned};

use crate::dispatcher::Dispatcher;
use crate::error::{ApplyError, RepositoryError};
use crate::event::{DynPayload, StoredEvent, TypedEvent};
use crate::handler::HandlerRegistry;
use crate::snapshot::{self, Snapshot};

/// Id under which every [`SingletonAggregate`] lives.
pub const SINGLETON_ID: &str = "0000";

/// In-memory projection of one entity, rebuilt from its event stream.
///
/// State changes only through the functions registered in a
/// [`HandlerRegistry`]; nothing writes aggregate state to the log.
pub trait Aggregate: Send + Sync + 'static {
    /// Origin (stream kind) of this aggregate, e.g. `"rabbit"`.
    const ORIGIN: &'static str;

    /// Fresh state for instance `id`, before any event is applied.
    fn create(id: &str) -> Self;
}

/// An aggregate with exactly one instance, stored at [`SINGLETON_ID`].
pub trait SingletonAggregate: Aggregate {}

/// Aggregate state plus the replay position it reflects.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRoot<A> {
    id: String,
    last_applied_sequence: Option<u64>,
    state: A,
}

impl<A: Aggregate> AggregateRoot<A> {
    /// A root for `id` with nothing applied.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let state = A::create(&id);
        Self {
            id,
            last_applied_sequence: None,
            state,
        }
    }

    /// The root of a singleton aggregate.
    pub fn singleton() -> Self
    where
        A: SingletonAggregate,
    {
        Self::new(SINGLETON_ID)
    }

    /// Resume from a snapshot.
    pub fn from_snapshot(id: impl Into<String>, snapshot: Snapshot<A>) -> Self {
        Self {
            id: id.into(),
            last_applied_sequence: snapshot.last_applied_sequence,
            state: snapshot.state,
        }
    }

    /// Instance id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Sequence of the last event applied, `None` before the first.
    pub fn last_applied_sequence(&self) -> Option<u64> {
        self.last_applied_sequence
    }

    /// Current state.
    pub fn state(&self) -> &A {
        &self.state
    }

    /// Consume the root and keep the state.
    pub fn into_state(self) -> A {
        self.state
    }

    /// Fold one event into the state.
    ///
    /// Events at or below [`last_applied_sequence`](Self::last_applied_sequence)
    /// are skipped, which makes re-applying a replay idempotent. Events with
    /// no registered handler still advance the sequence.
    ///
    /// # Returns
    ///
    /// `Ok(true)` if the event advanced the root, `Ok(false)` if it was
    /// already applied.
    ///
    /// # Errors
    ///
    /// Returns [`ApplyError::StreamMismatch`] if the event belongs to another
    /// stream, or [`ApplyError::PayloadShape`] if its payload is not what the
    /// handler expects.
    pub fn apply(
        &mut self,
        handlers: &HandlerRegistry<A>,
        event: &TypedEvent<DynPayload>,
    ) -> Result<bool, ApplyError> {
        if !self.is_pending(&event.meta)? {
            return Ok(false);
        }
        handlers.dispatch(&mut self.state, event)?;
        self.last_applied_sequence = Some(event.meta.sequence);
        Ok(true)
    }

    /// Advance past an event the aggregate has no handler for, without
    /// decoding it. Same return and errors as [`apply`](Self::apply).
    pub(crate) fn skip(&mut self, meta: &StoredEvent) -> Result<bool, ApplyError> {
        if !self.is_pending(meta)? {
            return Ok(false);
        }
        self.last_applied_sequence = Some(meta.sequence);
        Ok(true)
    }

    fn is_pending(&self, meta: &StoredEvent) -> Result<bool, ApplyError> {
        if meta.origin != A::ORIGIN || meta.aggregate_id != self.id {
            return Err(ApplyError::StreamMismatch {
                expected: format!("{}/{}", A::ORIGIN, self.id),
                found: meta.stream_key(),
            });
        }
        Ok(self
            .last_applied_sequence
            .is_none_or(|last| meta.sequence > last))
    }

    /// Snapshot of the current state and position.
    pub fn to_snapshot(&self) -> Snapshot<A>
    where
        A: Clone,
    {
        Snapshot {
            state: self.state.clone(),
            last_applied_sequence: self.last_applied_sequence,
        }
    }
}

/// Loads aggregates of kind `A` by replaying their streams.
///
/// `Clone` is cheap: the handler registry is shared.
pub struct Repository<A> {
    dispatcher: Dispatcher,
    handlers: Arc<HandlerRegistry<A>>,
}

impl<A> Clone for Repository<A> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: self.dispatcher.clone(),
            handlers: Arc::clone(&self.handlers),
        }
    }
}

impl<A> fmt::Debug for Repository<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("handlers", &self.handlers)
            .finish_non_exhaustive()
    }
}

impl<A: Aggregate> Repository<A> {
    /// Repository reading through `dispatcher` and folding with `handlers`.
    pub fn new(dispatcher: Dispatcher, handlers: HandlerRegistry<A>) -> Self {
        Self {
            dispatcher,
            handlers: Arc::new(handlers),
        }
    }

    /// The handler registry.
    pub fn handlers(&self) -> &HandlerRegistry<A> {
        &self.handlers
    }

    /// Replay the full stream of `id`.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError`] if reading, decoding, or applying fails.
    pub fn load(&self, id: &str) -> Result<AggregateRoot<A>, RepositoryError> {
        let mut root = AggregateRoot::new(id);
        self.refresh(&mut root)?;
        Ok(root)
    }

    /// Load the singleton instance.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError`] if reading, decoding, or applying fails.
    pub fn load_singleton(&self) -> Result<AggregateRoot<A>, RepositoryError>
    where
        A: SingletonAggregate,
    {
        self.load(SINGLETON_ID)
    }

    /// Apply every event committed after the root's last applied sequence.
    ///
    /// Events of types the handlers do not cover are stepped over: they are
    /// never decoded, but they still advance the root's sequence.
    ///
    /// # Returns
    ///
    /// The number of events applied by a handler.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError`] if reading, decoding, or applying fails.
    /// Events applied before the failure stay applied.
    pub fn refresh(&self, root: &mut AggregateRoot<A>) -> Result<usize, RepositoryError> {
        let from = root.last_applied_sequence.unwrap_or(0);
        let events = self.dispatcher.read(A::ORIGIN, &root.id, from)?;
        let types = self.handlers.types();
        let (mut applied, mut ignored) = (0, 0);
        for event in events {
            let Some(shape) = types.resolve(&event.event_type) else {
                tracing::debug!(
                    origin = A::ORIGIN,
                    aggregate_id = %root.id,
                    event_type = %event.event_type,
                    sequence = event.sequence,
                    "no handler for event type; stepping over"
                );
                if root.skip(&event)? {
                    ignored += 1;
                }
                continue;
            };
            let typed = self.dispatcher.decode_shape(event, shape)?;
            if root.apply(&self.handlers, &typed)? {
                applied += 1;
            }
        }
        if applied + ignored > 0 {
            tracing::debug!(
                origin = A::ORIGIN,
                aggregate_id = %root.id,
                applied,
                ignored,
                sequence = ?root.last_applied_sequence,
                "aggregate refreshed"
            );
        }
        Ok(applied)
    }

    /// Load `id` starting from the snapshot in `base_dir`, if one exists.
    ///
    /// A missing or corrupt snapshot falls back to a full replay.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError`] if the snapshot cannot be read for an
    /// I/O reason, or if replay fails.
    pub fn load_cached(&self, base_dir: &Path, id: &str) -> Result<AggregateRoot<A>, RepositoryError>
    where
        A: DeserializeOwned,
    {
        let mut root = match snapshot::load_snapshot::<A>(base_dir, id)? {
            Some(snap) => AggregateRoot::from_snapshot(id, snap),
            None => AggregateRoot::new(id),
        };
        self.refresh(&mut root)?;
        Ok(root)
    }

    /// Write `root` to the snapshot cache in `base_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Snapshot`] if the write fails.
    pub fn save_snapshot(&self, base_dir: &Path, root: &AggregateRoot<A>) -> Result<(), RepositoryError>
    where
        A: Clone + Serialize,
    {
        snapshot::save_snapshot::<A>(base_dir, &root.id, &root.to_snapshot())?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::{Aggregate, SingletonAggregate};
    use crate::codec::{Codec, JsonCodec};
    use crate::error::CodecError;
    use crate::event::EventType;
    use crate::handler::HandlerRegistry;
    use crate::types::TypeRegistry;
    use serde::{Deserialize, Serialize};
    use serde_json::Value;

    /// A rabbit known by name.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub(crate) struct Rabbit {
        pub name: String,
        pub removed: bool,
        pub initialized: bool,
    }

    impl Aggregate for Rabbit {
        const ORIGIN: &'static str = "rabbit";

        fn create(_id: &str) -> Self {
            Rabbit::default()
        }
    }

    /// Singleton tracking every even rabbit count seen.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub(crate) struct Rabbits {
        pub even_counts: Vec<u64>,
    }

    impl Aggregate for Rabbits {
        const ORIGIN: &'static str = "rabbits";

        fn create(_id: &str) -> Self {
            Rabbits::default()
        }
    }

    impl SingletonAggregate for Rabbits {}

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub(crate) struct RabbitAdded {
        pub name: String,
    }

    impl EventType for RabbitAdded {
        const EVENT_TYPE: &'static str = "added";
        const ORIGIN: &'static str = "rabbit";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub(crate) struct RabbitNameUpdated {
        pub name: String,
    }

    impl EventType for RabbitNameUpdated {
        const EVENT_TYPE: &'static str = "name_updated";
        const ORIGIN: &'static str = "rabbit";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub(crate) struct RabbitRemoved {}

    impl EventType for RabbitRemoved {
        const EVENT_TYPE: &'static str = "removed";
        const ORIGIN: &'static str = "rabbit";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub(crate) struct RabbitNumberIsEven {
        pub count: u64,
    }

    impl EventType for RabbitNumberIsEven {
        const EVENT_TYPE: &'static str = "number_is_even";
        const ORIGIN: &'static str = "rabbits";
    }

    pub(crate) fn rabbit_handlers() -> HandlerRegistry<Rabbit> {
        HandlerRegistry::<Rabbit>::builder()
            .on::<RabbitAdded, _>(|rabbit, _, added| rabbit.name = added.name.clone())
            .on::<RabbitNameUpdated, _>(|rabbit, _, updated| rabbit.name = updated.name.clone())
            .on::<RabbitRemoved, _>(|rabbit, _, _| rabbit.removed = true)
            .on_marker("init", |rabbit, _| rabbit.initialized = true)
            .build()
            .expect("rabbit handlers are unambiguous")
    }

    pub(crate) fn rabbits_handlers() -> HandlerRegistry<Rabbits> {
        HandlerRegistry::<Rabbits>::builder()
            .on::<RabbitNumberIsEven, _>(|rabbits, _, even| rabbits.even_counts.push(even.count))
            .build()
            .expect("rabbits handlers are unambiguous")
    }

    pub(crate) fn rabbit_types() -> TypeRegistry {
        rabbit_handlers().types().clone()
    }

    /// JSON codec that refuses any payload mentioning "poison".
    pub(crate) struct PoisonCodec;

    impl Codec for PoisonCodec {
        fn name(&self) -> &'static str {
            "poison"
        }

        fn encode(&self, value: &Value) -> Result<String, CodecError> {
            let encoded = JsonCodec.encode(value)?;
            if encoded.contains("poison") {
                return Err(CodecError::Rejected("poisoned payload".into()));
            }
            Ok(encoded)
        }

        fn decode(&self, encoded: &str) -> Result<Value, CodecError> {
            JsonCodec.decode(encoded)
        }
    }
}
