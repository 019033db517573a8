//! Event log, typed dispatcher, and catch-up/live processing pipelines for
//! event-sourced aggregates.
//!
//! The layers, leaf first:
//!
//! - [`EventLog`]: append-only, per-stream ordered storage with an atomic
//!   subscribe-or-catch-up primitive ([`MemoryEventLog`], [`FileEventLog`]).
//! - [`Dispatcher`]: encodes outgoing payloads with a [`Codec`] and decodes
//!   incoming ones against a [`TypeRegistry`] or an [`EventType`].
//! - [`Repository`]: rebuilds [`AggregateRoot`]s by replaying their streams
//!   through a [`HandlerRegistry`].
//! - [`Pipeline`]: replays recent history into an [`EventHandler`], then
//!   follows live commits, writing derived events and a `handled` marker in
//!   one batch per processed event.

mod aggregate;
mod clock;
mod codec;
mod dispatcher;
mod error;
mod event;
mod handler;
mod log;
mod pipeline;
mod snapshot;
mod storage;
mod types;
mod worker;

pub use aggregate::{Aggregate, AggregateRoot, Repository, SINGLETON_ID, SingletonAggregate};
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{Codec, JsonCodec};
pub use dispatcher::{Dispatcher, LiveSubscription, TypedCatchUp};
pub use error::{
    ApplyError, CodecError, DispatchError, LogError, PipelineError, RegistryError,
    RepositoryError,
};
pub use event::{
    DynPayload, EncodedEvent, EventId, EventType, PendingEvent, PendingPayload, StoredEvent,
    TypedEvent,
};
pub use handler::{HandlerRegistry, HandlerRegistryBuilder};
pub use log::{CatchUp, EventLog, LogBuilder, MemoryEventLog, SubscriberFn};
pub use pipeline::{
    EventHandler, HANDLED_EVENT_TYPE, HANDLERS_ORIGIN, Pipeline, PipelineBuilder, PipelineConfig,
    PipelineHandle, PipelineState,
};
pub use snapshot::{Snapshot, load_snapshot, save_snapshot, snapshot_path};
pub use storage::{FileEventLog, JOURNAL_FILE};
pub use types::{PayloadShape, TypeRegistry, TypeRegistryBuilder};
pub use worker::{WorkerPool, WorkerPoolConfig};
