//! Typed front end over an [`EventLog`].
//!
//! The dispatcher owns the codec and the worker pool. Outgoing payloads are
//! encoded here before the log is touched; incoming ones are decoded against
//! a [`TypeRegistry`] or a static [`EventType`].

use std::fmt;
use std::sync::Arc;

use crate::codec::{Codec, JsonCodec};
use crate::error::DispatchError;
use crate::event::{
    DynPayload, EncodedEvent, EventId, EventType, PendingEvent, StoredEvent, TypedEvent,
};
use crate::log::{CatchUp, EventLog, SubscriberFn};
use crate::types::{PayloadShape, TypeRegistry};
use crate::worker::WorkerPool;

/// Encodes, decodes, and routes events between callers and the log.
///
/// `Clone` is cheap: every field is reference-counted.
#[derive(Clone)]
pub struct Dispatcher {
    log: Arc<dyn EventLog>,
    codec: Arc<dyn Codec>,
    pool: WorkerPool,
}

impl Dispatcher {
    /// Dispatcher over `log` using [`JsonCodec`]. Live deliveries are
    /// decoded on `pool`.
    pub fn new(log: Arc<dyn EventLog>, pool: WorkerPool) -> Self {
        Self {
            log,
            codec: Arc::new(JsonCodec),
            pool,
        }
    }

    /// Replace the codec.
    pub fn with_codec(mut self, codec: impl Codec) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    /// The underlying log.
    pub fn log(&self) -> &Arc<dyn EventLog> {
        &self.log
    }

    /// The worker pool used for live deliveries.
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Encode and append a single event.
    ///
    /// # Arguments
    ///
    /// * `origin` - Target aggregate kind. Usually `T::ORIGIN`.
    /// * `aggregate_id` - Target aggregate instance.
    /// * `payload` - The event payload; its type name is `T::EVENT_TYPE`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Payload`] or [`DispatchError::Encode`] if the
    /// payload cannot be encoded (nothing is written), or
    /// [`DispatchError::Log`] if the append fails.
    pub fn store<T: EventType>(
        &self,
        origin: &str,
        aggregate_id: &str,
        payload: &T,
    ) -> Result<StoredEvent, DispatchError> {
        let value = serde_json::to_value(payload).map_err(|source| DispatchError::Payload {
            event_type: T::EVENT_TYPE.to_owned(),
            source,
        })?;
        let encoded = self
            .codec
            .encode(&value)
            .map_err(|source| DispatchError::Encode {
                event_type: T::EVENT_TYPE.to_owned(),
                source,
            })?;
        let stored = self
            .log
            .append(origin, aggregate_id, T::EVENT_TYPE, encoded)?;
        tracing::trace!(
            origin,
            event_type = T::EVENT_TYPE,
            event_id = %stored.id,
            "event stored"
        );
        Ok(stored)
    }

    /// Encode one pending event.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Payload`] or [`DispatchError::Encode`].
    pub fn encode(&self, pending: &PendingEvent) -> Result<EncodedEvent, DispatchError> {
        let value = pending
            .payload_value()
            .map_err(|source| DispatchError::Payload {
                event_type: pending.event_type().to_owned(),
                source,
            })?;
        let payload = self
            .codec
            .encode(&value)
            .map_err(|source| DispatchError::Encode {
                event_type: pending.event_type().to_owned(),
                source,
            })?;
        Ok(EncodedEvent::new(
            pending.origin(),
            pending.aggregate_id(),
            pending.event_type(),
            payload,
        ))
    }

    /// Encode every event, then append them as one atomic batch.
    ///
    /// If any payload fails to encode, the log is not touched and no
    /// subscriber is notified.
    ///
    /// # Errors
    ///
    /// Returns the first encoding error, or [`DispatchError::Log`] if the
    /// batch append fails.
    pub fn store_batch(
        &self,
        cause_id: Option<EventId>,
        corr_id: Option<EventId>,
        events: Vec<PendingEvent>,
    ) -> Result<usize, DispatchError> {
        let encoded = events
            .iter()
            .map(|pending| self.encode(pending))
            .collect::<Result<Vec<_>, _>>()?;
        let written = self.log.append_batch(cause_id, corr_id, encoded)?;
        tracing::trace!(count = written, cause_id = ?cause_id, "batch stored");
        Ok(written)
    }

    /// Raw stored events of one stream after `from_sequence`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Log`] if the read fails.
    pub fn read(
        &self,
        origin: &str,
        aggregate_id: &str,
        from_sequence: u64,
    ) -> Result<Vec<StoredEvent>, DispatchError> {
        Ok(self.log.read(origin, aggregate_id, from_sequence)?)
    }

    /// Read one stream and decode every event whose type is in `types`.
    ///
    /// Events of unknown types are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Decode`] if an event of a known type cannot
    /// be decoded, or [`DispatchError::Log`] if the read fails.
    pub fn read_typed(
        &self,
        origin: &str,
        aggregate_id: &str,
        from_sequence: u64,
        types: &TypeRegistry,
    ) -> Result<Vec<TypedEvent<DynPayload>>, DispatchError> {
        let raw = self.log.read(origin, aggregate_id, from_sequence)?;
        let mut typed = Vec::with_capacity(raw.len());
        for event in raw {
            let Some(shape) = types.resolve(&event.event_type) else {
                tracing::warn!(
                    origin,
                    aggregate_id,
                    event_type = %event.event_type,
                    event_id = %event.id,
                    "skipping event of unknown type"
                );
                tracing::debug!(known = ?types.known_types(), "registered event types");
                continue;
            };
            typed.push(self.decode_shape(event, shape)?);
        }
        Ok(typed)
    }

    /// Decode a stored event against a resolved shape.
    pub(crate) fn decode_shape(
        &self,
        event: StoredEvent,
        shape: &PayloadShape,
    ) -> Result<TypedEvent<DynPayload>, DispatchError> {
        let payload = self
            .codec
            .decode(&event.payload)
            .map_err(|e| e.to_string())
            .and_then(|value| shape.decode(value).map_err(|e| e.to_string()))
            .map_err(|reason| decode_error(&event, reason))?;
        Ok(TypedEvent {
            meta: event,
            payload,
        })
    }

    /// Decode a stored event as `T`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Decode`] if the payload does not fit `T`.
    pub fn decode_as<T: EventType>(&self, event: StoredEvent) -> Result<TypedEvent<T>, DispatchError> {
        decode_with::<T>(self.codec.as_ref(), event)
    }

    /// Subscribe to `T` events of `origin` from `since`, or get the history
    /// that must be replayed first.
    ///
    /// Returns `Ok(None)` when the subscription is registered: from then on
    /// every matching commit is decoded on the worker pool and handed to
    /// `on_event`, off the commit path. Live decode failures are delivered as
    /// `Err` so the consumer can log them.
    ///
    /// Returns `Ok(Some(events))` when matching events exist at or after
    /// `since`; nothing is registered and `on_event` is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Decode`] if a replayed event cannot be
    /// decoded, or [`DispatchError::Log`] if the log fails.
    pub fn subscribe_typed<T, F>(
        &self,
        origin: &str,
        since: u64,
        on_event: F,
    ) -> Result<Option<Vec<TypedEvent<T>>>, DispatchError>
    where
        T: EventType,
        F: Fn(Result<TypedEvent<T>, DispatchError>) + Send + Sync + 'static,
    {
        Ok(match self.catch_up_typed::<T, F>(origin, since, on_event)? {
            TypedCatchUp::Subscribed(_) => None,
            TypedCatchUp::Replay(events) => Some(events),
        })
    }

    /// Like [`subscribe_typed`](Self::subscribe_typed), but hands back the
    /// registration so it can be cancelled.
    ///
    /// # Errors
    ///
    /// Same as [`subscribe_typed`](Self::subscribe_typed).
    pub fn catch_up_typed<T, F>(
        &self,
        origin: &str,
        since: u64,
        on_event: F,
    ) -> Result<TypedCatchUp<T>, DispatchError>
    where
        T: EventType,
        F: Fn(Result<TypedEvent<T>, DispatchError>) + Send + Sync + 'static,
    {
        let on_event = Arc::new(on_event);
        let codec = Arc::clone(&self.codec);
        let pool = self.pool.clone();
        let callback: SubscriberFn = Arc::new(move |event: &StoredEvent| {
            let (codec, on_event, event) = (Arc::clone(&codec), Arc::clone(&on_event), event.clone());
            pool.submit(move || on_event(decode_with::<T>(codec.as_ref(), event)));
        });

        match self
            .log
            .subscribe_or_catch_up(origin, T::EVENT_TYPE, since, Arc::clone(&callback))?
        {
            CatchUp::Subscribed => Ok(TypedCatchUp::Subscribed(LiveSubscription {
                log: Arc::clone(&self.log),
                origin: origin.to_owned(),
                event_type: T::EVENT_TYPE,
                callback,
            })),
            CatchUp::Replay(events) => {
                let typed = events
                    .into_iter()
                    .map(|event| decode_with::<T>(self.codec.as_ref(), event))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(TypedCatchUp::Replay(typed))
            }
        }
    }
}

/// Outcome of [`Dispatcher::catch_up_typed`].
#[derive(Debug)]
pub enum TypedCatchUp<T> {
    /// The callback is registered.
    Subscribed(LiveSubscription),
    /// History to replay first; nothing was registered.
    Replay(Vec<TypedEvent<T>>),
}

/// A registered live subscription.
///
/// Dropping it leaves the subscription in place; call
/// [`cancel`](LiveSubscription::cancel) to remove it from the log.
pub struct LiveSubscription {
    log: Arc<dyn EventLog>,
    origin: String,
    event_type: &'static str,
    callback: SubscriberFn,
}

impl LiveSubscription {
    /// Remove the callback from the log. Returns `false` if it was already
    /// gone.
    pub fn cancel(self) -> bool {
        self.log
            .unsubscribe(&self.origin, self.event_type, &self.callback)
    }
}

impl fmt::Debug for LiveSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveSubscription")
            .field("origin", &self.origin)
            .field("event_type", &self.event_type)
            .finish_non_exhaustive()
    }
}

fn decode_error(event: &StoredEvent, reason: String) -> DispatchError {
    DispatchError::Decode {
        event_id: event.id,
        event_type: event.event_type.clone(),
        reason,
    }
}

fn decode_with<T: EventType>(
    codec: &dyn Codec,
    event: StoredEvent,
) -> Result<TypedEvent<T>, DispatchError> {
    let payload = codec
        .decode(&event.payload)
        .map_err(|e| e.to_string())
        .and_then(|value| serde_json::from_value::<T>(value).map_err(|e| e.to_string()));
    match payload {
        Ok(payload) => Ok(TypedEvent {
            meta: event,
            payload,
        }),
        Err(reason) => Err(decode_error(&event, reason)),
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("codec", &self.codec.name())
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}
