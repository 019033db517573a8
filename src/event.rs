//! Event records: committed, pending, encoded, and typed.
//!
//! A [`StoredEvent`] exists only after the log has committed it. Handler code
//! produces [`PendingEvent`]s instead, which the dispatcher encodes into
//! [`EncodedEvent`]s right before the append. Keeping the three apart means
//! nothing downstream can treat an uncommitted event as if it had an id,
//! sequence number, or timestamp.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Static association between a payload type, its event-type name, and the
/// aggregate kind (origin) that owns it.
///
/// Event-type names must be unique per payload shape across everything
/// registered in one [`TypeRegistry`](crate::TypeRegistry).
///
/// # Examples
///
/// ```
/// use eventpipe_es::EventType;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct RabbitAdded {
///     name: String,
/// }
///
/// impl EventType for RabbitAdded {
///     const EVENT_TYPE: &'static str = "added";
///     const ORIGIN: &'static str = "rabbit";
/// }
/// ```
pub trait EventType: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Event-type name stored alongside every event of this shape.
    const EVENT_TYPE: &'static str;

    /// Origin (aggregate kind) events of this shape are written to by default.
    const ORIGIN: &'static str;
}

/// Log-assigned event identifier.
///
/// Opaque to callers apart from its total order: ids handed out by one log
/// increase with every committed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(u64);

impl EventId {
    /// Wrap a raw id. Logs use this when assigning ids; callers normally only
    /// compare and display them.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw numeric value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An event as committed to the log. Immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Log-assigned id.
    pub id: EventId,
    /// One-based, gapless position within `(origin, aggregate_id)`.
    pub sequence: u64,
    /// Aggregate kind (e.g. "rabbit").
    pub origin: String,
    /// Aggregate instance id (e.g. "r1").
    pub aggregate_id: String,
    /// Event-type name (e.g. "added").
    pub event_type: String,
    /// Codec-encoded payload.
    pub payload: String,
    /// Id of the event whose processing produced this one, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause_id: Option<EventId>,
    /// Correlation id of the whole causal chain. Equals `id` for events
    /// appended without a cause.
    pub corr_id: EventId,
    /// Commit timestamp, Unix epoch milliseconds.
    pub stored_at: u64,
}

impl StoredEvent {
    /// `origin/aggregate_id`, used in log messages and errors.
    pub fn stream_key(&self) -> String {
        format!("{}/{}", self.origin, self.aggregate_id)
    }
}

/// A fully encoded record ready for [`EventLog::append_batch`](crate::EventLog::append_batch).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedEvent {
    /// Target aggregate kind.
    pub origin: String,
    /// Target aggregate instance.
    pub aggregate_id: String,
    /// Event-type name.
    pub event_type: String,
    /// Codec-encoded payload.
    pub payload: String,
}

impl EncodedEvent {
    /// Build a record from its parts.
    pub fn new(
        origin: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            origin: origin.into(),
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            payload: payload.into(),
        }
    }
}

/// Type-erased, not-yet-serialized payload carried by a [`PendingEvent`].
///
/// Conversion into the codec's value model is deferred until the dispatcher
/// encodes a whole batch, so a failure aborts the batch before any write.
pub trait PendingPayload: Send + Sync + 'static {
    /// Convert into the value model the [`Codec`](crate::Codec) encodes.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the value cannot be represented.
    fn to_value(&self) -> serde_json::Result<serde_json::Value>;
}

impl<T> PendingPayload for T
where
    T: Serialize + Send + Sync + 'static,
{
    fn to_value(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

/// An event emitted by handler logic that has not been persisted yet.
#[derive(Clone)]
pub struct PendingEvent {
    origin: String,
    aggregate_id: String,
    event_type: String,
    payload: Option<Arc<dyn PendingPayload>>,
}

impl PendingEvent {
    /// An event for `aggregate_id` whose origin and type come from the
    /// payload's [`EventType`] association.
    pub fn of<T: EventType>(aggregate_id: impl Into<String>, payload: T) -> Self {
        Self {
            origin: T::ORIGIN.to_owned(),
            aggregate_id: aggregate_id.into(),
            event_type: T::EVENT_TYPE.to_owned(),
            payload: Some(Arc::new(payload)),
        }
    }

    /// Like [`of`](PendingEvent::of), but written to an explicit origin.
    pub fn with_origin<T: EventType>(
        origin: impl Into<String>,
        aggregate_id: impl Into<String>,
        payload: T,
    ) -> Self {
        Self {
            origin: origin.into(),
            aggregate_id: aggregate_id.into(),
            event_type: T::EVENT_TYPE.to_owned(),
            payload: Some(Arc::new(payload)),
        }
    }

    /// A payload-less event, identified only by its type (e.g. `handled`).
    pub fn marker(
        origin: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
    ) -> Self {
        Self {
            origin: origin.into(),
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            payload: None,
        }
    }

    /// Target aggregate kind.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Target aggregate instance.
    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    /// Event-type name.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// The payload as a value, `Value::Null` for markers.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the payload cannot be represented.
    pub fn payload_value(&self) -> serde_json::Result<serde_json::Value> {
        match &self.payload {
            Some(payload) => payload.to_value(),
            None => Ok(serde_json::Value::Null),
        }
    }
}

// Manual `Debug` because the payload is a trait object.
impl fmt::Debug for PendingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingEvent")
            .field("origin", &self.origin)
            .field("aggregate_id", &self.aggregate_id)
            .field("event_type", &self.event_type)
            .field("has_payload", &self.payload.is_some())
            .finish()
    }
}

/// A decoded payload whose concrete type is only known at runtime.
pub type DynPayload = Arc<dyn Any + Send + Sync>;

/// A committed event paired with its decoded payload.
#[derive(Debug, Clone)]
pub struct TypedEvent<T> {
    /// Metadata of the committed event.
    pub meta: StoredEvent,
    /// Decoded payload.
    pub payload: T,
}

impl TypedEvent<DynPayload> {
    /// Recover the concrete payload type.
    ///
    /// Returns `None` if the payload is not a `T`.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<TypedEvent<Arc<T>>> {
        let payload = Arc::clone(&self.payload).downcast::<T>().ok()?;
        Some(TypedEvent {
            meta: self.meta.clone(),
            payload,
        })
    }

    /// Borrow the payload as a `T` without cloning the metadata.
    pub fn payload_ref<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }
}
