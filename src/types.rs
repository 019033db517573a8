//! Event-type registry: maps event-type names to payload shapes.
//!
//! Readers consult the registry to turn a stored payload back into a Rust
//! value without knowing its concrete type at compile time. The decoded
//! value is returned as a [`DynPayload`] and recovered with
//! [`TypedEvent::downcast`](crate::TypedEvent::downcast).

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::RegistryError;
use crate::event::{DynPayload, EventType};

type DecodeFn = fn(Value) -> serde_json::Result<DynPayload>;

fn decode_as<T>(value: Value) -> serde_json::Result<DynPayload>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    Ok(Arc::new(serde_json::from_value::<T>(value)?))
}

// Markers carry no payload; whatever is stored is ignored.
fn decode_marker(_value: Value) -> serde_json::Result<DynPayload> {
    Ok(Arc::new(()))
}

/// The shape a named event type decodes into.
#[derive(Clone)]
pub struct PayloadShape {
    event_type: String,
    type_id: TypeId,
    type_name: &'static str,
    decode: DecodeFn,
}

impl PayloadShape {
    /// Shape of a payload type with a static [`EventType`] association.
    pub fn of<T: EventType>() -> Self {
        Self::named::<T>(T::EVENT_TYPE)
    }

    /// Shape of `T` under an explicit event-type name.
    pub fn named<T>(event_type: impl Into<String>) -> Self
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        Self {
            event_type: event_type.into(),
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            decode: decode_as::<T>,
        }
    }

    /// Shape of a payload-less marker event. Decodes to `()`.
    pub fn marker(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            type_id: TypeId::of::<()>(),
            type_name: "()",
            decode: decode_marker,
        }
    }

    /// The event-type name.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Rust type name of the payload.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Decode a payload value into this shape.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if `value` does not fit the shape.
    pub fn decode(&self, value: Value) -> serde_json::Result<DynPayload> {
        (self.decode)(value)
    }
}

impl fmt::Debug for PayloadShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadShape")
            .field("event_type", &self.event_type)
            .field("type_name", &self.type_name)
            .finish()
    }
}

/// Immutable map of event-type name to [`PayloadShape`].
///
/// # Examples
///
/// ```
/// use eventpipe_es::{EventType, TypeRegistry};
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
///
/// let types = TypeRegistry::builder()
///     .register::<RabbitAdded>()
///     .marker("init")
///     .build()
///     .unwrap();
/// assert!(types.resolve("added").is_some());
/// assert!(types.resolve("removed").is_none());
/// ```
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    shapes: HashMap<String, PayloadShape>,
}

impl TypeRegistry {
    /// Start an empty builder.
    pub fn builder() -> TypeRegistryBuilder {
        TypeRegistryBuilder::default()
    }

    /// Look up the shape for an event-type name.
    pub fn resolve(&self, event_type: &str) -> Option<&PayloadShape> {
        self.shapes.get(event_type)
    }

    /// Registered event-type names, sorted.
    pub fn known_types(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.shapes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered event types.
    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }
}

/// Builder for [`TypeRegistry`]. Conflicts are reported by
/// [`build`](TypeRegistryBuilder::build).
#[derive(Debug, Default)]
pub struct TypeRegistryBuilder {
    shapes: Vec<PayloadShape>,
}

impl TypeRegistryBuilder {
    /// Register a payload type under its [`EventType::EVENT_TYPE`] name.
    pub fn register<T: EventType>(mut self) -> Self {
        self.shapes.push(PayloadShape::of::<T>());
        self
    }

    /// Register a payload-less marker event type.
    pub fn marker(mut self, event_type: impl Into<String>) -> Self {
        self.shapes.push(PayloadShape::marker(event_type));
        self
    }

    /// Register a prebuilt shape.
    pub fn shape(mut self, shape: PayloadShape) -> Self {
        self.shapes.push(shape);
        self
    }

    /// Validate and freeze the registry.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::ConflictingEventType`] if one name was
    /// registered with two different payload types. Registering the same
    /// type twice is accepted.
    pub fn build(self) -> Result<TypeRegistry, RegistryError> {
        let mut shapes: HashMap<String, PayloadShape> = HashMap::with_capacity(self.shapes.len());
        for shape in self.shapes {
            if let Some(existing) = shapes.get(&shape.event_type) {
                if existing.type_id != shape.type_id {
                    return Err(RegistryError::ConflictingEventType {
                        event_type: shape.event_type,
                        existing: existing.type_name,
                        requested: shape.type_name,
                    });
                }
                continue;
            }
            shapes.insert(shape.event_type.clone(), shape);
        }
        Ok(TypeRegistry { shapes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{RabbitAdded, RabbitNameUpdated};
    use serde_json::json;

    #[test]
    fn resolve_and_decode_registered_type() {
        let types = TypeRegistry::builder()
            .register::<RabbitAdded>()
            .build()
            .expect("build should succeed");
        let shape = types.resolve("added").expect("added should be registered");
        let payload = shape
            .decode(json!({"name": "Bill"}))
            .expect("decode should succeed");
        let rabbit = payload
            .downcast_ref::<RabbitAdded>()
            .expect("payload should be RabbitAdded");
        assert_eq!(rabbit.name, "Bill");
    }

    #[test]
    fn decode_rejects_wrong_shape() {
        let types = TypeRegistry::builder()
            .register::<RabbitAdded>()
            .build()
            .expect("build should succeed");
        let shape = types.resolve("added").expect("registered");
        assert!(shape.decode(json!({"nom": 3})).is_err());
    }

    #[test]
    fn marker_decodes_anything_to_unit() {
        let types = TypeRegistry::builder()
            .marker("init")
            .build()
            .expect("build should succeed");
        let payload = types
            .resolve("init")
            .expect("registered")
            .decode(json!({"ignored": true}))
            .expect("marker decode never fails");
        assert!(payload.downcast_ref::<()>().is_some());
    }

    #[test]
    fn same_type_twice_is_harmless() {
        let types = TypeRegistry::builder()
            .register::<RabbitAdded>()
            .register::<RabbitAdded>()
            .build()
            .expect("duplicate identical registration should succeed");
        assert_eq!(types.len(), 1);
    }

    #[test]
    fn conflicting_types_are_rejected() {
        let err = TypeRegistry::builder()
            .register::<RabbitAdded>()
            .shape(PayloadShape::named::<RabbitNameUpdated>("added"))
            .build()
            .unwrap_err();
        match err {
            RegistryError::ConflictingEventType { event_type, .. } => {
                assert_eq!(event_type, "added");
            }
            other => panic!("expected ConflictingEventType, got {other:?}"),
        }
    }

    #[test]
    fn known_types_are_sorted() {
        let types = TypeRegistry::builder()
            .register::<RabbitNameUpdated>()
            .register::<RabbitAdded>()
            .marker("init")
            .build()
            .expect("build should succeed");
        assert_eq!(types.known_types(), vec!["added", "init", "name_updated"]);
        assert!(!types.is_empty());
    }
}
