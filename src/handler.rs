//! Handler registry: event-type name to aggregate mutation function.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::aggregate::Aggregate;
use crate::error::{ApplyError, RegistryError};
use crate::event::{DynPayload, EventType, StoredEvent, TypedEvent};
use crate::types::{PayloadShape, TypeRegistry, TypeRegistryBuilder};

type MutateFn<A> =
    Arc<dyn Fn(&mut A, &TypedEvent<DynPayload>) -> Result<(), ApplyError> + Send + Sync>;

/// Immutable map from event-type name to the one function that folds that
/// event into aggregate state `A`.
///
/// Built once with [`HandlerRegistry::builder`]; a name mapped twice is a
/// construction error, so lookups never have to choose between handlers.
///
/// # Examples
///
/// ```
/// use eventpipe_es::{Aggregate, EventType, HandlerRegistry};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Default)]
/// struct Rabbit {
///     name: String,
/// }
///
/// impl Aggregate for Rabbit {
///     const ORIGIN: &'static str = "rabbit";
///     fn create(_id: &str) -> Self {
///         Rabbit::default()
///     }
/// }
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
/// let handlers = HandlerRegistry::<Rabbit>::builder()
///     .on::<RabbitAdded, _>(|rabbit, _meta, added| rabbit.name = added.name.clone())
///     .build()
///     .unwrap();
/// assert!(handlers.handles("added"));
/// ```
pub struct HandlerRegistry<A> {
    handlers: HashMap<String, MutateFn<A>>,
    types: TypeRegistry,
}

impl<A: Aggregate> HandlerRegistry<A> {
    /// Start an empty builder.
    pub fn builder() -> HandlerRegistryBuilder<A> {
        HandlerRegistryBuilder {
            entries: Vec::new(),
            types: TypeRegistry::builder(),
        }
    }

    /// Returns `true` if a handler is registered for `event_type`.
    pub fn handles(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    /// Payload shapes of every handled event type.
    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    /// Run the handler for `event`, if any.
    ///
    /// Returns `Ok(false)` when no handler is registered for the event type.
    ///
    /// # Errors
    ///
    /// Returns [`ApplyError::PayloadShape`] if the decoded payload is not
    /// the type the handler was registered with.
    pub fn dispatch(&self, state: &mut A, event: &TypedEvent<DynPayload>) -> Result<bool, ApplyError> {
        match self.handlers.get(&event.meta.event_type) {
            Some(handler) => {
                handler(state, event)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl<A> fmt::Debug for HandlerRegistry<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("HandlerRegistry")
            .field("handlers", &names)
            .finish()
    }
}

/// Builder for [`HandlerRegistry`].
pub struct HandlerRegistryBuilder<A> {
    entries: Vec<(String, MutateFn<A>)>,
    types: TypeRegistryBuilder,
}

impl<A: Aggregate> HandlerRegistryBuilder<A> {
    /// Handle events whose payload is `T`.
    pub fn on<T, F>(mut self, handler: F) -> Self
    where
        T: EventType,
        F: Fn(&mut A, &StoredEvent, &T) + Send + Sync + 'static,
    {
        let mutate: MutateFn<A> = Arc::new(move |state, event| {
            let payload = event
                .payload_ref::<T>()
                .ok_or_else(|| ApplyError::PayloadShape {
                    event_type: event.meta.event_type.clone(),
                    expected: std::any::type_name::<T>(),
                })?;
            handler(state, &event.meta, payload);
            Ok(())
        });
        self.entries.push((T::EVENT_TYPE.to_owned(), mutate));
        self.types = self.types.register::<T>();
        self
    }

    /// Handle a payload-less marker event such as `init`.
    pub fn on_marker<F>(mut self, event_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut A, &StoredEvent) + Send + Sync + 'static,
    {
        let event_type = event_type.into();
        let mutate: MutateFn<A> = Arc::new(move |state, event| {
            handler(state, &event.meta);
            Ok(())
        });
        self.types = self.types.shape(PayloadShape::marker(event_type.clone()));
        self.entries.push((event_type, mutate));
        self
    }

    /// Validate and freeze the registry.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateHandler`] if an event type was
    /// mapped more than once, or [`RegistryError::ConflictingEventType`] if
    /// the handled payload shapes disagree.
    pub fn build(self) -> Result<HandlerRegistry<A>, RegistryError> {
        let mut handlers = HashMap::with_capacity(self.entries.len());
        for (event_type, mutate) in self.entries {
            if handlers.contains_key(&event_type) {
                return Err(RegistryError::DuplicateHandler {
                    aggregate: A::ORIGIN.to_owned(),
                    event_type,
                });
            }
            handlers.insert(event_type, mutate);
        }
        let types = self.types.build()?;
        tracing::debug!(
            origin = A::ORIGIN,
            count = handlers.len(),
            "handler registry built"
        );
        Ok(HandlerRegistry { handlers, types })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{Rabbit, RabbitAdded, rabbit_handlers};
    use crate::event::EventId;

    fn typed(event_type: &str, payload: DynPayload) -> TypedEvent<DynPayload> {
        TypedEvent {
            meta: StoredEvent {
                id: EventId::new(1),
                sequence: 1,
                origin: "rabbit".into(),
                aggregate_id: "r1".into(),
                event_type: event_type.into(),
                payload: String::new(),
                cause_id: None,
                corr_id: EventId::new(1),
                stored_at: 0,
            },
            payload,
        }
    }

    #[test]
    fn dispatch_runs_registered_handler() {
        let handlers = rabbit_handlers();
        let mut rabbit = Rabbit::default();
        let event = typed(
            "added",
            Arc::new(RabbitAdded {
                name: "Bill".into(),
            }),
        );
        assert!(handlers.dispatch(&mut rabbit, &event).unwrap());
        assert_eq!(rabbit.name, "Bill");
    }

    #[test]
    fn dispatch_ignores_unregistered_type() {
        let handlers = rabbit_handlers();
        let mut rabbit = Rabbit::default();
        assert!(!handlers.dispatch(&mut rabbit, &typed("hopped", Arc::new(()))).unwrap());
        assert_eq!(rabbit, Rabbit::default());
    }

    #[test]
    fn marker_handler_runs() {
        let handlers = rabbit_handlers();
        let mut rabbit = Rabbit::default();
        handlers.dispatch(&mut rabbit, &typed("init", Arc::new(()))).unwrap();
        assert!(rabbit.initialized);
    }

    #[test]
    fn wrong_payload_type_is_an_error() {
        let handlers = rabbit_handlers();
        let mut rabbit = Rabbit::default();
        let err = handlers
            .dispatch(&mut rabbit, &typed("added", Arc::new(42u32)))
            .unwrap_err();
        assert!(matches!(err, ApplyError::PayloadShape { .. }));
    }

    #[test]
    fn duplicate_handler_is_rejected() {
        let err = HandlerRegistry::<Rabbit>::builder()
            .on::<RabbitAdded, _>(|r, _, e| r.name = e.name.clone())
            .on::<RabbitAdded, _>(|r, _, e| r.name = e.name.to_uppercase())
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::DuplicateHandler {
                aggregate: "rabbit".into(),
                event_type: "added".into(),
            }
        );
    }

    #[test]
    fn marker_clashing_with_typed_handler_is_rejected() {
        let err = HandlerRegistry::<Rabbit>::builder()
            .on::<RabbitAdded, _>(|r, _, e| r.name = e.name.clone())
            .on_marker("added", |r, _| r.initialized = true)
            .build()
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateHandler { .. }));
    }

    #[test]
    fn registry_exposes_handled_types() {
        let handlers = rabbit_handlers();
        assert_eq!(
            handlers.types().known_types(),
            vec!["added", "init", "name_updated", "removed"]
        );
        assert!(format!("{handlers:?}").contains("name_updated"));
    }
}
