//! Crate-level error types for the event log, dispatcher, registries,
//! aggregates, and pipelines.

use crate::event::EventId;

/// Error returned by an [`EventLog`](crate::EventLog) implementation.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// Disk I/O failure.
    ///
    /// An underlying filesystem error occurred while writing or reading
    /// the journal of a file-backed log.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A journal record could not be serialized or deserialized.
    #[error("journal serialization error: {0}")]
    Journal(#[from] serde_json::Error),

    /// A complete journal line in the middle of the file is unreadable.
    ///
    /// Only a torn *final* line is tolerated (it is the signature of a crash
    /// mid-write); anything else means the journal was damaged and replaying
    /// it would silently lose committed events.
    #[error("journal corrupt at line {line}: {reason}")]
    Corrupt {
        /// One-based line number of the damaged record.
        line: usize,
        /// Parser message describing the damage.
        reason: String,
    },
}

/// Error returned by a [`Codec`](crate::Codec).
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The underlying JSON machinery failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// The codec refused the value (e.g. a size or content restriction).
    #[error("payload rejected by codec: {0}")]
    Rejected(String),
}

/// Error returned by the [`Dispatcher`](crate::Dispatcher).
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// A payload could not be converted into the codec's value model.
    #[error("payload for event type '{event_type}' could not be serialized: {source}")]
    Payload {
        /// Event type whose payload failed.
        event_type: String,
        /// Underlying serde error.
        #[source]
        source: serde_json::Error,
    },

    /// The codec failed to encode an outgoing payload.
    #[error("failed to encode payload for event type '{event_type}': {source}")]
    Encode {
        /// Event type whose payload failed.
        event_type: String,
        /// Underlying codec error.
        #[source]
        source: CodecError,
    },

    /// A stored payload of a *known* type could not be decoded.
    ///
    /// Signals schema drift between the writer and this reader; it is never
    /// silently skipped.
    #[error("failed to decode event {event_id} of type '{event_type}': {reason}")]
    Decode {
        /// Id of the offending event.
        event_id: EventId,
        /// Event type of the offending event.
        event_type: String,
        /// Codec or shape error message.
        reason: String,
    },

    /// The underlying event log failed.
    #[error(transparent)]
    Log(#[from] LogError),
}

/// Error returned when building a [`TypeRegistry`](crate::TypeRegistry) or
/// [`HandlerRegistry`](crate::HandlerRegistry).
///
/// Both indicate a programming error in the registration table and must
/// abort startup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// More than one mutation function was mapped to one event type.
    #[error("multiple handlers registered for event type '{event_type}' on aggregate '{aggregate}'")]
    DuplicateHandler {
        /// Origin of the aggregate whose registry is ambiguous.
        aggregate: String,
        /// The event type mapped more than once.
        event_type: String,
    },

    /// Two different payload shapes were registered under one event type.
    #[error("event type '{event_type}' registered as both {existing} and {requested}")]
    ConflictingEventType {
        /// The event type name.
        event_type: String,
        /// Rust type name of the first registration.
        existing: &'static str,
        /// Rust type name of the conflicting registration.
        requested: &'static str,
    },
}

/// Error returned when applying an event to an
/// [`AggregateRoot`](crate::AggregateRoot).
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    /// The event belongs to another stream.
    #[error("event for stream {found} cannot be applied to aggregate {expected}")]
    StreamMismatch {
        /// `origin/aggregate_id` of the aggregate.
        expected: String,
        /// `origin/aggregate_id` of the event.
        found: String,
    },

    /// The decoded payload is not the type the handler was registered for.
    #[error("payload of event type '{event_type}' is not a {expected}")]
    PayloadShape {
        /// Event type of the offending event.
        event_type: String,
        /// Rust type name the handler expects.
        expected: &'static str,
    },
}

/// Error returned by a [`Repository`](crate::Repository).
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// Reading or decoding the stream failed.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// An event could not be applied.
    #[error(transparent)]
    Apply(#[from] ApplyError),

    /// Snapshot I/O failed.
    #[error("snapshot I/O error: {0}")]
    Snapshot(#[from] std::io::Error),
}

/// Error returned by a [`Pipeline`](crate::Pipeline) or its handle.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The dispatcher failed while catching up.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// The log answered a catch-up request with an empty replay batch.
    ///
    /// The log contract promises at least the boundary event, so this is an
    /// internal-consistency failure rather than "nothing to do".
    #[error("log returned an empty replay batch for {origin}/{event_type}")]
    EmptyReplay {
        /// Subscribed origin.
        origin: String,
        /// Subscribed event type.
        event_type: String,
    },

    /// Catch-up failed; the message is the original error's display text.
    #[error("pipeline catch-up failed: {0}")]
    CatchUpFailed(String),

    /// The pipeline was shut down before it reached live mode.
    #[error("pipeline was shut down")]
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_error_io_from_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "journal missing");
        let err = LogError::from(io_err);
        assert!(err.to_string().contains("journal missing"));
    }

    #[test]
    fn log_error_corrupt_display() {
        let err = LogError::Corrupt {
            line: 3,
            reason: "expected value".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "journal corrupt at line 3: expected value"
        );
    }

    #[test]
    fn dispatch_error_log_is_transparent() {
        let err = DispatchError::from(LogError::Corrupt {
            line: 1,
            reason: "eof".to_string(),
        });
        assert_eq!(err.to_string(), "journal corrupt at line 1: eof");
    }

    #[test]
    fn dispatch_error_decode_mentions_event() {
        let err = DispatchError::Decode {
            event_id: EventId::new(7),
            event_type: "added".to_string(),
            reason: "missing field `name`".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("#7"));
        assert!(msg.contains("added"));
        assert!(msg.contains("missing field"));
    }

    #[test]
    fn registry_error_duplicate_display() {
        let err = RegistryError::DuplicateHandler {
            aggregate: "rabbit".to_string(),
            event_type: "added".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "multiple handlers registered for event type 'added' on aggregate 'rabbit'"
        );
    }

    #[test]
    fn pipeline_error_empty_replay_display() {
        let err = PipelineError::EmptyReplay {
            origin: "rabbit".to_string(),
            event_type: "added".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "log returned an empty replay batch for rabbit/added"
        );
    }

    // Errors cross worker threads and tokio tasks, so they must be
    // `Send + Sync`.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<LogError>();
            assert_send_sync::<CodecError>();
            assert_send_sync::<DispatchError>();
            assert_send_sync::<RegistryError>();
            assert_send_sync::<ApplyError>();
            assert_send_sync::<RepositoryError>();
            assert_send_sync::<PipelineError>();
        }
    };
}
