//! Serializer SPI.
//!
//! A [`Codec`] turns payload values into the string stored in the log and
//! back. Typed conversion (value ↔ Rust type) is done by serde against the
//! shape resolved from the [`TypeRegistry`](crate::TypeRegistry); the codec
//! only owns the wire representation.

use serde_json::Value;

use crate::error::CodecError;

/// Wire representation of event payloads.
///
/// Object-safe so that a [`Dispatcher`](crate::Dispatcher) can hold any
/// codec behind an `Arc<dyn Codec>`.
pub trait Codec: Send + Sync + 'static {
    /// Short name used in log fields.
    fn name(&self) -> &'static str;

    /// Encode a payload value.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if the value cannot be represented.
    fn encode(&self, value: &Value) -> Result<String, CodecError>;

    /// Decode a stored payload into a value.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if `encoded` is malformed.
    fn decode(&self, encoded: &str) -> Result<Value, CodecError>;
}

/// Compact JSON. The default codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, value: &Value) -> Result<String, CodecError> {
        Ok(serde_json::to_string(value)?)
    }

    fn decode(&self, encoded: &str) -> Result<Value, CodecError> {
        // Markers may be stored with an empty payload by foreign writers.
        if encoded.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(encoded)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_codec_encodes_compactly() {
        let encoded = JsonCodec
            .encode(&json!({"name": "Bill", "ears": 2}))
            .expect("encode should succeed");
        assert!(!encoded.contains(' '));
        assert!(encoded.contains(r#""name":"Bill""#));
    }

    #[test]
    fn json_codec_decodes_empty_as_null() {
        assert_eq!(JsonCodec.decode("").expect("decode"), Value::Null);
        assert_eq!(JsonCodec.decode("null").expect("decode"), Value::Null);
    }

    #[test]
    fn json_codec_rejects_malformed_input() {
        let err = JsonCodec.decode("{not json").unwrap_err();
        assert!(matches!(err, CodecError::Json(_)));
    }
}
