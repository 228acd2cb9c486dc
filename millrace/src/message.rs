//! The message envelope written to and read back from the store.

use std::collections::HashMap;

use bytes::Bytes;
use serde_json::Value;

use crate::error::Error;

/// An immutable message envelope.
///
/// The identifier is opaque to millrace: callers usually supply a UUID or
/// ULID, but any string is accepted. Payload and identifier round-trip
/// byte-for-byte through the store; metadata round-trips key/value-for-
/// key/value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    /// Unique identifier, caller-supplied.
    pub uuid: String,
    /// Raw payload bytes.
    pub payload: Bytes,
    /// String metadata attached to the message.
    pub metadata: HashMap<String, String>,
}

impl Message {
    pub fn new(uuid: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            uuid: uuid.into(),
            payload: payload.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// Serializes the metadata map for the JSONB column.
    pub(crate) fn metadata_json(&self) -> Value {
        Value::Object(
            self.metadata
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
        )
    }

    /// Rebuilds the metadata map from a stored JSONB value. NULL is treated
    /// as an empty map.
    pub(crate) fn metadata_from_json(value: Value) -> Result<HashMap<String, String>, Error> {
        match value {
            Value::Null => Ok(HashMap::new()),
            Value::Object(map) => map
                .into_iter()
                .map(|(k, v)| match v {
                    Value::String(s) => Ok((k, s)),
                    other => Err(Error::Decode(format!(
                        "metadata value for {k:?} is not a string: {other}"
                    ))),
                })
                .collect(),
            other => Err(Error::Decode(format!("metadata is not an object: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_round_trip() {
        let msg = Message::new("id-1", &b"payload"[..])
            .with_metadata("origin", "orders")
            .with_metadata("attempt", "3");

        let restored = Message::metadata_from_json(msg.metadata_json()).unwrap();
        assert_eq!(restored, msg.metadata);
    }

    #[test]
    fn null_metadata_is_empty() {
        let restored = Message::metadata_from_json(Value::Null).unwrap();
        assert!(restored.is_empty());
    }

    #[test]
    fn non_string_metadata_rejected() {
        let value = serde_json::json!({"retries": 3});
        assert!(Message::metadata_from_json(value).is_err());
    }
}
