//! Payload serialization (§6.2). The engine stores message payloads as
//! opaque bytes; this trait and its `serde_json` implementation exist for
//! completeness, the way the teacher reaches for `serde_json` everywhere
//! rather than leaving callers to hand-encode payloads themselves.

use serde::{de::DeserializeOwned, Serialize as SerdeSerialize};

use crate::error::{InboxError, Result};

/// Converts a typed payload to and from the opaque bytes the engine stores.
/// `message_type` is passed through unused by [`JsonSerializer`] but is part
/// of the contract for implementations that multiplex formats per type.
pub trait Serializer<T> {
    fn serialize(&self, value: &T, message_type: &str) -> Result<Vec<u8>>;
    fn deserialize(&self, bytes: &[u8], message_type: &str) -> Result<T>;
}

/// The default reference serializer, backed by `serde_json`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl<T> Serializer<T> for JsonSerializer
where
    T: SerdeSerialize + DeserializeOwned,
{
    fn serialize(&self, value: &T, _message_type: &str) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| InboxError::Serialization(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8], _message_type: &str) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| InboxError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Greeting {
        text: String,
    }

    #[test]
    fn json_round_trips() {
        let serializer = JsonSerializer;
        let value = Greeting { text: "hi".to_string() };
        let bytes = serializer.serialize(&value, "greeting").unwrap();
        let decoded: Greeting = serializer.deserialize(&bytes, "greeting").unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn invalid_bytes_report_serialization_error() {
        let serializer = JsonSerializer;
        let err = Serializer::<Greeting>::deserialize(&serializer, b"not json", "greeting").unwrap_err();
        assert!(matches!(err, InboxError::Serialization(_)));
    }
}
