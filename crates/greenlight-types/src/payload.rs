use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// Structured value attached to events, step outputs, and mailbox messages.
///
/// Payloads are JSON values rather than opaque bytes: domain machines read
/// typed step outputs back out of the memo, so the codec choice lives here
/// once instead of in every machine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload(serde_json::Value);

impl Payload {
    pub fn null() -> Self {
        Self(serde_json::Value::Null)
    }

    pub fn from_value(value: serde_json::Value) -> Self {
        Self(value)
    }

    /// Encode any serializable value into a payload.
    pub fn encode<T: Serialize>(value: &T) -> Result<Self, PayloadError> {
        serde_json::to_value(value)
            .map(Self)
            .map_err(|e| PayloadError::Encode(e.to_string()))
    }

    /// Decode the payload into a concrete type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
        serde_json::from_value(self.0.clone()).map_err(|e| PayloadError::Decode(e.to_string()))
    }

    pub fn raw(&self) -> &serde_json::Value {
        &self.0
    }

    /// String value at a top-level field, if present.
    pub fn str_field(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(|v| v.as_str())
    }
}

/// Codec failures. The message is captured eagerly because
/// `serde_json::Error` is neither `Clone` nor comparable.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("payload encode failed: {0}")]
    Encode(String),
    #[error("payload decode failed: {0}")]
    Decode(String),
}
