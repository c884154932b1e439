//! Application-error envelope.
//!
//! When a handler fails, the response's `arg1` carries the error as a
//! JSON envelope: `{"$jsError": {"name", "message", "stack", ...}}`.
//! Bare strings pass through unchanged in both directions. The envelope
//! is the on-wire contract and is preserved bit-exact across nodes that
//! map it into their own error types.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Envelope key marking a structured error object.
pub const ENVELOPE_KEY: &str = "$jsError";

/// A language-neutral application error as carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    /// Error class name.
    pub name: String,
    /// Human-readable message.
    pub message: String,
    /// Stack trace, when the origin recorded one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// Any additional own-properties, preserved verbatim.
    #[serde(flatten)]
    pub properties: serde_json::Map<String, Value>,
}

impl WireError {
    /// Build a plain error with the conventional class name.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            name: "Error".to_string(),
            message: message.into(),
            stack: None,
            properties: serde_json::Map::new(),
        }
    }

    /// Attach an additional own-property.
    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// Decoded content of an application-error `arg1`.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorEnvelope {
    /// A bare string, passed through unchanged.
    Message(String),
    /// A structured error from a `$jsError` envelope.
    Error(WireError),
}

impl ErrorEnvelope {
    /// Encode for transmission in a response `arg1`.
    ///
    /// Strings pass through as raw bytes; errors emit the JSON
    /// envelope.
    pub fn encode(&self) -> Result<Bytes> {
        match self {
            ErrorEnvelope::Message(text) => Ok(Bytes::copy_from_slice(text.as_bytes())),
            ErrorEnvelope::Error(err) => {
                let mut envelope = serde_json::Map::new();
                envelope.insert(ENVELOPE_KEY.to_string(), serde_json::to_value(err)?);
                Ok(Bytes::from(serde_json::to_vec(&Value::Object(envelope))?))
            }
        }
    }

    /// Decode a received `arg1`.
    ///
    /// Only a JSON object whose single key is `$jsError` deserializes
    /// into a structured error; anything else is preserved as a string.
    pub fn decode(arg1: &[u8]) -> Result<Self> {
        if let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(arg1) {
            if map.len() == 1 {
                if let Some(inner) = map.get(ENVELOPE_KEY) {
                    let err: WireError = serde_json::from_value(inner.clone())?;
                    return Ok(ErrorEnvelope::Error(err));
                }
            }
        }
        Ok(ErrorEnvelope::Message(
            String::from_utf8_lossy(arg1).into_owned(),
        ))
    }

    /// Collapse into a [`WireError`], wrapping bare strings.
    pub fn into_wire_error(self) -> WireError {
        match self {
            ErrorEnvelope::Error(err) => err,
            ErrorEnvelope::Message(text) => WireError::new(text),
        }
    }
}
