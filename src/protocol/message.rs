//! Logical control messages
//!
//! A [`Message`] is one logical command exchanged with the peripheral:
//! a `type` discriminator plus named fields. Peripheral-native traffic
//! (originating from the MCU rather than the SOC) is discriminated by a
//! `C` command code instead; both shapes round-trip through the same
//! type.
//!
//! Messages serialize to flat JSON objects: the discriminator sits next
//! to the body fields, exactly as written on the wire.
//!
//! ## Example
//!
//! ```rust
//! use glasslink_core::protocol::Message;
//! use serde_json::json;
//!
//! let msg = Message::new("phone_ready", json!({ "timestamp": 1700000000000u64 }));
//! assert!(msg.is_type("phone_ready"));
//! ```

use serde_json::{json, Map, Value};

use crate::error::{LinkError, Result};

/// Body field carrying the message id stamped by the delivery tracker
pub const FIELD_MESSAGE_ID: &str = "mId";

/// Discriminator field on normal traffic
const FIELD_TYPE: &str = "type";

/// Discriminator field on peripheral-native traffic
const FIELD_COMMAND: &str = "C";

/// One logical control message
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    message_type: String,
    native: bool,
    body: Map<String, Value>,
}

impl Message {
    /// Create a message with a `type` discriminator.
    ///
    /// `body` should be a JSON object; any other value yields an empty
    /// body.
    pub fn new(message_type: impl Into<String>, body: Value) -> Self {
        Self {
            message_type: message_type.into(),
            native: false,
            body: body.as_object().cloned().unwrap_or_default(),
        }
    }

    /// Create a peripheral-native message carrying a `C` command code
    pub fn native(command: impl Into<String>, body: Value) -> Self {
        Self {
            message_type: command.into(),
            native: true,
            body: body.as_object().cloned().unwrap_or_default(),
        }
    }

    /// The discriminator: the `type` field, or the `C` command code on
    /// native traffic
    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    /// Whether this is peripheral-native (`C`-coded) traffic
    pub fn is_native(&self) -> bool {
        self.native
    }

    /// Check the discriminator against an expected type
    pub fn is_type(&self, message_type: &str) -> bool {
        self.message_type == message_type
    }

    /// Get a body field
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    /// Get a body field as a string slice
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str)
    }

    /// Get a body field as an unsigned integer
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.body.get(key).and_then(Value::as_u64)
    }

    /// Get a body field as a signed integer
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.body.get(key).and_then(Value::as_i64)
    }

    /// Set a body field
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.body.insert(key.into(), value);
    }

    /// The message id stamped by the delivery tracker, if any
    pub fn message_id(&self) -> Option<u64> {
        self.get_u64(FIELD_MESSAGE_ID)
    }

    /// Stamp the message id used for acknowledgment correlation
    pub fn set_message_id(&mut self, id: u64) {
        self.body.insert(FIELD_MESSAGE_ID.to_string(), json!(id));
    }

    /// Serialize to the exact JSON object written on the wire
    pub fn to_value(&self) -> Value {
        let mut obj = self.body.clone();
        let field = if self.native { FIELD_COMMAND } else { FIELD_TYPE };
        obj.insert(field.to_string(), Value::String(self.message_type.clone()));
        Value::Object(obj)
    }

    /// Serialize to JSON text
    pub fn to_json(&self) -> String {
        self.to_value().to_string()
    }

    /// Parse a message from a JSON value.
    ///
    /// The value must be an object carrying either a `type` field
    /// (normal traffic) or a `C` command code (peripheral-native
    /// traffic).
    pub fn from_value(value: Value) -> Result<Self> {
        let mut obj = match value {
            Value::Object(obj) => obj,
            other => {
                return Err(LinkError::invalid_packet(format!(
                    "expected JSON object, got {other}"
                )))
            }
        };

        if let Some(Value::String(message_type)) = obj.remove(FIELD_TYPE) {
            return Ok(Self {
                message_type,
                native: false,
                body: obj,
            });
        }
        if let Some(Value::String(command)) = obj.remove(FIELD_COMMAND) {
            return Ok(Self {
                message_type: command,
                native: true,
                body: obj,
            });
        }

        Err(LinkError::invalid_packet(
            "message carries neither a type nor a command code",
        ))
    }

    /// Parse a message from JSON text
    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }
}
