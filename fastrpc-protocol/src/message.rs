//! Decoded messages and the JSON payload envelopes.

use crate::error::RpcError;
use crate::frame::Status;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A decoded frame with its parsed payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Protocol version.
    pub version: u8,
    /// Payload encoding.
    pub payload_type: u8,
    /// Message status.
    pub status: Status,
    /// Call identifier.
    pub msgid: u32,
    /// Checksum carried in the header (already verified).
    pub checksum: u16,
    /// Payload length in bytes.
    pub length: u32,
    /// Parsed payload.
    pub data: Value,
    /// When the decoder emitted this message.
    pub received_at: DateTime<Utc>,
}

/// Method metadata carried in every call frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodMeta {
    /// Method name.
    pub name: String,
    /// Sender timestamp in microseconds since the Unix epoch.
    #[serde(default)]
    pub uts: i64,
}

impl MethodMeta {
    /// Creates method metadata stamped with the current time.
    pub fn now(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uts: Utc::now().timestamp_micros(),
        }
    }
}

/// Payload envelope for calls and responses.
///
/// `d` holds the argument array, or a [`WireError`] object when the frame
/// status is [`Status::Error`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "m")]
    pub method: MethodMeta,
    #[serde(rename = "d")]
    pub data: Value,
}

impl Envelope {
    pub fn args(method: MethodMeta, args: Vec<Value>) -> Self {
        Self {
            method,
            data: Value::Array(args),
        }
    }

    pub fn error(method: MethodMeta, err: &RpcError) -> Self {
        let wire = WireError::from(err);
        Self {
            method,
            data: serde_json::to_value(wire).unwrap_or(Value::Null),
        }
    }
}

/// The error object as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    #[serde(default = "default_error_name")]
    pub name: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ase_errors: Option<Vec<WireError>>,
}

fn default_error_name() -> String {
    "Error".to_string()
}

impl From<&RpcError> for WireError {
    fn from(err: &RpcError) -> Self {
        Self {
            name: err.name.clone(),
            message: err.message.clone(),
            stack: err.stack.clone(),
            context: err.context.clone(),
            ase_errors: if err.causes.is_empty() {
                None
            } else {
                Some(err.causes.iter().map(WireError::from).collect())
            },
        }
    }
}

impl From<WireError> for RpcError {
    fn from(wire: WireError) -> Self {
        Self {
            name: wire.name,
            message: wire.message,
            stack: wire.stack,
            context: wire.context,
            causes: wire
                .ase_errors
                .unwrap_or_default()
                .into_iter()
                .map(RpcError::from)
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_shape() {
        let env = Envelope::args(
            MethodMeta {
                name: "echo".to_string(),
                uts: 42,
            },
            vec![json!("hello")],
        );
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value, json!({"m": {"name": "echo", "uts": 42}, "d": ["hello"]}));
    }

    #[test]
    fn test_envelope_missing_uts_defaults() {
        let env: Envelope = serde_json::from_value(json!({"m": {"name": "x"}, "d": []})).unwrap();
        assert_eq!(env.method.uts, 0);
    }

    #[test]
    fn test_method_meta_now_is_micros() {
        let meta = MethodMeta::now("date");
        // Well past 2001 in microseconds.
        assert!(meta.uts > 1_000_000_000_000_000);
    }

    #[test]
    fn test_error_envelope() {
        let err = RpcError::new("TypeError", "boom")
            .with_stack("stack")
            .with_context("id", 3)
            .with_cause(RpcError::msg("first"))
            .with_cause(RpcError::msg("second"));

        let env = Envelope::error(MethodMeta::now("fail"), &err);
        assert_eq!(env.data["name"], "TypeError");
        assert_eq!(env.data["message"], "boom");
        assert_eq!(env.data["stack"], "stack");
        assert_eq!(env.data["context"]["id"], 3);
        assert_eq!(env.data["ase_errors"][1]["message"], "second");

        let wire: WireError = serde_json::from_value(env.data).unwrap();
        assert_eq!(RpcError::from(wire), err);
    }

    #[test]
    fn test_plain_error_omits_optional_fields() {
        let value = serde_json::to_value(WireError::from(&RpcError::msg("x"))).unwrap();
        assert_eq!(value, json!({"name": "Error", "message": "x"}));
    }

    #[test]
    fn test_wire_error_defaults() {
        let wire: WireError = serde_json::from_value(json!({"message": "only"})).unwrap();
        let err = RpcError::from(wire);
        assert_eq!(err.name, "Error");
        assert_eq!(err.message, "only");
        assert!(err.causes.is_empty());
    }
}
