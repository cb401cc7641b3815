//! Protocol error types and the call-level error carried over the wire.

use serde_json::{Map, Value};
use thiserror::Error;

/// Protocol-level errors that can occur during framing or message handling.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("unsupported payload type: {0}")]
    UnsupportedType(u8),

    #[error("invalid message status: {0:#x}")]
    InvalidStatus(u8),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: u32 },

    #[error("checksum mismatch: header carries {expected:#x}, calculated {actual:#x}")]
    ChecksumMismatch { expected: u32, actual: u16 },

    #[error("invalid UTF-8 in payload")]
    InvalidUtf8,

    #[error("invalid payload content: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed message: {0}")]
    MalformedMessage(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Returns whether the error leaves the byte stream unusable.
    ///
    /// Frame-scoped errors have already consumed the offending frame, so the
    /// decoder can keep going with the next one.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProtocolError::FrameTooLarge { .. } | ProtocolError::Io(_))
    }
}

/// Error name used when a call is canceled locally or by the peer.
pub const CANCELED_ERROR: &str = "RpcCanceledError";

/// Error name used when the server has no handler for a method.
pub const NO_HANDLER_ERROR: &str = "NoHandlerError";

/// Error name used for handler faults caught by the server.
pub const INTERNAL_ERROR: &str = "InternalError";

/// A call-level error.
///
/// This is what a handler reports to its caller and what a caller receives
/// when a call fails remotely. It maps one-to-one onto the wire error object.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{name}: {message}")]
pub struct RpcError {
    /// Error kind, e.g. `"RpcCanceledError"`.
    pub name: String,
    /// Human-readable message.
    pub message: String,
    /// Optional stack or backtrace text.
    pub stack: Option<String>,
    /// Structured context attached by the reporter.
    pub context: Map<String, Value>,
    /// Nested causes for errors that aggregate several failures.
    pub causes: Vec<RpcError>,
}

impl RpcError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            context: Map::new(),
            causes: Vec::new(),
        }
    }

    /// A plain `Error` with the given message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new("Error", message)
    }

    /// The generic cancellation error.
    pub fn canceled() -> Self {
        Self::new(CANCELED_ERROR, "RPC canceled")
    }

    pub fn no_handler(method: &str) -> Self {
        Self::new(NO_HANDLER_ERROR, format!("no handler for {}", method))
            .with_context("method", method)
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_cause(mut self, cause: RpcError) -> Self {
        self.causes.push(cause);
        self
    }

    /// Returns whether this error reports a cancellation.
    pub fn is_canceled(&self) -> bool {
        self.name == CANCELED_ERROR
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_fatality() {
        assert!(ProtocolError::FrameTooLarge { size: 10, max: 5 }.is_fatal());
        assert!(ProtocolError::Io(std::io::Error::other("boom")).is_fatal());

        assert!(!ProtocolError::ChecksumMismatch {
            expected: 1,
            actual: 2
        }
        .is_fatal());
        assert!(!ProtocolError::InvalidUtf8.is_fatal());
        assert!(!ProtocolError::InvalidStatus(9).is_fatal());
        assert!(!ProtocolError::MalformedMessage("missing m").is_fatal());
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::UnsupportedVersion(99);
        assert!(err.to_string().contains("99"));

        let err = ProtocolError::ChecksumMismatch {
            expected: 0xABC,
            actual: 0xDEF,
        };
        let msg = err.to_string();
        assert!(msg.contains("abc") && msg.contains("def"));

        let err = ProtocolError::InvalidStatus(0xFF);
        assert!(err.to_string().contains("ff"));

        let err = ProtocolError::MalformedMessage("missing method");
        assert!(err.to_string().contains("missing method"));
    }

    #[test]
    fn test_rpc_error_builders() {
        let err = RpcError::new("ValidationError", "bad input")
            .with_stack("at handler")
            .with_context("field", "name")
            .with_cause(RpcError::msg("inner"));

        assert_eq!(err.to_string(), "ValidationError: bad input");
        assert_eq!(err.stack.as_deref(), Some("at handler"));
        assert_eq!(err.context["field"], "name");
        assert_eq!(err.causes.len(), 1);
        assert!(!err.is_canceled());
    }

    #[test]
    fn test_rpc_error_kinds() {
        assert!(RpcError::canceled().is_canceled());
        assert_eq!(RpcError::canceled().message, "RPC canceled");

        let err = RpcError::no_handler("echo");
        assert_eq!(err.name, NO_HANDLER_ERROR);
        assert_eq!(err.context["method"], "echo");
    }
}
