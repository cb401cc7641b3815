//! Server error types.

use crate::config::ConfigError;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] fastrpc_protocol::ProtocolError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("handler already registered: {0}")]
    DuplicateHandler(String),

    #[error("invalid method name")]
    InvalidMethodName,

    #[error("server shutting down")]
    ShuttingDown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use fastrpc_protocol::ProtocolError;

    #[test]
    fn test_conversions() {
        let io = ServerError::from(std::io::Error::other("reset"));
        assert!(matches!(io, ServerError::Io(_)));

        let proto = ServerError::from(ProtocolError::FrameTooLarge { size: 10, max: 5 });
        assert_eq!(
            proto.to_string(),
            "protocol error: frame too large: 10 bytes (max 5)"
        );
    }

    #[test]
    fn test_display() {
        let err = ServerError::DuplicateHandler("echo".into());
        assert_eq!(err.to_string(), "handler already registered: echo");
    }
}
