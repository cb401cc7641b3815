//! Client error types.

use fastrpc_protocol::{ProtocolError, RpcError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Client errors.
///
/// Cloneable so the same failure can be handed to several calls and to event
/// subscribers.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("protocol error: {0}")]
    Protocol(Arc<ProtocolError>),

    #[error("no connection")]
    NotConnected,

    #[error("the underlying connection has been closed")]
    ConnectionClosed,

    #[error("failed to establish connection after {}ms", .0.as_millis())]
    ConnectTimeout(Duration),

    #[error("failed to resolve {host}: {reason}")]
    Resolve { host: String, reason: String },

    #[error("unsolicited message for msgid {0}")]
    UnsolicitedMessage(u32),

    #[error("remote error: {0}")]
    Remote(RpcError),

    #[error("call canceled: {0}")]
    Canceled(RpcError),
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Io(Arc::new(err))
    }
}

impl From<ProtocolError> for ClientError {
    fn from(err: ProtocolError) -> Self {
        ClientError::Protocol(Arc::new(err))
    }
}

impl ClientError {
    /// Returns the error kind name as reported to applications.
    pub fn name(&self) -> &str {
        match self {
            ClientError::Io(_) => "IOError",
            ClientError::Protocol(_) => "ProtocolError",
            ClientError::NotConnected => "NoConnectionError",
            ClientError::ConnectionClosed => "ConnectionClosedError",
            ClientError::ConnectTimeout(_) => "ConnectionTimeoutError",
            ClientError::Resolve { .. } => "DNSError",
            ClientError::UnsolicitedMessage(_) => "UnsolicitedMessageError",
            ClientError::Remote(err) | ClientError::Canceled(err) => &err.name,
        }
    }

    /// Returns whether a fresh connection attempt may get past this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_)
                | ClientError::ConnectTimeout(_)
                | ClientError::Resolve { .. }
                | ClientError::ConnectionClosed
                | ClientError::NotConnected
        )
    }

    /// Returns the remote error, if the call failed on the server.
    pub fn remote(&self) -> Option<&RpcError> {
        match self {
            ClientError::Remote(err) => Some(err),
            _ => None,
        }
    }
}
