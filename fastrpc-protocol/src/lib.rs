//! # fastrpc-protocol
//!
//! Wire protocol implementation for fastrpc.
//!
//! This crate provides:
//! - Binary framing with a fixed 15-byte header and CRC-16 payload validation
//! - Stream reassembly that survives partial and coalesced reads
//! - JSON call envelopes and the wire error object
//! - The per-call RPC encoder and the message router used by both peers

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod rpc;

pub use codec::{Decoder, Encoder};
pub use error::{ProtocolError, RpcError, CANCELED_ERROR, INTERNAL_ERROR, NO_HANDLER_ERROR};
pub use frame::{checksum, Frame, Status, FRAME_HEADER_SIZE};
pub use message::{Envelope, Message, MethodMeta, WireError};
pub use rpc::{route, Completion, FrameSink, RoutedBody, RoutedMessage, RpcEncoder};

/// Protocol version written into every frame.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Payload encoding: JSON text.
pub const TYPE_JSON: u8 = 0x01;

/// Message ids wrap back to 1 before reaching this value; 0 is never issued.
pub const MAX_MSGID: u32 = (1 << 31) - 1;

/// Default port for a fastrpc server.
pub const DEFAULT_PORT: u16 = 2020;

/// Maximum frame payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Returns the identifier that follows `current`, skipping 0 and wrapping at
/// [`MAX_MSGID`].
pub fn next_msgid(current: u32) -> u32 {
    let next = current.wrapping_add(1);
    if next == 0 || next >= MAX_MSGID {
        1
    } else {
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_msgid_starts_at_one() {
        assert_eq!(next_msgid(0), 1);
        assert_eq!(next_msgid(1), 2);
    }

    #[test]
    fn test_next_msgid_wraps() {
        assert_eq!(next_msgid(MAX_MSGID - 2), MAX_MSGID - 1);
        assert_eq!(next_msgid(MAX_MSGID - 1), 1);
        assert_eq!(next_msgid(u32::MAX), 1);
    }
}
