//! Encoder and decoder for frames and messages.

use crate::error::ProtocolError;
use crate::frame::{Frame, Status};
use crate::message::{Envelope, Message};
use bytes::{Bytes, BytesMut};
use chrono::Utc;

/// Encodes envelopes into frames.
pub struct Encoder;

impl Encoder {
    /// Encodes a call or response envelope into a frame.
    pub fn encode_envelope(
        msgid: u32,
        status: Status,
        envelope: &Envelope,
    ) -> Result<BytesMut, ProtocolError> {
        Self::encode_json(msgid, status, envelope)
    }

    /// Encodes any JSON-serializable value into a frame.
    pub fn encode_json<T: serde::Serialize>(
        msgid: u32,
        status: Status,
        value: &T,
    ) -> Result<BytesMut, ProtocolError> {
        let frame = Frame::from_json(msgid, status, value)?;
        frame.encode()
    }
}

/// Reassembles frames from a byte stream and parses them into messages.
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Appends bytes to the internal buffer.
    pub fn extend_bytes(&mut self, data: Bytes) {
        self.buffer.extend_from_slice(&data);
    }

    /// Attempts to decode the next frame from the buffer.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        Frame::decode(&mut self.buffer)
    }

    /// Attempts to decode the next message from the buffer.
    ///
    /// A frame-scoped error (see [`ProtocolError::is_fatal`]) means that one
    /// frame was dropped; calling again continues with the next frame.
    pub fn decode_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        let Some((frame, checksum)) = Frame::decode_checked(&mut self.buffer)? else {
            return Ok(None);
        };

        let text = std::str::from_utf8(&frame.payload).map_err(|_| ProtocolError::InvalidUtf8)?;
        let data = serde_json::from_str(text)?;

        Ok(Some(Message {
            version: frame.version,
            payload_type: frame.payload_type,
            status: frame.status,
            msgid: frame.msgid,
            checksum,
            length: frame.payload.len() as u32,
            data,
            received_at: Utc::now(),
        }))
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
