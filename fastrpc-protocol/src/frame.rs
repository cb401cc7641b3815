//! Binary frame format.
//!
//! Frame layout (15 bytes header + payload):
//!
//! ```text
//! +---------+--------+--------+---------+----------+------------+
//! | version | type   | status | msgid   | checksum | length     |
//! | 1 byte  | 1 byte | 1 byte | 4 bytes | 4 bytes  | 4 bytes    |
//! +---------+--------+--------+---------+----------+------------+
//! | payload (length bytes of UTF-8 JSON)                        |
//! +-------------------------------------------------------------+
//! ```
//!
//! All multi-byte fields are big-endian. The checksum is a CRC-16 of the
//! payload bytes stored widened to 32 bits.

use crate::error::ProtocolError;
use crate::{MAX_PAYLOAD_SIZE, PROTOCOL_VERSION, TYPE_JSON};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the fixed frame header in bytes (1+1+1+4+4+4 = 15).
pub const FRAME_HEADER_SIZE: usize = 15;

/// Per-message status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    /// One item of a (possibly streaming) call or response.
    Data = 0x01,
    /// Final frame of a call; may carry trailing data.
    End = 0x02,
    /// Terminal failure, or a cancellation notice when sent by a client.
    Error = 0x03,
}

impl Status {
    /// Returns whether this status ends a call.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::End | Status::Error)
    }
}

impl TryFrom<u8> for Status {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x01 => Ok(Status::Data),
            0x02 => Ok(Status::End),
            0x03 => Ok(Status::Error),
            other => Err(ProtocolError::InvalidStatus(other)),
        }
    }
}

/// Computes the frame checksum (CRC-16/ARC) of a payload.
pub fn checksum(payload: &[u8]) -> u16 {
    crc16::State::<crc16::ARC>::calculate(payload)
}

/// A parsed frame with its raw payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Protocol version.
    pub version: u8,
    /// Payload encoding.
    pub payload_type: u8,
    /// Message status.
    pub status: Status,
    /// Call identifier.
    pub msgid: u32,
    /// Frame payload (JSON text).
    pub payload: Bytes,
}

impl Frame {
    /// Creates a new JSON frame with the current protocol version.
    pub fn new(msgid: u32, status: Status, payload: Bytes) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            payload_type: TYPE_JSON,
            status,
            msgid,
            payload,
        }
    }

    /// Creates a new frame from a JSON-serializable value.
    pub fn from_json<T: serde::Serialize>(
        msgid: u32,
        status: Status,
        value: &T,
    ) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::new(msgid, status, Bytes::from(payload)))
    }

    /// Encodes the frame into bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Appends the encoded frame to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        if self.payload.len() > MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::FrameTooLarge {
                size: self.payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let length = self.payload.len() as u32;

        buf.reserve(FRAME_HEADER_SIZE + self.payload.len());
        buf.put_u8(self.version);
        buf.put_u8(self.payload_type);
        buf.put_u8(self.status as u8);
        buf.put_u32(self.msgid);
        buf.put_u32(u32::from(checksum(&self.payload)));
        buf.put_u32(length);
        buf.put_slice(&self.payload);

        Ok(())
    }

    /// Decodes a frame from the front of `buf`.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded, `Ok(None)`
    /// if more data is needed, or `Err` on protocol errors. Except for
    /// [`ProtocolError::FrameTooLarge`], an error is returned only after the
    /// whole frame has been consumed, so decoding can resume at the next
    /// frame boundary.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        Ok(Self::decode_checked(buf)?.map(|(frame, _)| frame))
    }

    /// Like [`Frame::decode`], also returning the verified header checksum.
    pub(crate) fn decode_checked(
        buf: &mut BytesMut,
    ) -> Result<Option<(Self, u16)>, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        // Peek at header without consuming
        let version = buf[0];
        let payload_type = buf[1];
        let status_byte = buf[2];
        let msgid = u32::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]);
        let expected = u32::from_be_bytes([buf[7], buf[8], buf[9], buf[10]]);
        let length = u32::from_be_bytes([buf[11], buf[12], buf[13], buf[14]]);

        if length > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: length as usize,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        if buf.len() < FRAME_HEADER_SIZE + length as usize {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(length as usize).freeze();

        let actual = checksum(&payload);
        if expected != u32::from(actual) {
            return Err(ProtocolError::ChecksumMismatch { expected, actual });
        }
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        if payload_type != TYPE_JSON {
            return Err(ProtocolError::UnsupportedType(payload_type));
        }
        let status = Status::try_from(status_byte)?;

        Ok(Some((
            Self {
                version,
                payload_type,
                status,
                msgid,
                payload,
            },
            actual,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let frame = Frame::new(123, Status::Data, Bytes::from(r#"{"hello":"world"}"#));
        let buf = frame.encode().unwrap();

        assert_eq!(buf[0], 0x01); // version
        assert_eq!(buf[1], 0x01); // type
        assert_eq!(buf[2], 0x01); // status
        assert_eq!(u32::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]), 123);
        assert_eq!(
            u32::from_be_bytes([buf[7], buf[8], buf[9], buf[10]]),
            u32::from(checksum(br#"{"hello":"world"}"#))
        );
        assert_eq!(u32::from_be_bytes([buf[11], buf[12], buf[13], buf[14]]), 17);
        assert_eq!(&buf[15..], br#"{"hello":"world"}"#);
    }

    #[test]
    fn test_checksum_is_crc16_arc() {
        // Standard check value for CRC-16/ARC.
        assert_eq!(checksum(b"123456789"), 0xBB3D);
        assert_eq!(checksum(b""), 0);
    }

    #[test]
    fn test_frame_roundtrip() {
        let payload = Bytes::from(r#"{"m":{"name":"echo","uts":1},"d":["hi"]}"#);
        let frame = Frame::new(7, Status::End, payload.clone());

        let mut buf = frame.encode().unwrap();
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_checksum_validation() {
        let frame = Frame::new(1, Status::Data, Bytes::from(r#"{"test":"data"}"#));
        let mut encoded = frame.encode().unwrap();

        // Corrupt the payload
        let len = encoded.len();
        encoded[len - 2] ^= 0xFF;

        let result = Frame::decode(&mut encoded);
        assert!(matches!(result, Err(ProtocolError::ChecksumMismatch { .. })));
        // The bad frame was consumed
        assert!(encoded.is_empty());
    }

    #[test]
    fn test_incomplete_frame() {
        let frame = Frame::new(1, Status::Data, Bytes::from(r#"{"a":1}"#));
        let encoded = frame.encode().unwrap();

        let mut buf = BytesMut::from(&encoded[..10]);
        assert!(Frame::decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 10);

        let mut buf = BytesMut::from(&encoded[..encoded.len() - 1]);
        assert!(Frame::decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), encoded.len() - 1);
    }

    #[test]
    fn test_invalid_status_consumes_frame() {
        let frame = Frame::new(1, Status::Data, Bytes::from("{}"));
        let mut encoded = frame.encode().unwrap();
        encoded[2] = 0x09;

        let result = Frame::decode(&mut encoded);
        assert!(matches!(result, Err(ProtocolError::InvalidStatus(0x09))));
        assert!(encoded.is_empty());
    }

    #[test]
    fn test_unsupported_version() {
        let mut frame = Frame::new(1, Status::Data, Bytes::from("{}"));
        frame.version = 99;
        let mut encoded = frame.encode().unwrap();

        let result = Frame::decode(&mut encoded);
        assert!(matches!(result, Err(ProtocolError::UnsupportedVersion(99))));
    }

    #[test]
    fn test_frame_too_large() {
        let huge_payload = vec![b' '; (MAX_PAYLOAD_SIZE + 1) as usize];
        let frame = Frame::new(1, Status::Data, Bytes::from(huge_payload));
        match frame.encode() {
            Err(ProtocolError::FrameTooLarge { size, max }) => {
                assert_eq!(size, MAX_PAYLOAD_SIZE as usize + 1);
                assert_eq!(max, MAX_PAYLOAD_SIZE);
            }
            other => panic!("unexpected: {:?}", other),
        }

        let mut header = BytesMut::new();
        header.put_u8(PROTOCOL_VERSION);
        header.put_u8(TYPE_JSON);
        header.put_u8(Status::Data as u8);
        header.put_u32(1);
        header.put_u32(0);
        header.put_u32(MAX_PAYLOAD_SIZE + 1);
        let result = Frame::decode(&mut header);
        assert!(matches!(
            result,
            Err(ProtocolError::FrameTooLarge { size, .. }) if size == MAX_PAYLOAD_SIZE as usize + 1
        ));
    }

    #[test]
    fn test_multiple_frames_in_buffer() {
        let frame1 = Frame::new(1, Status::Data, Bytes::from(r#"{"id":"1"}"#));
        let frame2 = Frame::new(2, Status::End, Bytes::from(r#"{"id":"2"}"#));

        let mut buf = BytesMut::new();
        frame1.encode_into(&mut buf).unwrap();
        frame2.encode_into(&mut buf).unwrap();

        assert_eq!(Frame::decode(&mut buf).unwrap().unwrap(), frame1);
        assert_eq!(Frame::decode(&mut buf).unwrap().unwrap(), frame2);
        assert!(Frame::decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_status_conversion() {
        assert_eq!(Status::try_from(1).unwrap(), Status::Data);
        assert_eq!(Status::try_from(2).unwrap(), Status::End);
        assert_eq!(Status::try_from(3).unwrap(), Status::Error);
        assert!(Status::try_from(0).is_err());

        assert!(!Status::Data.is_terminal());
        assert!(Status::End.is_terminal());
        assert!(Status::Error.is_terminal());
    }
}
