//! Message framing for the wire protocol.
//!
//! A frame is a [`Header`] followed by exactly `payload_len` payload bytes.
//! DATA frames carry opaque application bytes; CONTROL and ERROR frames carry
//! a single big-endian 16-bit code.

use crate::control::ControlCode;
use crate::error_code::ErrorCode;
use crate::header::{Header, OperationType, HEADER_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

/// Default maximum payload size (16 MiB)
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Size of the code carried by CONTROL and ERROR frames
pub const CODE_PAYLOAD_SIZE: usize = 2;

/// Typed payload of a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameBody {
    /// Application bytes
    Data(Bytes),
    /// Session lifecycle signal
    Control(ControlCode),
    /// Error reported by the peer
    Error(ErrorCode),
}

/// Complete wire frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Destination service port on the device
    pub port: u16,
    /// Session the frame belongs to
    pub session_id: u32,
    /// Payload
    pub body: FrameBody,
}

impl Frame {
    /// Create a DATA frame
    pub fn data(port: u16, session_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            port,
            session_id,
            body: FrameBody::Data(payload.into()),
        }
    }

    /// Create a CONTROL frame
    pub fn control(port: u16, session_id: u32, code: ControlCode) -> Self {
        Self {
            port,
            session_id,
            body: FrameBody::Control(code),
        }
    }

    /// Create an ERROR frame
    pub fn error(port: u16, session_id: u32, code: ErrorCode) -> Self {
        Self {
            port,
            session_id,
            body: FrameBody::Error(code),
        }
    }

    /// Operation type of this frame
    pub fn op(&self) -> OperationType {
        match self.body {
            FrameBody::Data(_) => OperationType::Data,
            FrameBody::Control(_) => OperationType::Control,
            FrameBody::Error(_) => OperationType::Error,
        }
    }

    /// Number of payload bytes on the wire
    pub fn payload_len(&self) -> usize {
        match &self.body {
            FrameBody::Data(payload) => payload.len(),
            FrameBody::Control(_) | FrameBody::Error(_) => CODE_PAYLOAD_SIZE,
        }
    }

    /// Get the total frame size when encoded
    pub fn encoded_size(&self) -> usize {
        HEADER_SIZE + self.payload_len()
    }

    /// Append the encoded frame to `buf`
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), crate::WireError> {
        let payload_len = self.payload_len();
        let wire_len = u32::try_from(payload_len).map_err(|_| crate::WireError::Size {
            size: payload_len,
            max: u32::MAX as usize,
        })?;

        buf.reserve(HEADER_SIZE + payload_len);
        Header::new(self.op(), self.port, self.session_id, wire_len).encode(buf);

        match &self.body {
            FrameBody::Data(payload) => buf.put_slice(payload),
            FrameBody::Control(code) => buf.put_u16(code.to_wire_code()),
            FrameBody::Error(code) => buf.put_u16(code.to_wire_code()),
        }

        Ok(())
    }

    /// Encode frame to a contiguous buffer
    pub fn encode(&self) -> Result<Bytes, crate::WireError> {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode a datagram that must hold exactly one frame
    pub fn decode_datagram(datagram: &[u8], max_payload: usize) -> Result<Self, crate::WireError> {
        let header = Header::peek(datagram)?.ok_or(crate::WireError::Incomplete)?;
        let payload_len = checked_payload_len(&header, max_payload)?;

        let rest = &datagram[HEADER_SIZE..];
        if rest.len() < payload_len {
            return Err(crate::WireError::Incomplete);
        }
        if rest.len() > payload_len {
            return Err(crate::WireError::Malformed);
        }

        Self::from_parts(header, Bytes::copy_from_slice(rest))
    }

    fn from_parts(header: Header, mut payload: Bytes) -> Result<Self, crate::WireError> {
        let body = match header.op {
            OperationType::Data => FrameBody::Data(payload),
            OperationType::Control => FrameBody::Control(ControlCode::from_wire_code(payload.get_u16())),
            OperationType::Error => FrameBody::Error(ErrorCode::from_wire_code(payload.get_u16())),
        };

        Ok(Self {
            port: header.port,
            session_id: header.session_id,
            body,
        })
    }
}

fn checked_payload_len(header: &Header, max_payload: usize) -> Result<usize, crate::WireError> {
    let payload_len = header.payload_len as usize;

    if payload_len > max_payload {
        return Err(crate::WireError::Size {
            size: payload_len,
            max: max_payload,
        });
    }

    if header.op != OperationType::Data && payload_len != CODE_PAYLOAD_SIZE {
        return Err(crate::WireError::CodeLength {
            op: header.op.as_str(),
            len: payload_len,
        });
    }

    Ok(payload_len)
}

/// Frame decoder for parsing incoming byte streams
#[derive(Debug)]
pub struct FrameDecoder {
    max_payload: usize,
}

impl FrameDecoder {
    /// Create a new frame decoder
    pub fn new() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }

    /// Create a decoder with a custom payload limit
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self { max_payload }
    }

    /// Payload limit of this decoder
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Decode one frame from a buffer
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched if it does not yet hold a
    /// complete frame.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, crate::WireError> {
        let header = match Header::peek(buf)? {
            Some(header) => header,
            None => return Ok(None),
        };

        let payload_len = checked_payload_len(&header, self.max_payload)?;

        // Check if we have the complete frame
        let total = HEADER_SIZE + payload_len;
        if buf.len() < total {
            buf.reserve(total - buf.len());
            return Ok(None);
        }

        buf.advance(HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        trace!(
            "Decoded {} frame for session {} ({} payload bytes)",
            header.op,
            header.session_id,
            payload_len
        );

        Frame::from_parts(header, payload).map(Some)
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WireError;

    fn samples() -> Vec<Frame> {
        vec![
            Frame::data(8080, 1, Bytes::from_static(b"ping")),
            Frame::data(22, u32::MAX, Bytes::new()),
            Frame::control(830, 7, ControlCode::SessionOpen),
            Frame::control(830, 7, ControlCode::Other(0xBEEF)),
            Frame::error(161, 3, ErrorCode::ConnRefused),
            Frame::error(161, 0, ErrorCode::Other(4242)),
            Frame::error(161, 0, ErrorCode::Other(11)),
        ]
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut decoder = FrameDecoder::new();
        for frame in samples() {
            let encoded = frame.encode().unwrap();
            assert_eq!(encoded.len(), frame.encoded_size());

            let mut buf = BytesMut::from(encoded.as_ref());
            let decoded = decoder.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, frame);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_prefix_needs_more_data() {
        let mut decoder = FrameDecoder::new();
        for frame in samples() {
            let encoded = frame.encode().unwrap();
            for cut in 0..encoded.len() {
                let mut buf = BytesMut::from(&encoded[..cut]);
                assert_eq!(decoder.decode(&mut buf).unwrap(), None);
                assert_eq!(buf.len(), cut, "prefix must not be consumed");
            }
        }
    }

    #[test]
    fn test_resume_after_more_bytes() {
        let frame = Frame::data(8080, 5, Bytes::from_static(b"hello world"));
        let encoded = frame.encode().unwrap();

        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::from(&encoded[..HEADER_SIZE + 3]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded[HEADER_SIZE + 3..]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(frame));
    }

    #[test]
    fn test_multiple_frames() {
        let mut buf = BytesMut::new();
        Frame::control(80, 1, ControlCode::SessionOpen)
            .encode_into(&mut buf)
            .unwrap();
        Frame::data(80, 1, Bytes::from_static(b"GET /"))
            .encode_into(&mut buf)
            .unwrap();

        let mut decoder = FrameDecoder::new();
        let first = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.op(), OperationType::Control);
        let second = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.body, FrameBody::Data(Bytes::from_static(b"GET /")));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_invalid_operation_type_is_fatal() {
        let mut buf = BytesMut::from(
            Frame::data(80, 1, Bytes::from_static(b"x"))
                .encode()
                .unwrap()
                .as_ref(),
        );
        buf[0] = 0x01 | (9 << 4);

        let result = FrameDecoder::new().decode(&mut buf);
        assert!(matches!(result, Err(WireError::Type(9))));
    }

    #[test]
    fn test_payload_too_large() {
        let mut buf = BytesMut::new();
        Header::new(OperationType::Data, 80, 1, 1024).encode(&mut buf);

        let result = FrameDecoder::with_max_payload(512).decode(&mut buf);
        assert!(matches!(result, Err(WireError::Size { size: 1024, max: 512 })));
    }

    #[test]
    fn test_control_with_wrong_length() {
        let mut buf = BytesMut::new();
        Header::new(OperationType::Control, 80, 1, 4).encode(&mut buf);
        buf.put_u32(1);

        let result = FrameDecoder::new().decode(&mut buf);
        assert!(matches!(result, Err(WireError::CodeLength { len: 4, .. })));
    }

    #[test]
    fn test_datagram_decode() {
        let frame = Frame::data(161, 2, Bytes::from_static(b"get-request"));
        let encoded = frame.encode().unwrap();

        assert_eq!(
            Frame::decode_datagram(&encoded, DEFAULT_MAX_PAYLOAD).unwrap(),
            frame
        );
        assert!(matches!(
            Frame::decode_datagram(&encoded[..encoded.len() - 1], DEFAULT_MAX_PAYLOAD),
            Err(WireError::Incomplete)
        ));

        let mut padded = BytesMut::from(encoded.as_ref());
        padded.put_u8(0);
        assert!(matches!(
            Frame::decode_datagram(&padded, DEFAULT_MAX_PAYLOAD),
            Err(WireError::Malformed)
        ));
    }
}
