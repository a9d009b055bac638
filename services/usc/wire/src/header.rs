//! Fixed header processing for the wire protocol.
//!
//! Every frame starts with a 12-byte header that carries everything needed
//! to route the payload to a session without looking at the payload itself.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

/// Wire protocol version
pub const WIRE_VERSION: u8 = 1;

/// Header size in bytes
pub const HEADER_SIZE: usize = 12;

/// Offset of the payload length field inside the header
pub const PAYLOAD_LENGTH_OFFSET: usize = 8;

/// Operation types as defined in the wire protocol
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    /// Application bytes for a session
    Data = 1,
    /// Session lifecycle signal
    Control = 2,
    /// Error code reported by the peer
    Error = 3,
}

impl OperationType {
    /// Short name used in logs and errors
    pub fn as_str(self) -> &'static str {
        match self {
            OperationType::Data => "DATA",
            OperationType::Control => "CONTROL",
            OperationType::Error => "ERROR",
        }
    }
}

impl TryFrom<u8> for OperationType {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, crate::WireError> {
        match value {
            1 => Ok(OperationType::Data),
            2 => Ok(OperationType::Control),
            3 => Ok(OperationType::Error),
            _ => Err(crate::WireError::Type(value)),
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header structure (12 bytes)
///
/// ```text
///  byte 0      byte 1     bytes 2..4   bytes 4..8    bytes 8..12
/// +----+----+----------+------------+-------------+----------------+
/// | op | ver| reserved | app port   | session id  | payload length |
/// +----+----+----------+------------+-------------+----------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Protocol version (must be 1)
    pub version: u8,
    /// Operation type
    pub op: OperationType,
    /// Destination service port on the device
    pub port: u16,
    /// Session this frame belongs to
    pub session_id: u32,
    /// Number of payload bytes following the header
    pub payload_len: u32,
}

impl Header {
    /// Create a header for the current wire version
    pub fn new(op: OperationType, port: u16, session_id: u32, payload_len: u32) -> Self {
        Self {
            version: WIRE_VERSION,
            op,
            port,
            session_id,
            payload_len,
        }
    }

    /// Encode the header to bytes (big-endian)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8((self.version & 0x0F) | ((self.op as u8) << 4));
        buf.put_u8(0);
        buf.put_u16(self.port);
        buf.put_u32(self.session_id);
        buf.put_u32(self.payload_len);
    }

    /// Decode the header from the first [`HEADER_SIZE`] bytes of `buf`
    ///
    /// Returns `Ok(None)` when fewer than [`HEADER_SIZE`] bytes are present.
    /// The input is never consumed.
    pub fn peek(buf: &[u8]) -> Result<Option<Self>, crate::WireError> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let mut cursor = &buf[..HEADER_SIZE];
        let byte0 = cursor.get_u8();
        let version = byte0 & 0x0F;
        if version != WIRE_VERSION {
            return Err(crate::WireError::Version(version));
        }

        let op = OperationType::try_from(byte0 >> 4)?;

        if cursor.get_u8() != 0 {
            return Err(crate::WireError::Reserved);
        }

        let port = cursor.get_u16();
        let session_id = cursor.get_u32();
        let payload_len = cursor.get_u32();

        Ok(Some(Self {
            version,
            op,
            port,
            session_id,
            payload_len,
        }))
    }
}
