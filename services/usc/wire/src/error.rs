//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
///
/// Apart from [`WireError::Io`], every variant means the byte stream can no
/// longer be trusted and the channel carrying it must be torn down.
#[derive(Error, Debug)]
pub enum WireError {
    /// Datagram shorter than the frame it announces
    #[error("incomplete frame")]
    Incomplete,

    /// Unsupported protocol version
    #[error("version unsupported: {0}")]
    Version(u8),

    /// Unknown operation type in the header
    #[error("unknown operation type {0}")]
    Type(u8),

    /// Reserved byte nonzero
    #[error("reserved bits nonzero")]
    Reserved,

    /// Payload larger than the configured limit
    #[error("payload size {size} exceeds limit {max}")]
    Size {
        /// Announced payload size
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// Control or error frame whose payload is not a 2-byte code
    #[error("{op} frame carries {len} payload bytes, expected 2")]
    CodeLength {
        /// Operation type name
        op: &'static str,
        /// Announced payload length
        len: usize,
    },

    /// Trailing bytes after a frame in a datagram
    #[error("malformed frame")]
    Malformed,

    /// I/O failure underneath a framed stream
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl WireError {
    /// Whether this error means the peer is out of sync with us
    pub fn is_desync(&self) -> bool {
        !matches!(self, WireError::Io(_))
    }
}
