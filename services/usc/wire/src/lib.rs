//! Wire protocol for the unified secure channel.
//!
//! This crate holds the byte-level format shared by both ends of a channel:
//! the fixed header, the typed frame bodies, the control code table and the
//! socket error taxonomy. It knows nothing about sessions or sockets.
//!
//! ## Wire Format
//!
//! ```text
//! +-----------------------+---------------------------------+
//! | u8  op << 4 | version | version 1, op DATA/CONTROL/ERROR|
//! +-----------------------+---------------------------------+
//! | u8  reserved          | must be zero                    |
//! +-----------------------+---------------------------------+
//! | u16 port              | service port on the device      |
//! +-----------------------+---------------------------------+
//! | u32 session id        | logical session                 |
//! +-----------------------+---------------------------------+
//! | u32 payload length    | bytes that follow               |
//! +-----------------------+---------------------------------+
//! | payload               | data, or a u16 code             |
//! +-----------------------+---------------------------------+
//! ```
//!
//! All integers are big-endian. Streams carry frames back to back; a
//! datagram carries exactly one frame.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod control;
pub mod error;
pub mod error_code;
pub mod frame;
pub mod header;

// Re-export main types
pub use codec::FrameCodec;
pub use control::ControlCode;
pub use error::WireError;
pub use error_code::ErrorCode;
pub use frame::{Frame, FrameBody, FrameDecoder, CODE_PAYLOAD_SIZE, DEFAULT_MAX_PAYLOAD};
pub use header::{Header, OperationType, HEADER_SIZE, WIRE_VERSION};
