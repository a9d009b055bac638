//! Error taxonomy carried by ERROR frames.
//!
//! The codes are a subset of the POSIX errno values for socket failures. Any
//! other 16-bit value is valid on the wire and maps to [`ErrorCode::Other`],
//! which keeps the raw value so it can be reported and re-encoded unchanged.
//!
//! Codes compare by wire value, so `Other(11)` equals `Again`.

use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::io;

/// Socket-level error conditions reported between peers
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Resource temporarily unavailable
    Again,
    /// Broken pipe
    BrokenPipe,
    /// Address already in use
    AddrInUse,
    /// Network is down
    NetDown,
    /// Network is unreachable
    NetUnreachable,
    /// Network dropped connection on reset
    NetReset,
    /// Software caused connection abort
    ConnAborted,
    /// Connection reset by peer
    ConnReset,
    /// Transport endpoint is already connected
    IsConnected,
    /// Transport endpoint is not connected
    NotConnected,
    /// Cannot send after transport endpoint shutdown
    Shutdown,
    /// Connection timed out
    TimedOut,
    /// Connection refused
    ConnRefused,
    /// Any code outside the named set
    Other(u16),
}

const NAMED: [(ErrorCode, u16, &str); 13] = [
    (ErrorCode::Again, 11, "EAGAIN"),
    (ErrorCode::BrokenPipe, 32, "EPIPE"),
    (ErrorCode::AddrInUse, 98, "EADDRINUSE"),
    (ErrorCode::NetDown, 100, "ENETDOWN"),
    (ErrorCode::NetUnreachable, 101, "ENETUNREACH"),
    (ErrorCode::NetReset, 102, "ENETRESET"),
    (ErrorCode::ConnAborted, 103, "ECONNABORTED"),
    (ErrorCode::ConnReset, 104, "ECONNRESET"),
    (ErrorCode::IsConnected, 106, "EISCONN"),
    (ErrorCode::NotConnected, 107, "ENOTCONN"),
    (ErrorCode::Shutdown, 108, "ESHUTDOWN"),
    (ErrorCode::TimedOut, 110, "ETIMEDOUT"),
    (ErrorCode::ConnRefused, 111, "ECONNREFUSED"),
];

impl ErrorCode {
    /// Map a wire value to a condition; never fails
    pub fn from_wire_code(code: u16) -> Self {
        NAMED
            .iter()
            .find(|(_, wire, _)| *wire == code)
            .map(|(named, _, _)| *named)
            .unwrap_or(ErrorCode::Other(code))
    }

    /// Wire value for this condition
    pub const fn to_wire_code(self) -> u16 {
        match self {
            ErrorCode::Again => 11,
            ErrorCode::BrokenPipe => 32,
            ErrorCode::AddrInUse => 98,
            ErrorCode::NetDown => 100,
            ErrorCode::NetUnreachable => 101,
            ErrorCode::NetReset => 102,
            ErrorCode::ConnAborted => 103,
            ErrorCode::ConnReset => 104,
            ErrorCode::IsConnected => 106,
            ErrorCode::NotConnected => 107,
            ErrorCode::Shutdown => 108,
            ErrorCode::TimedOut => 110,
            ErrorCode::ConnRefused => 111,
            ErrorCode::Other(code) => code,
        }
    }

    /// The same condition with named wire values in their named form
    pub fn normalized(self) -> Self {
        Self::from_wire_code(self.to_wire_code())
    }

    /// errno-style name, `E_OTHER` for unnamed codes
    pub fn name(self) -> &'static str {
        let code = self.to_wire_code();
        NAMED
            .iter()
            .find(|(_, wire, _)| *wire == code)
            .map(|(_, _, name)| *name)
            .unwrap_or("E_OTHER")
    }

    /// Classify a local I/O failure so it can be reported to the peer
    pub fn from_io_error(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => ErrorCode::Again,
            io::ErrorKind::BrokenPipe => ErrorCode::BrokenPipe,
            io::ErrorKind::AddrInUse => ErrorCode::AddrInUse,
            io::ErrorKind::ConnectionAborted => ErrorCode::ConnAborted,
            io::ErrorKind::ConnectionReset => ErrorCode::ConnReset,
            io::ErrorKind::NotConnected => ErrorCode::NotConnected,
            io::ErrorKind::TimedOut => ErrorCode::TimedOut,
            io::ErrorKind::ConnectionRefused => ErrorCode::ConnRefused,
            io::ErrorKind::UnexpectedEof => ErrorCode::Shutdown,
            _ => err
                .raw_os_error()
                .and_then(|raw| u16::try_from(raw).ok())
                .map(ErrorCode::from_wire_code)
                .unwrap_or(ErrorCode::Other(0)),
        }
    }
}

impl PartialEq for ErrorCode {
    fn eq(&self, other: &Self) -> bool {
        self.to_wire_code() == other.to_wire_code()
    }
}

impl Eq for ErrorCode {}

impl Hash for ErrorCode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_wire_code().hash(state);
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.to_wire_code(), self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_codes_are_exact() {
        for (named, wire, _) in NAMED {
            assert_eq!(ErrorCode::from_wire_code(wire), named);
            assert_eq!(named.to_wire_code(), wire);
        }
    }

    #[test]
    fn test_every_u16_maps_and_reencodes() {
        for code in 0..=u16::MAX {
            assert_eq!(ErrorCode::from_wire_code(code).to_wire_code(), code);
        }
    }

    #[test]
    fn test_unknown_codes_are_other() {
        assert_eq!(ErrorCode::from_wire_code(0), ErrorCode::Other(0));
        assert_eq!(ErrorCode::from_wire_code(12), ErrorCode::Other(12));
        assert_eq!(ErrorCode::from_wire_code(u16::MAX), ErrorCode::Other(u16::MAX));
        assert_eq!(ErrorCode::Other(12).name(), "E_OTHER");
    }

    #[test]
    fn test_other_holding_named_value_equals_named() {
        assert_eq!(ErrorCode::Other(11), ErrorCode::Again);
        assert_eq!(ErrorCode::Other(11).normalized(), ErrorCode::Again);
        assert!(matches!(ErrorCode::Other(11).normalized(), ErrorCode::Again));
        assert_eq!(ErrorCode::Other(11).name(), "EAGAIN");
        assert_ne!(ErrorCode::Other(12), ErrorCode::Again);

        let mut seen = std::collections::HashSet::new();
        seen.insert(ErrorCode::ConnReset);
        assert!(seen.contains(&ErrorCode::Other(104)));
    }

    #[test]
    fn test_display() {
        assert_eq!(ErrorCode::ConnReset.to_string(), "104=ECONNRESET");
        assert_eq!(ErrorCode::Other(7).to_string(), "7=E_OTHER");
    }

    #[test]
    fn test_from_io_error() {
        let err = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(ErrorCode::from_io_error(&err), ErrorCode::ConnRefused);

        let err = io::Error::from(io::ErrorKind::BrokenPipe);
        assert_eq!(ErrorCode::from_io_error(&err), ErrorCode::BrokenPipe);

        let err = io::Error::new(io::ErrorKind::Other, "boom");
        assert_eq!(ErrorCode::from_io_error(&err), ErrorCode::Other(0));
    }
}
