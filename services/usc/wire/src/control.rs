//! Control operation codes carried by CONTROL frames.
//!
//! Version 1 of the code table:
//!
//! | Code   | Meaning                                    |
//! |--------|--------------------------------------------|
//! | 0x0001 | open the session, bound to the header port |
//! | 0x0002 | close the session (termination request)    |
//! | 0x0003 | close acknowledged (termination response)  |
//!
//! New codes get new numbers; existing numbers never change meaning.

use serde::{Deserialize, Serialize};

/// Session lifecycle signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlCode {
    /// Open a session
    SessionOpen,
    /// Close a session
    SessionClose,
    /// Acknowledge a close
    SessionCloseAck,
    /// Code outside the table
    Other(u16),
}

impl ControlCode {
    /// Map a wire value to a control code; never fails
    pub fn from_wire_code(code: u16) -> Self {
        match code {
            0x0001 => ControlCode::SessionOpen,
            0x0002 => ControlCode::SessionClose,
            0x0003 => ControlCode::SessionCloseAck,
            other => ControlCode::Other(other),
        }
    }

    /// Wire value for this control code
    pub fn to_wire_code(self) -> u16 {
        match self {
            ControlCode::SessionOpen => 0x0001,
            ControlCode::SessionClose => 0x0002,
            ControlCode::SessionCloseAck => 0x0003,
            ControlCode::Other(code) => code,
        }
    }

    /// Whether this code is part of the table
    pub fn is_known(self) -> bool {
        !matches!(self, ControlCode::Other(_))
    }
}

impl std::fmt::Display for ControlCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlCode::SessionOpen => f.write_str("SESSION_OPEN(1)"),
            ControlCode::SessionClose => f.write_str("SESSION_CLOSE(2)"),
            ControlCode::SessionCloseAck => f.write_str("SESSION_CLOSE_ACK(3)"),
            ControlCode::Other(code) => write!(f, "OTHER({})", code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_is_stable() {
        assert_eq!(ControlCode::from_wire_code(1), ControlCode::SessionOpen);
        assert_eq!(ControlCode::from_wire_code(2), ControlCode::SessionClose);
        assert_eq!(ControlCode::from_wire_code(3), ControlCode::SessionCloseAck);
        assert_eq!(ControlCode::from_wire_code(0), ControlCode::Other(0));
        assert!(!ControlCode::from_wire_code(9).is_known());
        assert_eq!(ControlCode::Other(9).to_wire_code(), 9);
    }
}
