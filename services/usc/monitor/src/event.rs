//! Monitor event model.
//!
//! Events are immutable records of a channel or session state change. They
//! are created at the moment of the change and handed to the dispatcher by
//! value; listeners receive them behind an `Arc`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use usc_wire::ErrorCode;
use uuid::Uuid;

/// Physical transport of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransportType {
    /// Plain TCP
    Tcp,
    /// Plain UDP
    Udp,
    /// TCP wrapped in TLS
    Tls,
    /// UDP wrapped in DTLS
    Dtls,
}

impl TransportType {
    /// Whether frames travel in datagrams rather than a byte stream
    pub fn is_datagram(self) -> bool {
        matches!(self, TransportType::Udp | TransportType::Dtls)
    }

    /// Whether the transport is encrypted
    pub fn is_secure(self) -> bool {
        matches!(self, TransportType::Tls | TransportType::Dtls)
    }

    /// Upper-case name
    pub fn as_str(self) -> &'static str {
        match self {
            TransportType::Tcp => "TCP",
            TransportType::Udp => "UDP",
            TransportType::Tls => "TLS",
            TransportType::Dtls => "DTLS",
        }
    }
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransportType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(TransportType::Tcp),
            "udp" => Ok(TransportType::Udp),
            "tls" => Ok(TransportType::Tls),
            "dtls" => Ok(TransportType::Dtls),
            other => Err(format!("unknown transport type: {}", other)),
        }
    }
}

/// Which entity an event describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventCategory {
    /// The physical channel
    Channel,
    /// A logical session on a channel
    Session,
}

/// Severity attached to error events
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ErrorLevel {
    /// Not classified
    Unknown,
    /// Recoverable, the channel stays up
    Warning,
    /// Operation failed
    Error,
    /// The channel was torn down
    Critical,
}

/// Details of a reported error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Unique id of this occurrence
    pub error_id: Uuid,
    /// Taxonomy code
    pub error_code: ErrorCode,
    /// Severity
    pub level: ErrorLevel,
    /// Human-readable description
    pub message: String,
}

impl ErrorInfo {
    /// Create error details with a fresh id
    pub fn new(error_code: ErrorCode, level: ErrorLevel, message: impl Into<String>) -> Self {
        Self {
            error_id: Uuid::new_v4(),
            error_code,
            level,
            message: message.into(),
        }
    }
}

/// Concrete event variants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// A channel was established
    ChannelCreate {
        /// Device dialled in to us
        call_home: bool,
        /// Transport of the channel
        channel_type: TransportType,
    },
    /// A channel was closed
    ChannelClose,
    /// A channel-level error occurred
    ChannelError(ErrorInfo),
    /// A session was opened
    SessionCreate {
        /// Session id
        session_id: u32,
        /// Application port
        port: u16,
    },
    /// A session was closed
    SessionClose {
        /// Session id
        session_id: u32,
    },
    /// A session-level error occurred
    SessionError {
        /// Session id
        session_id: u32,
        /// Error details
        error: ErrorInfo,
    },
    /// Bytes moved on a session
    SessionTransaction {
        /// Session id
        session_id: u32,
        /// Bytes received from the peer
        bytes_in: u64,
        /// Bytes sent to the peer
        bytes_out: u64,
    },
}

impl EventKind {
    /// Category of this event
    pub fn category(&self) -> EventCategory {
        match self {
            EventKind::ChannelCreate { .. } | EventKind::ChannelClose | EventKind::ChannelError(_) => {
                EventCategory::Channel
            }
            EventKind::SessionCreate { .. }
            | EventKind::SessionClose { .. }
            | EventKind::SessionError { .. }
            | EventKind::SessionTransaction { .. } => EventCategory::Session,
        }
    }

    /// Session the event refers to, if any
    pub fn session_id(&self) -> Option<u32> {
        match self {
            EventKind::SessionCreate { session_id, .. }
            | EventKind::SessionClose { session_id }
            | EventKind::SessionError { session_id, .. }
            | EventKind::SessionTransaction { session_id, .. } => Some(*session_id),
            _ => None,
        }
    }

    /// Error details for error events
    pub fn error(&self) -> Option<&ErrorInfo> {
        match self {
            EventKind::ChannelError(error) | EventKind::SessionError { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Short event name
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::ChannelCreate { .. } => "channel_create",
            EventKind::ChannelClose => "channel_close",
            EventKind::ChannelError(_) => "channel_error",
            EventKind::SessionCreate { .. } => "session_create",
            EventKind::SessionClose { .. } => "session_close",
            EventKind::SessionError { .. } => "session_error",
            EventKind::SessionTransaction { .. } => "session_transaction",
        }
    }
}

/// A channel or session state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorEvent {
    /// Device the channel is connected to
    pub device_id: String,
    /// When the change happened
    pub timestamp: DateTime<Utc>,
    /// What happened
    #[serde(flatten)]
    pub kind: EventKind,
}

impl MonitorEvent {
    /// Create an event stamped with the current time
    pub fn new(device_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Category of this event
    pub fn category(&self) -> EventCategory {
        self.kind.category()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(EventKind::ChannelClose.category(), EventCategory::Channel);
        assert_eq!(
            EventKind::SessionClose { session_id: 1 }.category(),
            EventCategory::Session
        );
        let error = ErrorInfo::new(ErrorCode::ConnReset, ErrorLevel::Error, "reset");
        assert_eq!(EventKind::ChannelError(error.clone()).category(), EventCategory::Channel);
        assert_eq!(
            EventKind::SessionError { session_id: 3, error }.session_id(),
            Some(3)
        );
    }

    #[test]
    fn test_error_ids_are_unique() {
        let a = ErrorInfo::new(ErrorCode::TimedOut, ErrorLevel::Warning, "a");
        let b = ErrorInfo::new(ErrorCode::TimedOut, ErrorLevel::Warning, "a");
        assert_ne!(a.error_id, b.error_id);
    }

    #[test]
    fn test_json_shape() {
        let event = MonitorEvent::new(
            "10.0.0.1:830",
            EventKind::ChannelCreate {
                call_home: true,
                channel_type: TransportType::Tls,
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["device_id"], "10.0.0.1:830");
        assert_eq!(json["type"], "channel_create");
        assert_eq!(json["call_home"], true);
        assert_eq!(json["channel_type"], "TLS");
    }

    #[test]
    fn test_transport_parse() {
        assert_eq!("udp".parse::<TransportType>().unwrap(), TransportType::Udp);
        assert_eq!("DTLS".parse::<TransportType>().unwrap(), TransportType::Dtls);
        assert!("sctp".parse::<TransportType>().is_err());
        assert!(TransportType::Dtls.is_datagram());
        assert!(!TransportType::Tls.is_datagram());
    }
}
