//! Monitor events for USC channels and sessions.
//!
//! The session layer publishes a [`MonitorEvent`] for every channel and
//! session state change. An [`EventDispatcher`] delivers them to registered
//! [`MonitorListener`]s on its own worker tasks, so publishing never blocks
//! the I/O path and a failing listener never affects the publisher.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod alarm;
pub mod dispatcher;
pub mod event;
pub mod listener;

// Re-export main types
pub use alarm::{Alarm, AlarmTracker};
pub use dispatcher::{EventDispatcher, ListenerId, MonitorListener};
pub use event::{ErrorInfo, ErrorLevel, EventCategory, EventKind, MonitorEvent, TransportType};
pub use listener::{ForwardingListener, LoggingListener};
