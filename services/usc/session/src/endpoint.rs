//! Local forwarding endpoints: the application-side half of a session.

use crate::channel::SessionHandle;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;
use usc_wire::ErrorCode;

/// Local endpoint errors
#[derive(Error, Debug)]
pub enum EndpointError {
    /// The application side has gone away
    #[error("endpoint closed")]
    Closed,

    /// No application accepts sessions for this port
    #[error("no endpoint accepts sessions for port {0}")]
    Refused(u16),

    /// I/O failure in the application side
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Application-side half of a session
///
/// Methods are called by the channel while it holds its session table, so
/// they must not block and must not call back into the channel.
pub trait LocalEndpoint: Send + Sync {
    /// Hand a DATA payload to the application
    fn deliver(&self, payload: Bytes) -> Result<(), EndpointError>;

    /// The peer reported an error for this session
    fn fail(&self, _code: ErrorCode) {}

    /// The session is gone; release application resources
    fn close(&self);
}

/// Something that happened on a session, as seen by the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionMessage {
    /// Payload from the peer
    Data(Bytes),
    /// Error reported by the peer
    Error(ErrorCode),
    /// Session closed
    Closed,
}

/// Endpoint feeding an unbounded queue
#[derive(Debug, Clone)]
pub struct QueueEndpoint {
    tx: mpsc::UnboundedSender<SessionMessage>,
}

impl QueueEndpoint {
    /// Create the endpoint and the receiving end of its queue
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl LocalEndpoint for QueueEndpoint {
    fn deliver(&self, payload: Bytes) -> Result<(), EndpointError> {
        self.tx
            .send(SessionMessage::Data(payload))
            .map_err(|_| EndpointError::Closed)
    }

    fn fail(&self, code: ErrorCode) {
        let _ = self.tx.send(SessionMessage::Error(code));
    }

    fn close(&self) {
        let _ = self.tx.send(SessionMessage::Closed);
    }
}

/// Supplies endpoints for sessions opened by the peer
pub trait EndpointFactory: Send + Sync {
    /// Create the endpoint for a new inbound session
    ///
    /// Same constraints as [`LocalEndpoint`]: no blocking, no calls into the
    /// channel. An error refuses the session.
    fn create(&self, session: SessionHandle) -> Result<Arc<dyn LocalEndpoint>, EndpointError>;
}

/// A session opened by the peer, handed to the application
#[derive(Debug)]
pub struct IncomingSession {
    /// Handle for sending and closing
    pub handle: SessionHandle,
    /// Payloads and lifecycle signals from the peer
    pub messages: mpsc::UnboundedReceiver<SessionMessage>,
}

/// Factory handing every inbound session to a queue
#[derive(Debug, Clone)]
pub struct QueueEndpointFactory {
    tx: mpsc::UnboundedSender<IncomingSession>,
}

impl QueueEndpointFactory {
    /// Create the factory and the receiving end of its queue
    pub fn new() -> (Self, mpsc::UnboundedReceiver<IncomingSession>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EndpointFactory for QueueEndpointFactory {
    fn create(&self, session: SessionHandle) -> Result<Arc<dyn LocalEndpoint>, EndpointError> {
        let port = session.port();
        let (endpoint, messages) = QueueEndpoint::new();
        self.tx
            .send(IncomingSession {
                handle: session,
                messages,
            })
            .map_err(|_| EndpointError::Refused(port))?;
        debug!("Queued inbound session for port {}", port);
        Ok(Arc::new(endpoint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_endpoint() {
        let (endpoint, mut rx) = QueueEndpoint::new();
        endpoint.deliver(Bytes::from_static(b"abc")).unwrap();
        endpoint.fail(ErrorCode::ConnReset);
        endpoint.close();

        assert_eq!(rx.try_recv().unwrap(), SessionMessage::Data(Bytes::from_static(b"abc")));
        assert_eq!(rx.try_recv().unwrap(), SessionMessage::Error(ErrorCode::ConnReset));
        assert_eq!(rx.try_recv().unwrap(), SessionMessage::Closed);

        drop(rx);
        assert!(matches!(
            endpoint.deliver(Bytes::from_static(b"late")),
            Err(EndpointError::Closed)
        ));
    }
}
