//! Built-in listeners.

use crate::dispatcher::MonitorListener;
use crate::event::{EventKind, MonitorEvent};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, trace, warn};

/// Writes every event to the log
#[derive(Debug, Clone)]
pub struct LoggingListener {
    log_errors: bool,
}

impl LoggingListener {
    /// Create a logging listener; `log_errors` controls error events
    pub fn new(log_errors: bool) -> Self {
        Self { log_errors }
    }
}

impl Default for LoggingListener {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait]
impl MonitorListener for LoggingListener {
    fn name(&self) -> &str {
        "logging"
    }

    async fn on_event(&self, event: Arc<MonitorEvent>) -> anyhow::Result<()> {
        let device = event.device_id.as_str();
        match &event.kind {
            EventKind::ChannelCreate {
                call_home,
                channel_type,
            } => info!(
                component = "monitor",
                "Channel to {} created ({}, call_home={})", device, channel_type, call_home
            ),
            EventKind::ChannelClose => {
                info!(component = "monitor", "Channel to {} closed", device)
            }
            EventKind::ChannelError(error) => {
                if self.log_errors {
                    warn!(
                        component = "monitor",
                        error_id = %error.error_id,
                        "Channel error on {}: {} [{:?}] {}", device, error.error_code, error.level, error.message
                    );
                }
            }
            EventKind::SessionCreate { session_id, port } => info!(
                component = "monitor",
                "Session {} on {} opened for port {}", session_id, device, port
            ),
            EventKind::SessionClose { session_id } => info!(
                component = "monitor",
                "Session {} on {} closed", session_id, device
            ),
            EventKind::SessionError { session_id, error } => {
                if self.log_errors {
                    warn!(
                        component = "monitor",
                        error_id = %error.error_id,
                        "Session {} error on {}: {} [{:?}] {}",
                        session_id,
                        device,
                        error.error_code,
                        error.level,
                        error.message
                    );
                }
            }
            EventKind::SessionTransaction {
                session_id,
                bytes_in,
                bytes_out,
            } => trace!(
                component = "monitor",
                "Session {} on {}: in={} out={}", session_id, device, bytes_in, bytes_out
            ),
        }
        Ok(())
    }
}

/// Forwards events into an unbounded queue
///
/// Useful for bridging monitor events into another task.
#[derive(Debug, Clone)]
pub struct ForwardingListener {
    tx: mpsc::UnboundedSender<Arc<MonitorEvent>>,
}

impl ForwardingListener {
    /// Create the listener and the receiving end of its queue
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Arc<MonitorEvent>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl MonitorListener for ForwardingListener {
    fn name(&self) -> &str {
        "forwarding"
    }

    async fn on_event(&self, event: Arc<MonitorEvent>) -> anyhow::Result<()> {
        self.tx
            .send(event)
            .map_err(|_| anyhow::anyhow!("event receiver dropped"))
    }
}
