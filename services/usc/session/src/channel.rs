//! Session multiplexer.
//!
//! A [`Channel`] owns one physical connection and the table of logical
//! sessions carried over it. Inbound frames are routed by session id;
//! outbound session traffic is framed and queued for the connection's writer
//! task. All session table and counter updates happen under one lock, which
//! is never held across an await point.

use crate::endpoint::{EndpointFactory, LocalEndpoint};
use crate::transport::Role;
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use usc_monitor::{ErrorInfo, ErrorLevel, EventDispatcher, EventKind, MonitorEvent, TransportType};
use usc_wire::{ControlCode, ErrorCode, Frame, FrameBody, DEFAULT_MAX_PAYLOAD};

/// Code reported for protocol violations (EPROTO)
pub const PROTOCOL_ERROR: ErrorCode = ErrorCode::Other(71);

/// Default time to wait for a close acknowledgement
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Multiplexer errors returned to local callers
#[derive(Error, Debug)]
pub enum ChannelError {
    /// No session with this id on the channel
    #[error("unknown session {0}")]
    UnknownSession(u32),

    /// The channel no longer accepts traffic
    #[error("channel closed")]
    Closed,

    /// Every session id of this side has been used
    #[error("session ids exhausted")]
    SessionIdsExhausted,

    /// Payload larger than the channel accepts
    #[error("payload size {size} exceeds limit {max}")]
    PayloadTooLarge {
        /// Payload size
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// The peer did not acknowledge a close in time
    #[error("close of session {0} not acknowledged")]
    CloseTimeout(u32),

    /// Transport failure
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),
}

/// Static description of a channel
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Device the channel is connected to
    pub device_id: String,
    /// Physical transport
    pub transport: TransportType,
    /// Whether the device initiated the connection
    pub call_home: bool,
    /// Our side of the connection; picks the session id parity
    pub role: Role,
    /// Largest DATA payload accepted in either direction
    pub max_payload: usize,
}

impl ChannelConfig {
    /// Channel we dialled
    pub fn dialled(device_id: impl Into<String>, transport: TransportType) -> Self {
        Self {
            device_id: device_id.into(),
            transport,
            call_home: false,
            role: Role::Client,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }

    /// Channel the device dialled in on
    pub fn call_home(device_id: impl Into<String>, transport: TransportType) -> Self {
        Self {
            device_id: device_id.into(),
            transport,
            call_home: true,
            role: Role::Server,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }

    /// Override the payload limit
    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }
}

/// Per-session counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Application port
    pub port: u16,
    /// Payload bytes received from the peer
    pub bytes_in: u64,
    /// Payload bytes sent to the peer
    pub bytes_out: u64,
}

/// Channel-wide counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ChannelStats {
    /// Live sessions
    pub sessions: usize,
    /// Payload bytes received from the peer
    pub bytes_in: u64,
    /// Payload bytes sent to the peer
    pub bytes_out: u64,
}

struct SessionEntry {
    port: u16,
    endpoint: Arc<dyn LocalEndpoint>,
    bytes_in: u64,
    bytes_out: u64,
}

struct ChannelState {
    sessions: HashMap<u32, SessionEntry>,
    next_session_id: u64,
    bytes_in: u64,
    bytes_out: u64,
    closed: bool,
    pending_close: HashMap<u32, oneshot::Sender<()>>,
}

/// One physical connection and its sessions
pub struct Channel {
    config: ChannelConfig,
    state: Mutex<ChannelState>,
    outbound: mpsc::Sender<Frame>,
    events: Arc<EventDispatcher>,
    endpoints: Option<Arc<dyn EndpointFactory>>,
    shutdown: CancellationToken,
    this: Weak<Channel>,
}

impl Channel {
    /// Create a channel writing its frames to `outbound`
    ///
    /// Publishes the ChannelCreate event. Inbound session opens are refused
    /// when `endpoints` is `None`.
    pub fn new(
        config: ChannelConfig,
        outbound: mpsc::Sender<Frame>,
        events: Arc<EventDispatcher>,
        endpoints: Option<Arc<dyn EndpointFactory>>,
    ) -> Arc<Self> {
        let first_session_id = match config.role {
            Role::Client => 1,
            Role::Server => 2,
        };

        let channel = Arc::new_cyclic(|this| Self {
            config,
            state: Mutex::new(ChannelState {
                sessions: HashMap::new(),
                next_session_id: first_session_id,
                bytes_in: 0,
                bytes_out: 0,
                closed: false,
                pending_close: HashMap::new(),
            }),
            outbound,
            events,
            endpoints,
            shutdown: CancellationToken::new(),
            this: this.clone(),
        });

        info!(
            "Channel to {} established ({}, call_home={})",
            channel.config.device_id, channel.config.transport, channel.config.call_home
        );
        channel.publish(EventKind::ChannelCreate {
            call_home: channel.config.call_home,
            channel_type: channel.config.transport,
        });
        channel
    }

    /// Device the channel is connected to
    pub fn device_id(&self) -> &str {
        &self.config.device_id
    }

    /// Physical transport
    pub fn transport(&self) -> TransportType {
        self.config.transport
    }

    /// Whether the device initiated the connection
    pub fn is_call_home(&self) -> bool {
        self.config.call_home
    }

    /// Our side of the connection
    pub fn role(&self) -> Role {
        self.config.role
    }

    /// Largest DATA payload accepted
    pub fn max_payload(&self) -> usize {
        self.config.max_payload
    }

    /// Whether [`Channel::close`] has run
    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    /// Wait until the channel is closed
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.lock_state().sessions.len()
    }

    /// Ids of live sessions, ascending
    pub fn session_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.lock_state().sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Channel-wide counters
    pub fn stats(&self) -> ChannelStats {
        let state = self.lock_state();
        ChannelStats {
            sessions: state.sessions.len(),
            bytes_in: state.bytes_in,
            bytes_out: state.bytes_out,
        }
    }

    /// Counters of one session
    pub fn session_stats(&self, session_id: u32) -> Option<SessionStats> {
        self.lock_state().sessions.get(&session_id).map(|entry| SessionStats {
            port: entry.port,
            bytes_in: entry.bytes_in,
            bytes_out: entry.bytes_out,
        })
    }

    /// Route one decoded inbound frame
    pub fn on_frame_received(&self, frame: Frame) {
        trace!(
            "{} <- {} frame session={} port={}",
            self.config.device_id,
            frame.op(),
            frame.session_id,
            frame.port
        );

        let mut guard = self.lock_state();
        let state = &mut *guard;
        if state.closed {
            debug!("Dropping frame for session {} on closed channel", frame.session_id);
            return;
        }

        let Frame {
            port,
            session_id,
            body,
        } = frame;

        match body {
            FrameBody::Data(payload) => self.handle_data(state, port, session_id, payload),
            FrameBody::Control(code) => self.handle_control(state, port, session_id, code),
            FrameBody::Error(code) => self.handle_error(state, session_id, code),
        }
    }

    fn handle_data(&self, state: &mut ChannelState, port: u16, session_id: u32, payload: Bytes) {
        let len = payload.len() as u64;
        let entry = match state.sessions.get_mut(&session_id) {
            Some(entry) => entry,
            None => {
                self.report_error(
                    ErrorCode::NotConnected,
                    ErrorLevel::Warning,
                    format!("DATA for unknown session {} (port {}) dropped", session_id, port),
                );
                return;
            }
        };

        entry.bytes_in += len;
        let delivered = entry.endpoint.deliver(payload);
        state.bytes_in += len;
        self.publish(EventKind::SessionTransaction {
            session_id,
            bytes_in: len,
            bytes_out: 0,
        });

        if let Err(e) = delivered {
            warn!("Endpoint of session {} rejected data: {}", session_id, e);
            self.publish(EventKind::SessionError {
                session_id,
                error: ErrorInfo::new(
                    ErrorCode::ConnReset,
                    ErrorLevel::Warning,
                    format!("local endpoint failed: {}", e),
                ),
            });
            if let Some(port) = self.remove_session(state, session_id) {
                self.enqueue(Frame::control(port, session_id, ControlCode::SessionClose));
            }
        }
    }

    fn handle_control(&self, state: &mut ChannelState, port: u16, session_id: u32, code: ControlCode) {
        match code {
            ControlCode::SessionOpen => self.handle_open(state, port, session_id),
            ControlCode::SessionClose => {
                if self.remove_session(state, session_id).is_none() {
                    debug!("Close for unknown session {}, acknowledging anyway", session_id);
                }
                self.enqueue(Frame::control(port, session_id, ControlCode::SessionCloseAck));
            }
            ControlCode::SessionCloseAck => match state.pending_close.remove(&session_id) {
                Some(waiter) => {
                    let _ = waiter.send(());
                }
                None => debug!("Unsolicited close acknowledgement for session {}", session_id),
            },
            ControlCode::Other(value) => self.report_error(
                PROTOCOL_ERROR,
                ErrorLevel::Warning,
                format!("unknown control code {} for session {}", value, session_id),
            ),
        }
    }

    fn handle_open(&self, state: &mut ChannelState, port: u16, session_id: u32) {
        if let Some(existing) = state.sessions.get(&session_id) {
            if existing.port == port {
                debug!("Duplicate open for session {} ignored", session_id);
            } else {
                self.report_error(
                    ErrorCode::IsConnected,
                    ErrorLevel::Warning,
                    format!(
                        "open for session {} on port {} conflicts with port {}",
                        session_id, port, existing.port
                    ),
                );
            }
            return;
        }

        let endpoint = match &self.endpoints {
            Some(factory) => factory.create(self.handle(session_id, port)),
            None => Err(crate::endpoint::EndpointError::Refused(port)),
        };

        match endpoint {
            Ok(endpoint) => {
                state.sessions.insert(session_id, SessionEntry::new(port, endpoint));
                info!(
                    "Peer opened session {} on {} for port {}",
                    session_id, self.config.device_id, port
                );
                self.publish(EventKind::SessionCreate { session_id, port });
            }
            Err(e) => {
                self.enqueue(Frame::error(port, session_id, ErrorCode::ConnRefused));
                self.report_error(
                    ErrorCode::ConnRefused,
                    ErrorLevel::Warning,
                    format!("refused session {} for port {}: {}", session_id, port, e),
                );
            }
        }
    }

    fn handle_error(&self, state: &mut ChannelState, session_id: u32, code: ErrorCode) {
        match state.sessions.get(&session_id) {
            Some(entry) => {
                warn!("Peer reported {} on session {}", code, session_id);
                entry.endpoint.fail(code);
                self.publish(EventKind::SessionError {
                    session_id,
                    error: ErrorInfo::new(code, ErrorLevel::Error, format!("peer reported {}", code)),
                });
            }
            None => self.report_error(
                code,
                ErrorLevel::Error,
                format!("peer reported {} for session {}", code, session_id),
            ),
        }
    }

    /// Send a DATA frame on a session
    pub async fn send(&self, session_id: u32, payload: Bytes) -> Result<(), ChannelError> {
        if payload.len() > self.config.max_payload {
            return Err(ChannelError::PayloadTooLarge {
                size: payload.len(),
                max: self.config.max_payload,
            });
        }

        let permit = self.outbound.reserve().await.map_err(|_| ChannelError::Closed)?;

        let mut guard = self.lock_state();
        let state = &mut *guard;
        if state.closed {
            return Err(ChannelError::Closed);
        }

        let entry = state
            .sessions
            .get_mut(&session_id)
            .ok_or(ChannelError::UnknownSession(session_id))?;

        let len = payload.len() as u64;
        entry.bytes_out += len;
        let port = entry.port;
        state.bytes_out += len;

        permit.send(Frame::data(port, session_id, payload));
        self.publish(EventKind::SessionTransaction {
            session_id,
            bytes_in: 0,
            bytes_out: len,
        });
        Ok(())
    }

    /// Open a session to `port` on the device
    pub async fn open_session(
        &self,
        port: u16,
        endpoint: Arc<dyn LocalEndpoint>,
    ) -> Result<SessionHandle, ChannelError> {
        let permit = self.outbound.reserve().await.map_err(|_| ChannelError::Closed)?;

        let mut guard = self.lock_state();
        let state = &mut *guard;
        if state.closed {
            return Err(ChannelError::Closed);
        }

        let session_id = Self::allocate_session_id(state)?;
        state.sessions.insert(session_id, SessionEntry::new(port, endpoint));
        permit.send(Frame::control(port, session_id, ControlCode::SessionOpen));

        info!(
            "Opened session {} on {} for port {}",
            session_id, self.config.device_id, port
        );
        self.publish(EventKind::SessionCreate { session_id, port });
        Ok(self.handle(session_id, port))
    }

    fn allocate_session_id(state: &mut ChannelState) -> Result<u32, ChannelError> {
        loop {
            let candidate =
                u32::try_from(state.next_session_id).map_err(|_| ChannelError::SessionIdsExhausted)?;
            state.next_session_id += 2;
            // The peer may already use this id if it ignores the parity rule
            if !state.sessions.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
    }

    /// Close a session and tell the peer
    pub async fn close_session(&self, session_id: u32) -> Result<(), ChannelError> {
        self.close_session_inner(session_id, None).await
    }

    /// Close a session and wait for the peer's acknowledgement
    pub async fn close_session_and_wait(
        &self,
        session_id: u32,
        timeout: Duration,
    ) -> Result<(), ChannelError> {
        let (tx, rx) = oneshot::channel();
        self.close_session_inner(session_id, Some(tx)).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => {
                self.lock_state().pending_close.remove(&session_id);
                Err(ChannelError::CloseTimeout(session_id))
            }
        }
    }

    async fn close_session_inner(
        &self,
        session_id: u32,
        waiter: Option<oneshot::Sender<()>>,
    ) -> Result<(), ChannelError> {
        let permit = self.outbound.reserve().await.map_err(|_| ChannelError::Closed)?;

        let mut guard = self.lock_state();
        let state = &mut *guard;
        if state.closed {
            return Err(ChannelError::Closed);
        }

        let port = self
            .remove_session(state, session_id)
            .ok_or(ChannelError::UnknownSession(session_id))?;
        if let Some(waiter) = waiter {
            state.pending_close.insert(session_id, waiter);
        }
        permit.send(Frame::control(port, session_id, ControlCode::SessionClose));
        Ok(())
    }

    /// Report a local endpoint failure to the peer
    pub async fn send_error(&self, session_id: u32, code: ErrorCode) -> Result<(), ChannelError> {
        let permit = self.outbound.reserve().await.map_err(|_| ChannelError::Closed)?;

        let state = self.lock_state();
        if state.closed {
            return Err(ChannelError::Closed);
        }
        let port = state
            .sessions
            .get(&session_id)
            .map(|entry| entry.port)
            .ok_or(ChannelError::UnknownSession(session_id))?;

        permit.send(Frame::error(port, session_id, code));
        self.publish(EventKind::SessionError {
            session_id,
            error: ErrorInfo::new(code, ErrorLevel::Warning, format!("local endpoint reported {}", code)),
        });
        Ok(())
    }

    /// Close every session, then the channel
    ///
    /// Returns `false` if the channel was already closed. Queued frames that
    /// have not been written yet are discarded.
    pub fn close(&self) -> bool {
        {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            if state.closed {
                return false;
            }
            state.closed = true;

            let mut ids: Vec<u32> = state.sessions.keys().copied().collect();
            ids.sort_unstable();
            for session_id in ids {
                self.remove_session(state, session_id);
            }
            state.pending_close.clear();

            self.publish(EventKind::ChannelClose);
        }

        self.shutdown.cancel();
        info!("Channel to {} closed", self.config.device_id);
        true
    }

    /// Report a fatal error and close the channel
    pub fn fail(&self, code: ErrorCode, message: impl Into<String>) {
        if self.is_closed() {
            return;
        }
        let message = message.into();
        tracing::error!("Channel to {} failed: {}", self.config.device_id, message);
        self.publish(EventKind::ChannelError(ErrorInfo::new(
            code,
            ErrorLevel::Critical,
            message,
        )));
        self.close();
    }

    /// Publish a non-fatal channel error
    pub(crate) fn report_error(&self, code: ErrorCode, level: ErrorLevel, message: String) {
        warn!("Channel {}: {}", self.config.device_id, message);
        self.publish(EventKind::ChannelError(ErrorInfo::new(code, level, message)));
    }

    fn remove_session(&self, state: &mut ChannelState, session_id: u32) -> Option<u16> {
        let entry = state.sessions.remove(&session_id)?;
        entry.endpoint.close();
        debug!(
            "Session {} on {} closed (in={} out={})",
            session_id, self.config.device_id, entry.bytes_in, entry.bytes_out
        );
        self.publish(EventKind::SessionClose { session_id });
        Some(entry.port)
    }

    fn enqueue(&self, frame: Frame) {
        match self.outbound.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(frame)) => {
                // Keep the reader moving; the reply goes out once the queue drains
                let outbound = self.outbound.clone();
                tokio::spawn(async move {
                    let _ = outbound.send(frame).await;
                });
            }
            Err(mpsc::error::TrySendError::Closed(frame)) => {
                debug!("Writer gone, dropping {} frame", frame.op());
            }
        }
    }

    fn publish(&self, kind: EventKind) {
        self.events
            .publish(MonitorEvent::new(self.config.device_id.clone(), kind));
    }

    fn handle(&self, session_id: u32, port: u16) -> SessionHandle {
        SessionHandle {
            channel: self.this.clone(),
            session_id,
            port,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ChannelState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl SessionEntry {
    fn new(port: u16, endpoint: Arc<dyn LocalEndpoint>) -> Self {
        Self {
            port,
            endpoint,
            bytes_in: 0,
            bytes_out: 0,
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("device_id", &self.config.device_id)
            .field("transport", &self.config.transport)
            .field("call_home", &self.config.call_home)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Non-owning handle to one session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    channel: Weak<Channel>,
    session_id: u32,
    port: u16,
}

impl SessionHandle {
    /// Session id
    pub fn id(&self) -> u32 {
        self.session_id
    }

    /// Application port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Owning channel, if it still exists
    pub fn channel(&self) -> Option<Arc<Channel>> {
        self.channel.upgrade()
    }

    /// Whether the session is still registered on a live channel
    pub fn is_open(&self) -> bool {
        self.channel()
            .map(|channel| channel.session_stats(self.session_id).is_some())
            .unwrap_or(false)
    }

    /// Send payload bytes to the peer
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<(), ChannelError> {
        self.upgrade()?.send(self.session_id, payload.into()).await
    }

    /// Close the session
    pub async fn close(&self) -> Result<(), ChannelError> {
        self.upgrade()?.close_session(self.session_id).await
    }

    /// Close the session and wait for the peer's acknowledgement
    pub async fn close_and_wait(&self, timeout: Duration) -> Result<(), ChannelError> {
        self.upgrade()?
            .close_session_and_wait(self.session_id, timeout)
            .await
    }

    /// Report a local failure to the peer
    pub async fn send_error(&self, code: ErrorCode) -> Result<(), ChannelError> {
        self.upgrade()?.send_error(self.session_id, code).await
    }

    /// Counters of this session
    pub fn stats(&self) -> Option<SessionStats> {
        self.channel()?.session_stats(self.session_id)
    }

    fn upgrade(&self) -> Result<Arc<Channel>, ChannelError> {
        self.channel.upgrade().ok_or(ChannelError::Closed)
    }
}
