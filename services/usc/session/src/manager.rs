//! Channel manager: the table of live channels keyed by device.
//!
//! Channels are created either by dialling a device through a
//! [`ReconnectEngine`] or by accepting a device's call-home connection. At
//! most one channel exists per device; a closed channel leaves the table on
//! its own.

use crate::channel::{Channel, ChannelConfig};
use crate::driver::spawn_channel;
use crate::endpoint::EndpointFactory;
use crate::reconnect::{ConnectionFactory, ReconnectEngine, ReconnectError};
use crate::strategy::{BackoffConfig, ExponentialBackoff};
use crate::transport::{connect_udp, Connection, IoStream, Role, SecureHandlerFactory};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use usc_monitor::{EventDispatcher, TransportType};
use usc_wire::DEFAULT_MAX_PAYLOAD;

/// Channel manager errors
#[derive(Error, Debug)]
pub enum ManagerError {
    /// Dialling the device failed
    #[error("connect failed: {0}")]
    Connect(#[from] ReconnectError),

    /// The manager is shutting down
    #[error("channel manager is shutting down")]
    ShuttingDown,

    /// Socket failure
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// Identity of a device in the channel table
///
/// Dialled devices are identified by address and service port, call-home
/// devices by address alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Device {
    /// Device address
    pub ip: IpAddr,
    /// Service port, `None` for call-home devices
    pub port: Option<u16>,
}

impl Device {
    /// Device reached at `addr`
    pub fn dialled(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip(),
            port: Some(addr.port()),
        }
    }

    /// Device that called home from `ip`
    pub fn call_home(ip: IpAddr) -> Self {
        Self { ip, port: None }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}", SocketAddr::new(self.ip, port)),
            None => write!(f, "{}", self.ip),
        }
    }
}

/// Opens TCP/UDP sockets and hands them to the secure handler
pub struct TransportDialer {
    transport: TransportType,
    handler: Arc<dyn SecureHandlerFactory>,
}

impl TransportDialer {
    /// Dialer for `transport`
    pub fn new(transport: TransportType, handler: Arc<dyn SecureHandlerFactory>) -> Self {
        Self { transport, handler }
    }
}

#[async_trait]
impl ConnectionFactory for TransportDialer {
    type Connection = Connection;

    async fn connect(&self, addr: SocketAddr) -> io::Result<Connection> {
        if self.transport.is_datagram() {
            let udp = connect_udp(addr).await?;
            let transport = self
                .handler
                .secure_datagram(udp, Role::Client, self.transport)
                .await?;
            Ok(Connection::Datagram(transport))
        } else {
            let tcp = TcpStream::connect(addr).await?;
            tcp.set_nodelay(true)?;
            let stream = self
                .handler
                .secure_stream(tcp, Role::Client, self.transport)
                .await?;
            Ok(Connection::Stream(stream))
        }
    }

    async fn discard(&self, connection: Connection) {
        if let Connection::Stream(mut stream) = connection {
            let _ = stream.shutdown().await;
        }
    }
}

/// Channel manager settings
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Largest DATA payload accepted on managed channels
    pub max_payload: usize,
    /// Retry policy for dialling
    pub backoff: BackoffConfig,
    /// Re-dial controller-initiated channels that drop
    pub reconnect_on_drop: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
            backoff: BackoffConfig::default(),
            reconnect_on_drop: true,
        }
    }
}

/// Table of live channels
pub struct ChannelManager {
    channels: DashMap<Device, Arc<Channel>>,
    dialling: DashMap<Device, Arc<tokio::sync::Mutex<()>>>,
    handler: Arc<dyn SecureHandlerFactory>,
    events: Arc<EventDispatcher>,
    endpoints: Option<Arc<dyn EndpointFactory>>,
    config: ManagerConfig,
    shutdown: CancellationToken,
}

impl ChannelManager {
    /// Create a manager
    pub fn new(
        config: ManagerConfig,
        handler: Arc<dyn SecureHandlerFactory>,
        events: Arc<EventDispatcher>,
        endpoints: Option<Arc<dyn EndpointFactory>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            channels: DashMap::new(),
            dialling: DashMap::new(),
            handler,
            events,
            endpoints,
            config,
            shutdown: CancellationToken::new(),
        })
    }

    /// Channel to a device, if one is live
    pub fn get(&self, device: &Device) -> Option<Arc<Channel>> {
        self.channels
            .get(device)
            .map(|entry| entry.value().clone())
            .filter(|channel| !channel.is_closed())
    }

    /// Return the channel to `addr`, dialling it if necessary
    pub async fn connect(
        self: &Arc<Self>,
        addr: SocketAddr,
        transport: TransportType,
    ) -> Result<Arc<Channel>, ManagerError> {
        let device = Device::dialled(addr);
        if let Some(channel) = self.get(&device) {
            return Ok(channel);
        }

        // One dial per device at a time
        let gate = self
            .dialling
            .entry(device)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let result = self.connect_gated(device, addr, transport, &gate).await;

        // The last waiter removes the gate; the table holds one reference
        self.dialling.remove_if(&device, |_, current| {
            Arc::ptr_eq(current, &gate) && Arc::strong_count(current) == 2
        });
        result
    }

    async fn connect_gated(
        self: &Arc<Self>,
        device: Device,
        addr: SocketAddr,
        transport: TransportType,
        gate: &tokio::sync::Mutex<()>,
    ) -> Result<Arc<Channel>, ManagerError> {
        let _dialling = gate.lock().await;

        if let Some(channel) = self.get(&device) {
            return Ok(channel);
        }
        if self.shutdown.is_cancelled() {
            return Err(ManagerError::ShuttingDown);
        }

        let connection = self.dial(addr, transport).await?;
        let config = ChannelConfig::dialled(device.to_string(), transport)
            .with_max_payload(self.config.max_payload);
        let channel = spawn_channel(connection, config, self.events.clone(), self.endpoints.clone());

        self.channels.insert(device, channel.clone());
        self.watch(device, channel.clone(), Some(transport));
        Ok(channel)
    }

    async fn dial(&self, addr: SocketAddr, transport: TransportType) -> Result<Connection, ManagerError> {
        let dialer = Arc::new(TransportDialer::new(transport, self.handler.clone()));
        let strategy = Arc::new(ExponentialBackoff::new(self.config.backoff.clone()));
        let engine = ReconnectEngine::new(addr, dialer, strategy)
            .with_events(self.events.clone(), Device::dialled(addr).to_string());
        let handle = engine.connect()?;

        tokio::select! {
            result = handle.wait() => Ok(result?),
            _ = self.shutdown.cancelled() => Err(ManagerError::ShuttingDown),
        }
    }

    /// Accept call-home connections until [`ChannelManager::close_all`]
    ///
    /// `transport` must be a stream transport (TCP or TLS).
    pub async fn accept_call_home(
        self: &Arc<Self>,
        listener: TcpListener,
        transport: TransportType,
    ) -> Result<(), ManagerError> {
        if transport.is_datagram() {
            return Err(ManagerError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("call home over {} is not supported", transport),
            )));
        }

        info!(
            "Accepting {} call-home connections on {}",
            transport,
            listener.local_addr()?
        );

        loop {
            let (tcp, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept call-home connection: {}", e);
                        continue;
                    }
                },
            };

            let manager = self.clone();
            tokio::spawn(async move {
                if let Err(e) = manager.register_call_home(tcp, peer, transport).await {
                    warn!("Call home from {} rejected: {}", peer, e);
                }
            });
        }

        debug!("Call-home listener stopped");
        Ok(())
    }

    async fn register_call_home(
        self: &Arc<Self>,
        tcp: TcpStream,
        peer: SocketAddr,
        transport: TransportType,
    ) -> Result<(), ManagerError> {
        let device = Device::call_home(peer.ip());
        if self.get(&device).is_some() {
            warn!("Device {} already has a channel, closing new connection", device);
            return Ok(());
        }

        tcp.set_nodelay(true)?;
        let timeout = self.config.backoff.connect_timeout;
        let handshake = self.handler.secure_stream(tcp, Role::Server, transport);
        let stream: IoStream = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(ManagerError::ShuttingDown),
            result = tokio::time::timeout(timeout, handshake) => match result {
                Ok(stream) => stream?,
                Err(_) => {
                    return Err(ManagerError::Io(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("handshake timed out after {:?}", timeout),
                    )))
                }
            },
        };

        match self.channels.entry(device) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_closed() {
                    warn!("Device {} already has a channel, closing new connection", device);
                    return Ok(());
                }
                let channel = self.start_call_home(device, stream, transport);
                occupied.insert(channel.clone());
                self.watch(device, channel, None);
            }
            Entry::Vacant(vacant) => {
                let channel = self.start_call_home(device, stream, transport);
                vacant.insert(channel.clone());
                self.watch(device, channel, None);
            }
        }
        Ok(())
    }

    fn start_call_home(&self, device: Device, stream: IoStream, transport: TransportType) -> Arc<Channel> {
        info!("Device {} called home over {}", device, transport);
        let config = ChannelConfig::call_home(device.to_string(), transport)
            .with_max_payload(self.config.max_payload);
        spawn_channel(
            Connection::Stream(stream),
            config,
            self.events.clone(),
            self.endpoints.clone(),
        )
    }

    /// Remove the channel from the table once it closes
    fn watch(self: &Arc<Self>, device: Device, channel: Arc<Channel>, redial: Option<TransportType>) {
        let manager: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            channel.closed().await;

            let Some(manager) = manager.upgrade() else { return };
            manager
                .channels
                .remove_if(&device, |_, current| Arc::ptr_eq(current, &channel));
            debug!("Channel to {} removed from table", device);

            let Some(transport) = redial else { return };
            if !manager.config.reconnect_on_drop || manager.shutdown.is_cancelled() {
                return;
            }
            let Some(port) = device.port else { return };

            info!("Channel to {} dropped, reconnecting", device);
            if let Err(e) = manager.connect(SocketAddr::new(device.ip, port), transport).await {
                error!("Reconnect to {} failed: {}", device, e);
            }
        });
    }

    /// Number of live channels
    pub fn channel_count(&self) -> usize {
        self.channels.iter().filter(|entry| !entry.value().is_closed()).count()
    }

    /// Number of sessions across all channels
    pub fn session_count(&self) -> usize {
        self.channels
            .iter()
            .map(|entry| entry.value().session_count())
            .sum()
    }

    /// Devices with a live channel
    pub fn devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self
            .channels
            .iter()
            .filter(|entry| !entry.value().is_closed())
            .map(|entry| *entry.key())
            .collect();
        devices.sort();
        devices
    }

    /// Close every channel and stop dialling and accepting
    pub fn close_all(&self) {
        self.shutdown.cancel();
        let channels: Vec<Arc<Channel>> = self
            .channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for channel in &channels {
            channel.close();
        }
        self.channels.clear();
        info!("Closed {} channels", channels.len());
    }
}

impl std::fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelManager")
            .field("channels", &self.channels.len())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::PlainHandler;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use usc_monitor::{ErrorLevel, ForwardingListener};
    use usc_wire::ErrorCode;

    fn manager(config: ManagerConfig) -> Arc<ChannelManager> {
        ChannelManager::new(
            config,
            Arc::new(PlainHandler),
            Arc::new(EventDispatcher::new(1)),
            None,
        )
    }

    #[test]
    fn test_device_display() {
        let dialled = Device::dialled("10.1.1.1:830".parse().unwrap());
        assert_eq!(dialled.to_string(), "10.1.1.1:830");
        let home = Device::call_home("10.1.1.1".parse().unwrap());
        assert_eq!(home.to_string(), "10.1.1.1");
        assert_ne!(dialled, home);
    }

    #[tokio::test]
    async fn test_connect_reuses_channel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            socket
        });

        let manager = manager(ManagerConfig::default());
        let first = manager.connect(addr, TransportType::Tcp).await.unwrap();
        let second = manager.connect(addr, TransportType::Tcp).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.channel_count(), 1);
        assert!(!first.is_call_home());
        assert!(manager.dialling.is_empty());

        let _socket = accept.await.unwrap();
        manager.close_all();
        assert!(first.is_closed());
        assert_eq!(manager.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_gives_up() {
        // Reserve a port, then free it so nothing listens there
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let events = Arc::new(EventDispatcher::new(1));
        let (listener, mut rx) = ForwardingListener::new();
        events.add_listener(Arc::new(listener));
        let manager = ChannelManager::new(
            ManagerConfig {
                backoff: BackoffConfig {
                    connect_timeout: Duration::from_secs(1),
                    initial_backoff: Duration::from_millis(10),
                    max_backoff: Duration::from_millis(10),
                    max_retries: Some(1),
                },
                ..ManagerConfig::default()
            },
            Arc::new(PlainHandler),
            events,
            None,
        );

        let err = manager.connect(addr, TransportType::Tcp).await.unwrap_err();
        assert!(matches!(
            err,
            ManagerError::Connect(ReconnectError::Exhausted { attempts: 2, .. })
        ));
        assert_eq!(manager.channel_count(), 0);
        assert!(manager.dialling.is_empty());

        // One warning for the retry, one error for giving up
        let mut levels = Vec::new();
        for _ in 0..2 {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.device_id, addr.to_string());
            let error = event.kind.error().unwrap();
            assert_eq!(error.error_code, ErrorCode::ConnRefused);
            levels.push(error.level);
        }
        assert_eq!(levels, vec![ErrorLevel::Warning, ErrorLevel::Error]);
    }

    /// Accepts the socket, then never finishes the handshake
    struct StalledHandshake;

    #[async_trait]
    impl SecureHandlerFactory for StalledHandshake {
        async fn secure_stream(
            &self,
            tcp: TcpStream,
            _role: Role,
            _transport: TransportType,
        ) -> io::Result<IoStream> {
            let _tcp = tcp;
            std::future::pending().await
        }

        async fn secure_datagram(
            &self,
            _udp: tokio::net::UdpSocket,
            _role: Role,
            _transport: TransportType,
        ) -> io::Result<Arc<dyn crate::transport::DatagramTransport>> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_stalled_call_home_handshake_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let manager = ChannelManager::new(
            ManagerConfig {
                backoff: BackoffConfig {
                    connect_timeout: Duration::from_millis(100),
                    ..BackoffConfig::default()
                },
                ..ManagerConfig::default()
            },
            Arc::new(StalledHandshake),
            Arc::new(EventDispatcher::new(1)),
            None,
        );

        let acceptor = manager.clone();
        let accept = tokio::spawn(async move {
            acceptor
                .accept_call_home(listener, TransportType::Tls)
                .await
        });

        // The manager drops the socket once the handshake deadline passes
        let mut device = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(5), device.read(&mut buf))
            .await
            .unwrap();
        assert_eq!(read.unwrap(), 0);
        assert_eq!(manager.channel_count(), 0);

        manager.close_all();
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_call_home_registers_channel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let manager = manager(ManagerConfig::default());

        let acceptor = manager.clone();
        let accept = tokio::spawn(async move {
            acceptor
                .accept_call_home(listener, TransportType::Tcp)
                .await
        });

        let device = TcpStream::connect(addr).await.unwrap();
        let key = Device::call_home(device.local_addr().unwrap().ip());

        let channel = loop {
            if let Some(channel) = manager.get(&key) {
                break channel;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert!(channel.is_call_home());

        // Device hangs up; the channel leaves the table
        drop(device);
        tokio::time::timeout(Duration::from_secs(5), channel.closed())
            .await
            .unwrap();
        while manager.devices().contains(&key) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        manager.close_all();
        accept.await.unwrap().unwrap();
    }
}
