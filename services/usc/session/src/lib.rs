//! Session multiplexing over one physical channel.
//!
//! A [`Channel`] owns one TCP, UDP, TLS or DTLS connection to a device and
//! carries any number of logical sessions over it, each bound to a service
//! port. The pieces:
//!
//! - [`transport`]: sockets and the [`SecureHandlerFactory`] seam that turns
//!   them into channel transports
//! - [`channel`]: the session table, frame routing and session lifecycle
//! - [`driver`]: reader and writer tasks moving frames between a socket and
//!   a channel
//! - [`reconnect`] and [`strategy`]: dialling with retries
//! - [`manager`]: one channel per device, dialled or called home
//! - [`forward`]: local TCP clients bridged onto sessions
//!
//! Every state change is published to a [`usc_monitor::EventDispatcher`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod driver;
pub mod endpoint;
pub mod forward;
pub mod manager;
pub mod reconnect;
pub mod strategy;
pub mod transport;

// Re-export main types
pub use channel::{
    Channel, ChannelConfig, ChannelError, ChannelStats, SessionHandle, SessionStats,
    DEFAULT_CLOSE_TIMEOUT, PROTOCOL_ERROR,
};
pub use driver::{spawn_channel, spawn_datagram, spawn_stream};
pub use endpoint::{
    EndpointError, EndpointFactory, IncomingSession, LocalEndpoint, QueueEndpoint,
    QueueEndpointFactory, SessionMessage,
};
pub use forward::{forward_stream, forward_tcp, serve_forward, ForwardStats};
pub use manager::{ChannelManager, Device, ManagerConfig, ManagerError, TransportDialer};
pub use reconnect::{ConnectHandle, ConnectionFactory, ReconnectEngine, ReconnectError, ReconnectState};
pub use strategy::{BackoffConfig, ExponentialBackoff, NoRetry, ReconnectStrategy};
pub use transport::{
    connect_udp, listen_tcp, Connection, DatagramTransport, IoStream, PlainHandler, Role,
    SecureHandlerFactory, UdpTransport,
};

#[cfg(feature = "tls")]
pub use transport::tls::{make_client_config, make_server_config, RustlsHandler};
