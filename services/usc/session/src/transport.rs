//! Physical transports and the secure-handler seam.
//!
//! Stream transports (TCP, TLS) are carried as an [`IoStream`]; datagram
//! transports (UDP, DTLS) as a shared [`DatagramTransport`]. Raw sockets are
//! turned into either through a [`SecureHandlerFactory`], which decides
//! whether and how to wrap them in encryption.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::debug;
use usc_monitor::TransportType;

/// Which side of the physical connection we are
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// We dialled the connection
    Client,
    /// We accepted the connection
    Server,
}

/// Any duplex byte stream
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Unified stream type that can be either plain TCP or TLS
pub enum IoStream {
    /// Plain TCP stream
    Plain(TcpStream),
    /// TLS-wrapped stream
    #[cfg(feature = "tls")]
    Tls(tokio_rustls::server::TlsStream<TcpStream>),
    /// TLS client stream
    #[cfg(feature = "tls")]
    TlsClient(tokio_rustls::client::TlsStream<TcpStream>),
    /// Stream produced by a custom secure handler
    Boxed(Box<dyn AsyncStream>),
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream).poll_read(cx, buf),
            IoStream::Boxed(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream).poll_write(cx, buf),
            IoStream::Boxed(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream).poll_flush(cx),
            IoStream::Boxed(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream).poll_shutdown(cx),
            IoStream::Boxed(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl IoStream {
    /// Get the peer address of the underlying stream
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            IoStream::Plain(stream) => stream.peer_addr(),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => stream.get_ref().0.peer_addr(),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => stream.get_ref().0.peer_addr(),
            IoStream::Boxed(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "peer address not available for custom streams",
            )),
        }
    }

    /// Whether the stream is encrypted by the built-in TLS support
    pub fn is_tls(&self) -> bool {
        !matches!(self, IoStream::Plain(_) | IoStream::Boxed(_))
    }
}

impl std::fmt::Debug for IoStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            IoStream::Plain(_) => "Plain",
            #[cfg(feature = "tls")]
            IoStream::Tls(_) => "Tls",
            #[cfg(feature = "tls")]
            IoStream::TlsClient(_) => "TlsClient",
            IoStream::Boxed(_) => "Boxed",
        };
        f.debug_tuple("IoStream").field(&kind).finish()
    }
}

/// Message-oriented transport carrying one frame per datagram
#[async_trait]
pub trait DatagramTransport: Send + Sync {
    /// Send one datagram to the peer
    async fn send(&self, datagram: &[u8]) -> io::Result<()>;

    /// Receive one datagram from the peer into `buf`
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Plain UDP transport over a connected socket
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Wrap a socket already connected to its peer
    pub fn new(socket: UdpSocket) -> Self {
        Self { socket }
    }

    /// Peer address of the socket
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.socket.peer_addr()
    }
}

#[async_trait]
impl DatagramTransport for UdpTransport {
    async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        let sent = self.socket.send(datagram).await?;
        if sent != datagram.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("datagram truncated: {} of {} bytes sent", sent, datagram.len()),
            ));
        }
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buf).await
    }
}

/// An established physical connection, ready to carry frames
pub enum Connection {
    /// Byte stream (TCP or TLS)
    Stream(IoStream),
    /// Datagram transport (UDP or DTLS)
    Datagram(Arc<dyn DatagramTransport>),
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Connection::Stream(stream) => f.debug_tuple("Stream").field(stream).finish(),
            Connection::Datagram(_) => f.write_str("Datagram"),
        }
    }
}

/// Wraps raw sockets into the transport a channel runs on
///
/// `transport` is the transport type requested for the channel. Handlers
/// reject transports they cannot provide with [`io::ErrorKind::Unsupported`].
#[async_trait]
pub trait SecureHandlerFactory: Send + Sync {
    /// Prepare a TCP connection
    async fn secure_stream(
        &self,
        tcp: TcpStream,
        role: Role,
        transport: TransportType,
    ) -> io::Result<IoStream>;

    /// Prepare a connected UDP socket
    async fn secure_datagram(
        &self,
        udp: UdpSocket,
        role: Role,
        transport: TransportType,
    ) -> io::Result<Arc<dyn DatagramTransport>>;
}

fn unsupported(transport: TransportType, reason: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("{} transport not available: {}", transport, reason),
    )
}

/// Pass-through handler for unencrypted channels
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainHandler;

#[async_trait]
impl SecureHandlerFactory for PlainHandler {
    async fn secure_stream(
        &self,
        tcp: TcpStream,
        _role: Role,
        transport: TransportType,
    ) -> io::Result<IoStream> {
        match transport {
            TransportType::Tcp => Ok(IoStream::Plain(tcp)),
            other => Err(unsupported(other, "security is disabled")),
        }
    }

    async fn secure_datagram(
        &self,
        udp: UdpSocket,
        _role: Role,
        transport: TransportType,
    ) -> io::Result<Arc<dyn DatagramTransport>> {
        match transport {
            TransportType::Udp => Ok(Arc::new(UdpTransport::new(udp))),
            other => Err(unsupported(other, "security is disabled")),
        }
    }
}

/// Create a TCP listener bound to the given address
pub async fn listen_tcp(addr: SocketAddr) -> io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Open a UDP socket connected to `peer`
pub async fn connect_udp(peer: SocketAddr) -> io::Result<UdpSocket> {
    let local: SocketAddr = if peer.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(peer).await?;
    debug!("UDP socket {} connected to {}", socket.local_addr()?, peer);
    Ok(socket)
}

// TLS-specific functionality
#[cfg(feature = "tls")]
/// TLS secure handler built on rustls
pub mod tls {
    use super::*;
    use anyhow::{Context as AnyhowContext, Result};
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
    use rustls::{ClientConfig, RootCertStore, ServerConfig};
    use std::path::Path;
    use tokio_rustls::{TlsAcceptor, TlsConnector};
    use tracing::info;

    /// ALPN protocol id of the channel protocol
    pub const ALPN_PROTOCOL: &[u8] = b"usc/1";

    fn load_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
        let cert_results: Result<Vec<_>, _> = rustls_pemfile::certs(&mut pem.as_bytes()).collect();
        let certs = cert_results.context("Failed to parse certificate chain")?;
        if certs.is_empty() {
            anyhow::bail!("No certificates found in certificate chain");
        }
        Ok(certs)
    }

    fn load_key(pem: &str) -> Result<PrivateKeyDer<'static>> {
        rustls_pemfile::private_key(&mut pem.as_bytes())
            .context("Failed to parse private key")?
            .ok_or_else(|| anyhow::anyhow!("No private key found"))
    }

    fn load_roots(pem: &str) -> Result<RootCertStore> {
        let mut roots = RootCertStore::empty();
        for ca_cert in load_certs(pem).context("Failed to parse CA certificates")? {
            roots
                .add(ca_cert)
                .context("Failed to add CA certificate to root store")?;
        }
        Ok(roots)
    }

    /// Create a TLS server configuration requiring client certificates
    pub fn make_server_config(cert_chain_pem: &str, private_key_pem: &str, ca_pem: &str) -> Result<ServerConfig> {
        // Install default crypto provider if not already set
        let _ = rustls::crypto::ring::default_provider().install_default();

        let certs = load_certs(cert_chain_pem)?;
        let key = load_key(private_key_pem)?;
        let roots = load_roots(ca_pem)?;

        let client_verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .context("Failed to build client certificate verifier")?;

        let mut config = ServerConfig::builder()
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(certs, key)
            .context("Failed to configure server certificate")?;
        config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

        Ok(config)
    }

    /// Create a TLS client configuration presenting a client certificate
    pub fn make_client_config(cert_chain_pem: &str, private_key_pem: &str, ca_pem: &str) -> Result<ClientConfig> {
        // Install default crypto provider if not already set
        let _ = rustls::crypto::ring::default_provider().install_default();

        let roots = load_roots(ca_pem)?;
        let certs = load_certs(cert_chain_pem)?;
        let key = load_key(private_key_pem)?;

        let mut config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
            .context("Failed to configure client certificate")?;
        config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

        Ok(config)
    }

    /// Secure handler performing TLS handshakes with rustls
    ///
    /// Plain TCP and UDP pass through unchanged. DTLS is not provided.
    #[derive(Clone)]
    pub struct RustlsHandler {
        acceptor: TlsAcceptor,
        connector: TlsConnector,
        server_name: Option<String>,
    }

    impl RustlsHandler {
        /// Build from rustls configurations
        pub fn new(server: ServerConfig, client: ClientConfig, server_name: Option<String>) -> Self {
            Self {
                acceptor: TlsAcceptor::from(Arc::new(server)),
                connector: TlsConnector::from(Arc::new(client)),
                server_name,
            }
        }

        /// Build from PEM files; the same certificate serves both roles
        pub fn from_pem_files(
            cert_file: &Path,
            key_file: &Path,
            ca_file: &Path,
            server_name: Option<String>,
        ) -> Result<Self> {
            let cert = std::fs::read_to_string(cert_file)
                .with_context(|| format!("Failed to read certificate {:?}", cert_file))?;
            let key = std::fs::read_to_string(key_file)
                .with_context(|| format!("Failed to read private key {:?}", key_file))?;
            let ca = std::fs::read_to_string(ca_file)
                .with_context(|| format!("Failed to read CA certificate {:?}", ca_file))?;

            let server = make_server_config(&cert, &key, &ca)?;
            let client = make_client_config(&cert, &key, &ca)?;
            info!("TLS handler configured from {:?}", cert_file);
            Ok(Self::new(server, client, server_name))
        }

        async fn handshake(&self, tcp: TcpStream, role: Role) -> io::Result<IoStream> {
            let peer_addr = tcp.peer_addr()?;
            match role {
                Role::Server => {
                    debug!("Accepting TLS connection from {}", peer_addr);
                    let stream = self.acceptor.accept(tcp).await?;
                    Ok(IoStream::Tls(stream))
                }
                Role::Client => {
                    let sni = self
                        .server_name
                        .clone()
                        .unwrap_or_else(|| peer_addr.ip().to_string());
                    debug!("Connecting via TLS to {} (SNI: {})", peer_addr, sni);
                    let server_name = ServerName::try_from(sni.clone()).map_err(|_| {
                        io::Error::new(
                            io::ErrorKind::InvalidInput,
                            format!("Invalid server name: {}", sni),
                        )
                    })?;
                    let stream = self.connector.connect(server_name, tcp).await?;
                    Ok(IoStream::TlsClient(stream))
                }
            }
        }
    }

    #[async_trait]
    impl SecureHandlerFactory for RustlsHandler {
        async fn secure_stream(
            &self,
            tcp: TcpStream,
            role: Role,
            transport: TransportType,
        ) -> io::Result<IoStream> {
            match transport {
                TransportType::Tcp => Ok(IoStream::Plain(tcp)),
                TransportType::Tls => self.handshake(tcp, role).await,
                other => Err(unsupported(other, "not a stream transport")),
            }
        }

        async fn secure_datagram(
            &self,
            udp: UdpSocket,
            _role: Role,
            transport: TransportType,
        ) -> io::Result<Arc<dyn DatagramTransport>> {
            match transport {
                TransportType::Udp => Ok(Arc::new(UdpTransport::new(udp))),
                other => Err(unsupported(other, "no DTLS implementation")),
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[tokio::test]
    async fn test_plain_handler_passes_tcp_through() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = listen_tcp(addr).await.unwrap();
        let bound_addr = listener.local_addr().unwrap();

        let stream = TcpStream::connect(bound_addr).await.unwrap();
        let io_stream = PlainHandler
            .secure_stream(stream, Role::Client, TransportType::Tcp)
            .await
            .unwrap();
        assert!(!io_stream.is_tls());
        assert_eq!(io_stream.peer_addr().unwrap(), bound_addr);
    }

    #[tokio::test]
    async fn test_plain_handler_rejects_secure_transports() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = listen_tcp(addr).await.unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let err = PlainHandler
            .secure_stream(stream, Role::Client, TransportType::Tls)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);

        let udp = connect_udp(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9))
            .await
            .unwrap();
        let err = PlainHandler
            .secure_datagram(udp, Role::Client, TransportType::Dtls)
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[tokio::test]
    async fn test_udp_transport_exchange() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        a.connect(b.local_addr().unwrap()).await.unwrap();
        b.connect(a.local_addr().unwrap()).await.unwrap();

        let a = UdpTransport::new(a);
        let b = UdpTransport::new(b);
        a.send(b"datagram").await.unwrap();

        let mut buf = [0u8; 64];
        let n = b.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"datagram");
    }
}
