//! Local TCP forwarding: bridge a local socket to one session.

use crate::channel::{Channel, ChannelError};
use crate::endpoint::{QueueEndpoint, SessionMessage};
use serde::Serialize;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use usc_wire::ErrorCode;

/// Largest chunk read from the local socket per DATA frame
pub const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Bytes moved by one forwarded connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ForwardStats {
    /// Session id that carried the connection
    pub session_id: u32,
    /// Bytes read locally and sent to the peer
    pub bytes_out: u64,
    /// Bytes received from the peer and written locally
    pub bytes_in: u64,
}

/// Forward a local byte stream over a new session to `port`
///
/// Returns when either side is done. Local socket failures are reported to
/// the peer as ERROR frames and end the forwarding without an error.
pub async fn forward_stream<S>(
    channel: Arc<Channel>,
    port: u16,
    stream: S,
) -> Result<ForwardStats, ChannelError>
where
    S: AsyncRead + AsyncWrite + Send,
{
    let (endpoint, mut messages) = QueueEndpoint::new();
    let session = channel.open_session(port, Arc::new(endpoint)).await?;
    let mut stats = ForwardStats {
        session_id: session.id(),
        ..ForwardStats::default()
    };

    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut buf = vec![0u8; READ_CHUNK_SIZE.min(channel.max_payload()).max(1)];

    loop {
        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    debug!("Local side of session {} reached EOF", stats.session_id);
                    match session.close().await {
                        Ok(()) | Err(ChannelError::UnknownSession(_)) => {}
                        Err(e) => return Err(e),
                    }
                    let _ = writer.shutdown().await;
                    break;
                }
                Ok(n) => {
                    match session.send(buf[..n].to_vec()).await {
                        Ok(()) => stats.bytes_out += n as u64,
                        // Peer closed the session; its Close is already queued
                        Err(ChannelError::UnknownSession(_)) => continue,
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => {
                    warn!("Local read on session {} failed: {}", stats.session_id, e);
                    report_local_failure(&session, &e).await;
                    break;
                }
            },
            message = messages.recv() => match message {
                Some(SessionMessage::Data(payload)) => {
                    if let Err(e) = writer.write_all(&payload).await {
                        warn!("Local write on session {} failed: {}", stats.session_id, e);
                        report_local_failure(&session, &e).await;
                        break;
                    }
                    stats.bytes_in += payload.len() as u64;
                }
                Some(SessionMessage::Error(code)) => {
                    warn!("Peer reported {} on session {}", code, stats.session_id);
                    let _ = session.close().await;
                    let _ = writer.shutdown().await;
                    break;
                }
                Some(SessionMessage::Closed) | None => {
                    debug!("Session {} closed, shutting local socket", stats.session_id);
                    let _ = writer.shutdown().await;
                    break;
                }
            },
        }
    }

    debug!(
        "Forwarding on session {} finished: {} bytes out, {} bytes in",
        stats.session_id, stats.bytes_out, stats.bytes_in
    );
    Ok(stats)
}

async fn report_local_failure(session: &crate::channel::SessionHandle, err: &std::io::Error) {
    let _ = session.send_error(ErrorCode::from_io_error(err)).await;
    let _ = session.close().await;
}

/// Forward one accepted TCP client over a new session to `port`
pub async fn forward_tcp(
    channel: Arc<Channel>,
    port: u16,
    stream: TcpStream,
) -> Result<ForwardStats, ChannelError> {
    stream.set_nodelay(true).map_err(ChannelError::Transport)?;
    if let Ok(peer) = stream.peer_addr() {
        debug!("Forwarding {} to port {} on {}", peer, port, channel.device_id());
    }
    forward_stream(channel, port, stream).await
}

/// Accept local clients and forward each to `port` until the channel closes
pub async fn serve_forward(channel: Arc<Channel>, port: u16, listener: &TcpListener) {
    if let Ok(local) = listener.local_addr() {
        info!(
            "Forwarding {} to port {} on {}",
            local,
            port,
            channel.device_id()
        );
    }

    loop {
        let stream = tokio::select! {
            _ = channel.closed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!("Failed to accept local client: {}", e);
                    continue;
                }
            },
        };

        let channel = channel.clone();
        tokio::spawn(async move {
            if let Err(e) = forward_tcp(channel, port, stream).await {
                warn!("Forwarding to port {} failed: {}", port, e);
            }
        });
    }

    debug!("Forwarder for port {} stopped", port);
}
