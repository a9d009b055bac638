//! Per-channel I/O tasks.
//!
//! Every channel runs one reader and one writer task. The reader decodes
//! frames and hands them to [`Channel::on_frame_received`] in arrival order;
//! the writer drains the channel's outbound queue. Both stop when the channel
//! is closed.

use crate::channel::{Channel, ChannelConfig, PROTOCOL_ERROR};
use crate::endpoint::EndpointFactory;
use crate::transport::{Connection, DatagramTransport};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use usc_monitor::{ErrorLevel, EventDispatcher};
use usc_wire::{ErrorCode, Frame, FrameCodec, WireError, HEADER_SIZE};

/// Depth of each channel's outbound frame queue
pub const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// Largest datagram a UDP socket can deliver
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Largest DATA payload that fits in one datagram
pub const MAX_DATAGRAM_PAYLOAD: usize = MAX_DATAGRAM_SIZE - HEADER_SIZE;

/// Start a channel over an established connection
pub fn spawn_channel(
    connection: Connection,
    config: ChannelConfig,
    events: Arc<EventDispatcher>,
    endpoints: Option<Arc<dyn EndpointFactory>>,
) -> Arc<Channel> {
    match connection {
        Connection::Stream(stream) => spawn_stream(stream, config, events, endpoints),
        Connection::Datagram(transport) => spawn_datagram(transport, config, events, endpoints),
    }
}

/// Start a channel over a byte stream
pub fn spawn_stream<S>(
    stream: S,
    config: ChannelConfig,
    events: Arc<EventDispatcher>,
    endpoints: Option<Arc<dyn EndpointFactory>>,
) -> Arc<Channel>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let max_payload = config.max_payload;
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
    let channel = Channel::new(config, tx, events, endpoints);
    let token = channel.shutdown_token();

    let (read_half, write_half) = tokio::io::split(stream);
    let frames = FramedRead::new(read_half, FrameCodec::with_max_payload(max_payload));
    let sink = FramedWrite::new(write_half, FrameCodec::with_max_payload(max_payload));

    tokio::spawn(write_stream(sink, rx, channel.clone(), token.clone()));
    tokio::spawn(read_stream(frames, channel.clone(), token));
    channel
}

/// Start a channel over a datagram transport
pub fn spawn_datagram(
    transport: Arc<dyn DatagramTransport>,
    config: ChannelConfig,
    events: Arc<EventDispatcher>,
    endpoints: Option<Arc<dyn EndpointFactory>>,
) -> Arc<Channel> {
    // A frame must fit in one datagram, so oversize sends fail locally
    let mut config = config;
    if config.max_payload > MAX_DATAGRAM_PAYLOAD {
        debug!(
            "Clamping payload limit for {} from {} to {} bytes",
            config.device_id, config.max_payload, MAX_DATAGRAM_PAYLOAD
        );
        config.max_payload = MAX_DATAGRAM_PAYLOAD;
    }
    let max_payload = config.max_payload;
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
    let channel = Channel::new(config, tx, events, endpoints);
    let token = channel.shutdown_token();

    tokio::spawn(write_datagrams(
        transport.clone(),
        rx,
        channel.clone(),
        token.clone(),
    ));
    tokio::spawn(read_datagrams(transport, max_payload, channel.clone(), token));
    channel
}

fn failure_code(err: &WireError) -> ErrorCode {
    match err {
        WireError::Io(e) => ErrorCode::from_io_error(e),
        _ => PROTOCOL_ERROR,
    }
}

async fn read_stream<R>(mut frames: FramedRead<R, FrameCodec>, channel: Arc<Channel>, token: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = frames.next() => next,
        };

        match next {
            Some(Ok(frame)) => channel.on_frame_received(frame),
            Some(Err(e)) => {
                // The byte stream cannot be resynchronized after a decode error
                channel.fail(failure_code(&e), format!("read failed: {}", e));
                break;
            }
            None => {
                debug!("Peer {} closed the connection", channel.device_id());
                channel.close();
                break;
            }
        }
    }
    trace!("Reader for {} stopped", channel.device_id());
}

async fn write_stream<W>(
    mut sink: FramedWrite<W, FrameCodec>,
    mut rx: mpsc::Receiver<Frame>,
    channel: Arc<Channel>,
    token: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            frame = rx.recv() => frame,
        };
        let Some(frame) = frame else { break };

        let written = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            written = sink.send(frame) => written,
        };
        if let Err(e) = written {
            channel.fail(failure_code(&e), format!("write failed: {}", e));
            break;
        }
    }

    if let Err(e) = sink.close().await {
        debug!("Shutdown of {} stream failed: {}", channel.device_id(), e);
    }
    trace!("Writer for {} stopped", channel.device_id());
}

async fn read_datagrams(
    transport: Arc<dyn DatagramTransport>,
    max_payload: usize,
    channel: Arc<Channel>,
    token: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let received = tokio::select! {
            _ = token.cancelled() => break,
            received = transport.recv(&mut buf) => received,
        };

        match received {
            Ok(len) => match Frame::decode_datagram(&buf[..len], max_payload) {
                Ok(frame) => channel.on_frame_received(frame),
                // A bad datagram does not affect the ones after it
                Err(e) => channel.report_error(
                    PROTOCOL_ERROR,
                    ErrorLevel::Warning,
                    format!("dropped undecodable datagram of {} bytes: {}", len, e),
                ),
            },
            Err(e) => {
                channel.fail(ErrorCode::from_io_error(&e), format!("receive failed: {}", e));
                break;
            }
        }
    }
    trace!("Datagram reader for {} stopped", channel.device_id());
}

async fn write_datagrams(
    transport: Arc<dyn DatagramTransport>,
    mut rx: mpsc::Receiver<Frame>,
    channel: Arc<Channel>,
    token: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            frame = rx.recv() => frame,
        };
        let Some(frame) = frame else { break };

        let datagram = match frame.encode() {
            Ok(datagram) => datagram,
            Err(e) => {
                channel.fail(failure_code(&e), format!("encode failed: {}", e));
                break;
            }
        };
        if let Err(e) = transport.send(&datagram).await {
            channel.fail(ErrorCode::from_io_error(&e), format!("send failed: {}", e));
            break;
        }
    }
    trace!("Datagram writer for {} stopped", channel.device_id());
}
