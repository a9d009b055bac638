//! `tokio-util` codec for framed byte streams.

use crate::frame::{Frame, FrameDecoder, DEFAULT_MAX_PAYLOAD};
use crate::WireError;
use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

/// Stream codec producing and consuming [`Frame`]s
///
/// Decoding is resumable: an incomplete frame is left in the buffer until
/// more bytes arrive. Every error other than [`WireError::Io`] is fatal for
/// the stream.
#[derive(Debug, Default)]
pub struct FrameCodec {
    decoder: FrameDecoder,
}

impl FrameCodec {
    /// Create a codec with the default payload limit
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD)
    }

    /// Create a codec with a custom payload limit
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            decoder: FrameDecoder::with_max_payload(max_payload),
        }
    }

    /// Payload limit applied in both directions
    pub fn max_payload(&self) -> usize {
        self.decoder.max_payload()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, WireError> {
        self.decoder.decode(src)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = WireError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), WireError> {
        let size = frame.payload_len();
        if size > self.max_payload() {
            return Err(WireError::Size {
                size,
                max: self.max_payload(),
            });
        }
        frame.encode_into(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ControlCode, ErrorCode};
    use bytes::Bytes;
    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    #[tokio::test]
    async fn test_framed_duplex() {
        let (client, server) = tokio::io::duplex(64);
        let mut writer = FramedWrite::new(client, FrameCodec::new());
        let mut reader = FramedRead::new(server, FrameCodec::new());

        let frames = vec![
            Frame::control(8080, 1, ControlCode::SessionOpen),
            Frame::data(8080, 1, Bytes::from(vec![0xAB; 300])),
            Frame::error(8080, 1, ErrorCode::ConnReset),
            Frame::control(8080, 1, ControlCode::SessionClose),
        ];

        let expected = frames.clone();
        let send = tokio::spawn(async move {
            for frame in frames {
                writer.send(frame).await.unwrap();
            }
        });

        for frame in expected {
            assert_eq!(reader.next().await.unwrap().unwrap(), frame);
        }
        send.await.unwrap();
    }

    #[test]
    fn test_byte_at_a_time() {
        let frame = Frame::data(22, 3, Bytes::from_static(b"ssh-2.0"));
        let encoded = frame.encode().unwrap();

        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        let mut decoded = None;
        for byte in encoded.iter() {
            assert!(decoded.is_none());
            buf.extend_from_slice(&[*byte]);
            decoded = codec.decode(&mut buf).unwrap();
        }
        assert_eq!(decoded, Some(frame));
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let mut codec = FrameCodec::with_max_payload(4);
        let mut dst = BytesMut::new();
        let result = codec.encode(Frame::data(1, 1, Bytes::from_static(b"12345")), &mut dst);
        assert!(matches!(result, Err(WireError::Size { size: 5, max: 4 })));
        assert!(dst.is_empty());
    }

    #[test]
    fn test_bad_version_is_fatal() {
        let mut buf = BytesMut::from(&[0x12u8, 0, 0, 80, 0, 0, 0, 1, 0, 0, 0, 0][..]);
        let err = FrameCodec::new().decode(&mut buf).unwrap_err();
        assert!(err.is_desync());
    }
}
