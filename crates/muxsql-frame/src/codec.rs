use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::error::{FrameError, Result};
use crate::kind::{FrameKind, CONNECTION_STREAM};

/// Frame header: magic (2) + kind (1) + stream (4) + length (4) = 11 bytes.
pub const HEADER_SIZE: usize = 11;

/// Magic bytes: "MX" (0x4D 0x58).
pub const MAGIC: [u8; 2] = [0x4D, 0x58];

/// Default maximum payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// A physical frame addressed to one stream (or to the connection, stream 0).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// What the payload carries.
    pub kind: FrameKind,
    /// The stream this frame belongs to.
    pub stream: u32,
    /// The frame payload.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(kind: FrameKind, stream: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            stream,
            payload: payload.into(),
        }
    }

    /// A STREAM frame carrying an already encoded message.
    pub fn message(stream: u32, encoded: impl Into<Bytes>) -> Self {
        Self::new(FrameKind::Stream, stream, encoded)
    }

    /// A graceful CLOSE for `stream`.
    pub fn close(stream: u32) -> Self {
        Self::new(FrameKind::Close, stream, Bytes::new())
    }

    /// A RESET for `stream` carrying an error code and message.
    pub fn reset(stream: u32, code: u32, message: &str) -> Self {
        Self::new(FrameKind::Reset, stream, encode_error(code, message))
    }

    /// A connection-level GOAWAY carrying an error code and message.
    pub fn go_away(code: u32, message: &str) -> Self {
        Self::new(FrameKind::GoAway, CONNECTION_STREAM, encode_error(code, message))
    }

    /// A keepalive probe.
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(FrameKind::Ping, CONNECTION_STREAM, payload)
    }

    /// The answer to a keepalive probe; echoes its payload.
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(FrameKind::Pong, CONNECTION_STREAM, payload)
    }

    /// Decode the `(code, message)` pair of a RESET or GOAWAY frame.
    pub fn error_parts(&self) -> Result<(u32, String)> {
        let mut payload = self.payload.clone();
        if payload.remaining() < 4 {
            return Err(FrameError::malformed("error frame shorter than its code"));
        }
        let code = payload.get_u32_le();
        let message = String::from_utf8(payload.to_vec())
            .map_err(|_| FrameError::malformed("error message is not UTF-8"))?;
        Ok((code, message))
    }

    /// The total wire size of this frame (header + payload).
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

fn encode_error(code: u32, message: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + message.len());
    buf.put_u32_le(code);
    buf.put_slice(message.as_bytes());
    buf.freeze()
}

/// Encode a frame into the wire format.
///
/// Wire format:
/// ```text
/// ┌────────────┬──────────┬─────────────┬─────────────┬─────────────────┐
/// │ Magic (2B) │ Kind(1B) │ Stream      │ Length      │ Payload          │
/// │ 0x4D 0x58  │          │ (4B LE)     │ (4B LE)     │ (Length bytes)   │
/// │ "MX"       │          │             │             │                  │
/// └────────────┴──────────┴─────────────┴─────────────┴─────────────────┘
/// ```
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) -> Result<()> {
    if frame.payload.len() > u32::MAX as usize {
        return Err(FrameError::PayloadTooLarge {
            size: frame.payload.len(),
            max: u32::MAX as usize,
        });
    }
    dst.reserve(frame.wire_size());
    dst.put_slice(&MAGIC);
    dst.put_u8(frame.kind.as_byte());
    dst.put_u32_le(frame.stream);
    dst.put_u32_le(frame.payload.len() as u32);
    dst.put_slice(&frame.payload);
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
    if src.len() < HEADER_SIZE {
        return Ok(None); // Need more data
    }

    let mut header = &src[..HEADER_SIZE];
    if header[..2] != MAGIC {
        return Err(FrameError::InvalidMagic);
    }
    header.advance(2);

    let kind = FrameKind::from_byte(header.get_u8())?;
    let stream = header.get_u32_le();
    let payload_len = header.get_u32_le() as usize;

    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    let total = HEADER_SIZE + payload_len;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None); // Need more data
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(payload_len).freeze();

    Ok(Some(Frame {
        kind,
        stream,
        payload,
    }))
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 16 MiB.
    pub max_payload_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}

/// `tokio_util` codec for [`Frame`]s.
///
/// Wrap any `AsyncRead + AsyncWrite` in `Framed::new(io, FrameCodec::default())`
/// to get a `Stream` of frames and a `Sink` for frames.
#[derive(Debug, Clone, Default)]
pub struct FrameCodec {
    config: FrameConfig,
}

impl FrameCodec {
    /// Create a codec with explicit configuration.
    pub fn with_config(config: FrameConfig) -> Self {
        Self { config }
    }

    /// Update maximum payload size for subsequent frames in both directions.
    pub fn set_max_payload_size(&mut self, max_payload_size: usize) {
        self.config.max_payload_size = max_payload_size;
    }

    /// Current codec configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        let frame = decode_frame(src, self.config.max_payload_size)?;
        if let Some(frame) = &frame {
            trace!(
                kind = frame.kind.name(),
                stream = frame.stream,
                size = frame.payload.len(),
                "decoded frame"
            );
        }
        Ok(frame)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(FrameError::ConnectionClosed),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        if frame.payload.len() > self.config.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: frame.payload.len(),
                max: self.config.max_payload_size,
            });
        }
        encode_frame(&frame, dst)
    }
}
