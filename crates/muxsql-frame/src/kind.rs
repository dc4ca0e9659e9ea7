//! Frame kinds carried in the physical header.
//!
//! Stream 0 is reserved for connection-level frames (`Auth`, `GoAway`,
//! `Ping`, `Pong`). Application streams start at 1.

use crate::error::{FrameError, Result};

/// Stream id used by connection-level frames.
pub const CONNECTION_STREAM: u32 = 0;

/// What a physical frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Authentication request, first frame of every connection.
    Auth,
    /// An encoded protocol [`Message`](crate::Message) for one stream.
    Stream,
    /// Graceful close of one stream.
    Close,
    /// Error on one stream; payload is `code` + message.
    Reset,
    /// Error on the whole connection; payload is `code` + message.
    GoAway,
    /// Keepalive probe.
    Ping,
    /// Keepalive answer.
    Pong,
}

impl FrameKind {
    /// Wire byte for this kind.
    pub fn as_byte(self) -> u8 {
        match self {
            FrameKind::Auth => 0x01,
            FrameKind::Stream => 0x02,
            FrameKind::Close => 0x03,
            FrameKind::Reset => 0x04,
            FrameKind::GoAway => 0x05,
            FrameKind::Ping => 0x06,
            FrameKind::Pong => 0x07,
        }
    }

    /// Parse a wire byte.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x01 => Ok(FrameKind::Auth),
            0x02 => Ok(FrameKind::Stream),
            0x03 => Ok(FrameKind::Close),
            0x04 => Ok(FrameKind::Reset),
            0x05 => Ok(FrameKind::GoAway),
            0x06 => Ok(FrameKind::Ping),
            0x07 => Ok(FrameKind::Pong),
            other => Err(FrameError::UnknownKind(other)),
        }
    }

    /// Returns a human-readable name for the kind.
    pub fn name(self) -> &'static str {
        match self {
            FrameKind::Auth => "AUTH",
            FrameKind::Stream => "STREAM",
            FrameKind::Close => "CLOSE",
            FrameKind::Reset => "RESET",
            FrameKind::GoAway => "GOAWAY",
            FrameKind::Ping => "PING",
            FrameKind::Pong => "PONG",
        }
    }

    /// Returns true if frames of this kind belong to the connection, not a stream.
    pub fn is_connection_level(self) -> bool {
        matches!(
            self,
            FrameKind::Auth | FrameKind::GoAway | FrameKind::Ping | FrameKind::Pong
        )
    }
}
