//! Wire framing and protocol message codec for muxsql.
//!
//! Every physical frame is:
//! - A 2-byte magic number ("MX") for stream synchronization
//! - A 1-byte frame kind
//! - A 4-byte little-endian stream ID for multiplexing
//! - A 4-byte little-endian payload length
//!
//! STREAM frames carry one encoded [`Message`]; the other kinds carry
//! connection and stream control (auth, close, reset, goaway, keepalive).

mod wire;

pub mod auth;
pub mod code;
pub mod codec;
pub mod error;
pub mod kind;
pub mod message;

pub use auth::AuthRequest;
pub use codec::{
    decode_frame, encode_frame, Frame, FrameCodec, FrameConfig, DEFAULT_MAX_PAYLOAD, HEADER_SIZE,
};
pub use error::{FrameError, Result};
pub use kind::{FrameKind, CONNECTION_STREAM};
pub use message::{Message, QueryFormat, SchemaScope, SecretBytes};
