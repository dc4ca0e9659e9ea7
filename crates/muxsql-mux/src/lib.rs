//! Authenticated stream multiplexing for muxsql.
//!
//! A [`Connection`] authenticates its client once, then carries any number
//! of [`Stream`]s. Each stream gets a [`StreamHandler`] from the
//! application's [`ConnectionService`]; handlers run on the blocking pool and
//! reply through the stream handle.

pub mod connection;
pub mod connector;
pub mod error;
pub mod handler;
pub mod handshake;
pub mod listener;
pub mod stream;

pub use connection::{Connection, ConnectionConfig, ConnectionService, Grant};
pub use connector::{authenticate, connect_tcp, ClientIdentity};
#[cfg(unix)]
pub use connector::connect_unix;
pub use error::{MuxError, Result};
pub use handler::{HandlerError, StreamHandler, Transition};
pub use handshake::{sign_request, HandshakeConfig, HandshakeError};
pub use listener::Listener;
pub use stream::{Stream, StreamState};
