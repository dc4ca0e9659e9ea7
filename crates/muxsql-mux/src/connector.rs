//! Client side of the handshake.

use std::fmt;
use std::net::SocketAddr;
#[cfg(unix)]
use std::path::Path;

use futures_util::SinkExt;
use muxsql_frame::{Frame, FrameCodec, FrameKind, CONNECTION_STREAM};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::{MuxError, Result};
use crate::handshake::{sign_request, unix_now};

/// What a client needs to open a connection.
#[derive(Clone)]
pub struct ClientIdentity {
    pub database: String,
    pub access_key: String,
    pub device_uuid: String,
    pub private_key: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("database", &self.database)
            .field("access_key", &self.access_key)
            .field("device_uuid", &self.device_uuid)
            .field(
                "private_key",
                &format_args!("<redacted:{} bytes>", self.private_key.len()),
            )
            .finish()
    }
}

/// Send a signed AUTH frame over `io` and return the framed transport.
///
/// The server answers a bad identity with GOAWAY 1004 and closes; there is
/// no positive acknowledgement.
pub async fn authenticate<T>(io: T, identity: &ClientIdentity) -> Result<Framed<T, FrameCodec>>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let nonce: [u8; 16] = rand::random();
    let request = sign_request(
        &identity.database,
        &identity.access_key,
        &identity.device_uuid,
        &identity.private_key,
        unix_now(),
        nonce.to_vec(),
    )
    .map_err(|err| MuxError::HandshakeFailed {
        code: muxsql_frame::code::HANDSHAKE_FAILED,
        message: err.message,
    })?;

    let mut framed = Framed::new(io, FrameCodec::default());
    framed
        .send(Frame::new(
            FrameKind::Auth,
            CONNECTION_STREAM,
            request.encode(),
        ))
        .await?;
    debug!(database = %identity.database, access_key = %identity.access_key, "sent AUTH");
    Ok(framed)
}

/// Connect over TCP and authenticate.
pub async fn connect_tcp(
    addr: SocketAddr,
    identity: &ClientIdentity,
) -> Result<Framed<TcpStream, FrameCodec>> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    authenticate(stream, identity).await
}

/// Connect over a Unix domain socket and authenticate.
#[cfg(unix)]
pub async fn connect_unix(
    path: impl AsRef<Path>,
    identity: &ClientIdentity,
) -> Result<Framed<tokio::net::UnixStream, FrameCodec>> {
    let stream = tokio::net::UnixStream::connect(path).await?;
    authenticate(stream, identity).await
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;
    use muxsql_frame::AuthRequest;

    use super::*;
    use crate::handshake::{verify_request, HandshakeConfig};

    fn identity() -> ClientIdentity {
        ClientIdentity {
            database: "app".to_string(),
            access_key: "root".to_string(),
            device_uuid: "dev-1".to_string(),
            private_key: Zeroizing::new(vec![3; 32]),
        }
    }

    #[tokio::test]
    async fn authenticate_sends_verifiable_auth_frame() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let _client = authenticate(client_io, &identity()).await.unwrap();

        let mut server = Framed::new(server_io, FrameCodec::default());
        let frame = server.next().await.unwrap().unwrap();
        assert_eq!(frame.kind, FrameKind::Auth);

        let request = AuthRequest::decode(frame.payload).unwrap();
        assert_eq!(request.database, "app");
        assert_eq!(request.nonce.len(), 16);
        verify_request(&request, &[3; 32], unix_now(), &HandshakeConfig::default()).unwrap();
    }

    #[test]
    fn debug_redacts_private_key() {
        let rendered = format!("{:?}", identity());
        assert!(rendered.contains("<redacted:32 bytes>"));
    }
}
