use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Result;
use crate::wire::{put_bytes, put_str, FieldReader};

/// Authentication request, the payload of the AUTH frame that opens every connection.
///
/// The client proves possession of the private key behind `access_key` by
/// signing the request fields; see `muxsql_mux::handshake` for the signature.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthRequest {
    /// Database the connection wants to use.
    pub database: String,
    /// Claimed public identity.
    pub access_key: String,
    /// Client device identifier; the replication id is derived from it.
    pub device_uuid: String,
    /// Client clock, unix seconds.
    pub timestamp: u64,
    /// Client-chosen random bytes.
    pub nonce: Bytes,
    /// Proof of possession over the fields above.
    pub signature: Bytes,
}

impl fmt::Debug for AuthRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthRequest")
            .field("database", &self.database)
            .field("access_key", &self.access_key)
            .field("device_uuid", &self.device_uuid)
            .field("timestamp", &self.timestamp)
            .field("nonce", &format_args!("<{} bytes>", self.nonce.len()))
            .field(
                "signature",
                &format_args!("<redacted:{} bytes>", self.signature.len()),
            )
            .finish()
    }
}

impl AuthRequest {
    /// Encode into an AUTH frame payload.
    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::new();
        put_str(&mut dst, &self.database);
        put_str(&mut dst, &self.access_key);
        put_str(&mut dst, &self.device_uuid);
        dst.put_u64_le(self.timestamp);
        put_bytes(&mut dst, &self.nonce);
        put_bytes(&mut dst, &self.signature);
        dst.freeze()
    }

    /// Decode an AUTH frame payload.
    pub fn decode(payload: Bytes) -> Result<Self> {
        let mut body = FieldReader::new(payload);
        let request = AuthRequest {
            database: body.string("database")?,
            access_key: body.string("access key")?,
            device_uuid: body.string("device uuid")?,
            timestamp: body.u64("timestamp")?,
            nonce: body.bytes("nonce")?,
            signature: body.bytes("signature")?,
        };
        body.finish()?;
        Ok(request)
    }
}
