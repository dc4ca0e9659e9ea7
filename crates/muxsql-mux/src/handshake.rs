//! Connection authentication.
//!
//! The first frame on every connection is an AUTH frame carrying an
//! [`AuthRequest`]. The client proves it holds the private key behind its
//! access key by signing
//!
//! ```text
//! HMAC-SHA256(private_key, "muxsql-auth" ‖ access_key ‖ timestamp ‖ nonce)
//! ```
//!
//! where `timestamp` is the decimal rendering of the unix-seconds field.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use hmac::{Hmac, Mac};
use muxsql_frame::AuthRequest;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Domain separator mixed into every signature.
pub const AUTH_CONTEXT: &[u8] = b"muxsql-auth";

const MAX_ACCESS_KEY_LEN: usize = 128;
const MAX_DATABASE_LEN: usize = 128;
const MAX_DEVICE_UUID_LEN: usize = 128;
const MAX_NONCE_LEN: usize = 256;

/// Configuration for the server side of the handshake.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// How long a new connection may take to send its AUTH frame.
    pub timeout: Duration,
    /// Largest accepted distance between the client clock and ours.
    pub max_clock_skew: Duration,
    /// Maximum AUTH frame payload size in bytes.
    pub max_handshake_payload: usize,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_clock_skew: Duration::from_secs(300),
            max_handshake_payload: 16 * 1024,
        }
    }
}

/// Why a connection was refused. The message is sent to the client with code 1004.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandshakeError {
    pub message: String,
}

impl HandshakeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Bytes covered by the request signature.
pub fn signing_input(access_key: &str, timestamp: u64, nonce: &[u8]) -> Vec<u8> {
    let timestamp = timestamp.to_string();
    let mut input =
        Vec::with_capacity(AUTH_CONTEXT.len() + access_key.len() + timestamp.len() + nonce.len());
    input.extend_from_slice(AUTH_CONTEXT);
    input.extend_from_slice(access_key.as_bytes());
    input.extend_from_slice(timestamp.as_bytes());
    input.extend_from_slice(nonce);
    input
}

/// Build a signed request, as a client does.
pub fn sign_request(
    database: &str,
    access_key: &str,
    device_uuid: &str,
    private_key: &[u8],
    timestamp: u64,
    nonce: impl Into<Bytes>,
) -> Result<AuthRequest, HandshakeError> {
    let nonce = nonce.into();
    let signature = mac(private_key, &signing_input(access_key, timestamp, &nonce))?
        .finalize()
        .into_bytes();
    Ok(AuthRequest {
        database: database.to_string(),
        access_key: access_key.to_string(),
        device_uuid: device_uuid.to_string(),
        timestamp,
        nonce,
        signature: Bytes::copy_from_slice(&signature),
    })
}

/// Reject requests whose identity fields are empty or oversized before any lookup.
pub fn validate_request(request: &AuthRequest) -> Result<(), HandshakeError> {
    if request.database.is_empty() || request.database.len() > MAX_DATABASE_LEN {
        return Err(HandshakeError::new(format!(
            "invalid database name length: {}",
            request.database.len()
        )));
    }
    if request.access_key.is_empty() || request.access_key.len() > MAX_ACCESS_KEY_LEN {
        return Err(HandshakeError::new(format!(
            "invalid access key length: {}",
            request.access_key.len()
        )));
    }
    if request.device_uuid.len() > MAX_DEVICE_UUID_LEN {
        return Err(HandshakeError::new(format!(
            "invalid device uuid length: {}",
            request.device_uuid.len()
        )));
    }
    if request.nonce.is_empty() || request.nonce.len() > MAX_NONCE_LEN {
        return Err(HandshakeError::new(format!(
            "invalid nonce length: {}",
            request.nonce.len()
        )));
    }
    Ok(())
}

/// Check the request signature against the stored private key and the clock.
///
/// `now` is unix seconds. The signature comparison is constant-time.
pub fn verify_request(
    request: &AuthRequest,
    private_key: &[u8],
    now: u64,
    config: &HandshakeConfig,
) -> Result<(), HandshakeError> {
    let skew = now.abs_diff(request.timestamp);
    if skew > config.max_clock_skew.as_secs() {
        return Err(HandshakeError::new(format!(
            "timestamp outside allowed clock skew ({skew}s)"
        )));
    }

    mac(
        private_key,
        &signing_input(&request.access_key, request.timestamp, &request.nonce),
    )?
    .verify_slice(&request.signature)
    .map_err(|_| HandshakeError::new("Authentication failed"))
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

fn mac(key: &[u8], input: &[u8]) -> Result<HmacSha256, HandshakeError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|_| HandshakeError::new("invalid signing key"))?;
    mac.update(input);
    Ok(mac)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [0x5A; 32];
    const NOW: u64 = 1_700_000_000;

    fn signed() -> AuthRequest {
        sign_request("app", "AbCdEfGhIjKlMnOpQrSt", "device-1", &KEY, NOW, "nonce-01").unwrap()
    }

    #[test]
    fn signed_request_verifies() {
        let request = signed();
        assert_eq!(request.signature.len(), 32);
        verify_request(&request, &KEY, NOW, &HandshakeConfig::default()).unwrap();
    }

    #[test]
    fn wrong_key_is_rejected() {
        let err = verify_request(&signed(), &[0u8; 32], NOW, &HandshakeConfig::default())
            .unwrap_err();
        assert_eq!(err.message, "Authentication failed");
    }

    #[test]
    fn tampered_fields_are_rejected() {
        let config = HandshakeConfig::default();

        let mut request = signed();
        request.access_key = "root".to_string();
        assert!(verify_request(&request, &KEY, NOW, &config).is_err());

        let mut request = signed();
        request.nonce = Bytes::from_static(b"nonce-02");
        assert!(verify_request(&request, &KEY, NOW, &config).is_err());
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let config = HandshakeConfig {
            max_clock_skew: Duration::from_secs(30),
            ..HandshakeConfig::default()
        };
        assert!(verify_request(&signed(), &KEY, NOW + 29, &config).is_ok());

        let err = verify_request(&signed(), &KEY, NOW + 31, &config).unwrap_err();
        assert!(err.message.contains("clock skew"));
        assert!(verify_request(&signed(), &KEY, NOW - 31, &config).is_err());
    }

    #[test]
    fn signing_input_layout() {
        assert_eq!(signing_input("k", 42, b"n"), b"muxsql-authk42n".to_vec());
    }

    #[test]
    fn validate_rejects_empty_identity() {
        let mut request = signed();
        request.access_key.clear();
        assert!(validate_request(&request)
            .unwrap_err()
            .message
            .contains("access key"));

        let mut request = signed();
        request.database = "d".repeat(MAX_DATABASE_LEN + 1);
        assert!(validate_request(&request).is_err());

        let mut request = signed();
        request.nonce = Bytes::new();
        assert!(validate_request(&request).is_err());

        assert!(validate_request(&signed()).is_ok());
    }
}
