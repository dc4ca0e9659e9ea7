//! Encryption of private keys at rest.
//!
//! Stored form produced by [`Ocb3Cipher`]:
//!
//! ```text
//! [nonce: 12 bytes][ciphertext][tag: 16 bytes]
//! ```

use aead::{Aead, KeyInit};
use aes::Aes128;
use base64::Engine as _;
use ocb3::Ocb3;
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::credentials::CredentialError;

type Aes128Ocb3 = Ocb3<Aes128>;

/// Master key length in bytes.
pub const MASTER_KEY_LEN: usize = 16;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Turns private keys into their stored form and back.
pub trait KeyCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CredentialError>;

    fn decrypt(&self, stored: &[u8]) -> Result<Zeroizing<Vec<u8>>, CredentialError>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Stores keys unchanged. Only for databases created without a master key.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaintextCipher;

impl KeyCipher for PlaintextCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CredentialError> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, stored: &[u8]) -> Result<Zeroizing<Vec<u8>>, CredentialError> {
        Ok(Zeroizing::new(stored.to_vec()))
    }

    fn name(&self) -> &'static str {
        "plaintext"
    }
}

/// AES-128-OCB3 under a server-wide master key.
pub struct Ocb3Cipher {
    cipher: Aes128Ocb3,
}

impl Ocb3Cipher {
    pub fn new(master_key: &[u8; MASTER_KEY_LEN]) -> Self {
        Self {
            cipher: Aes128Ocb3::new(master_key.into()),
        }
    }

    /// Parse a base64 master key (standard or URL-safe alphabet, padding optional).
    pub fn from_base64(encoded: &str) -> Result<Self, CredentialError> {
        let trimmed = encoded.trim().trim_end_matches('=');
        let bytes = Zeroizing::new(
            base64::engine::general_purpose::STANDARD_NO_PAD
                .decode(trimmed)
                .or_else(|_| base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(trimmed))
                .map_err(|_| CredentialError::MasterKey("not valid base64".to_string()))?,
        );
        let key: [u8; MASTER_KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
            CredentialError::MasterKey(format!(
                "expected {MASTER_KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        let key = Zeroizing::new(key);
        Ok(Self::new(&key))
    }
}

impl KeyCipher for Ocb3Cipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CredentialError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt((&nonce).into(), plaintext)
            .map_err(|_| CredentialError::Cipher("encryption failed"))?;

        let mut stored = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        stored.extend_from_slice(&nonce);
        stored.extend_from_slice(&ciphertext);
        Ok(stored)
    }

    fn decrypt(&self, stored: &[u8]) -> Result<Zeroizing<Vec<u8>>, CredentialError> {
        if stored.len() < NONCE_LEN + TAG_LEN {
            return Err(CredentialError::Cipher("stored key too short"));
        }
        let (nonce, ciphertext) = stored.split_at(NONCE_LEN);
        let nonce: [u8; NONCE_LEN] = nonce
            .try_into()
            .map_err(|_| CredentialError::Cipher("stored key too short"))?;

        self.cipher
            .decrypt((&nonce).into(), ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| CredentialError::Cipher("stored key failed authentication"))
    }

    fn name(&self) -> &'static str {
        "aes-128-ocb3"
    }
}
