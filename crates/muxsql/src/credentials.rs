//! Access keys and private keys for database users.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use base64::Engine as _;
use muxsql_frame::{Message, SecretBytes};
use rand::rngs::StdRng;
use rand::{CryptoRng, Rng, RngCore, SeedableRng};
use zeroize::{Zeroize, Zeroizing};

use crate::cipher::KeyCipher;

/// Length of a generated access key.
pub const ACCESS_KEY_LEN: usize = 20;

/// Length of a generated private key in bytes.
pub const PRIVATE_KEY_LEN: usize = 32;

const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("key cipher: {0}")]
    Cipher(&'static str),

    #[error("invalid master key: {0}")]
    MasterKey(String),

    #[error("stored key is not valid base64")]
    Encoding,
}

/// A freshly generated user identity.
///
/// The plaintext private key exists only until [`Credentials::clear`] or drop.
pub struct Credentials {
    pub access_key: String,
    pub private_key: Zeroizing<Vec<u8>>,
    pub encrypted_private_key: Vec<u8>,
}

impl Credentials {
    pub fn b64_private_key(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.private_key.as_slice())
    }

    pub fn b64_encrypted_key(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.encrypted_private_key)
    }

    /// Overwrite the plaintext key with zeros and empty it.
    pub fn clear(&mut self) {
        self.private_key.zeroize();
    }

    pub fn is_cleared(&self) -> bool {
        self.private_key.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field(
                "private_key",
                &format_args!("<redacted:{} bytes>", self.private_key.len()),
            )
            .field("encrypted_private_key_len", &self.encrypted_private_key.len())
            .finish()
    }
}

/// Decode the base64 stored form of a key.
pub fn decode_stored_key(encoded: &[u8]) -> Result<Vec<u8>, CredentialError> {
    let trimmed = encoded.trim_ascii();
    base64::engine::general_purpose::STANDARD
        .decode(trimmed)
        .map_err(|_| CredentialError::Encoding)
}

/// Cryptographically secure randomness that can be shared across threads.
pub trait SecureRng: RngCore + CryptoRng + Send {}

impl<T: RngCore + CryptoRng + Send> SecureRng for T {}

/// Generates credentials from a shared CSPRNG.
pub struct CredentialManager {
    rng: Mutex<Box<dyn SecureRng>>,
    cipher: Arc<dyn KeyCipher>,
}

impl CredentialManager {
    /// Seeded from the operating system.
    pub fn new(cipher: Arc<dyn KeyCipher>) -> Self {
        Self::with_rng(StdRng::from_entropy(), cipher)
    }

    pub fn with_rng(rng: impl SecureRng + 'static, cipher: Arc<dyn KeyCipher>) -> Self {
        Self {
            rng: Mutex::new(Box::new(rng)),
            cipher,
        }
    }

    pub fn cipher(&self) -> &Arc<dyn KeyCipher> {
        &self.cipher
    }

    /// 20 symbols drawn uniformly from `0-9A-Za-z`.
    pub fn generate_access_key(&self) -> String {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        (0..ACCESS_KEY_LEN)
            .map(|_| char::from(ALPHABET[rng.gen_range(0..ALPHABET.len())]))
            .collect()
    }

    pub fn generate_credentials(&self, access_key: String) -> Result<Credentials, CredentialError> {
        let mut private_key = Zeroizing::new(vec![0u8; PRIVATE_KEY_LEN]);
        self.rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fill_bytes(&mut private_key);
        let encrypted_private_key = self.cipher.encrypt(&private_key)?;
        Ok(Credentials {
            access_key,
            private_key,
            encrypted_private_key,
        })
    }
}

impl fmt::Debug for CredentialManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialManager")
            .field("cipher", &self.cipher.name())
            .finish_non_exhaustive()
    }
}

/// Hand `credentials` to `send` as a Credentials message, then erase every
/// plaintext copy, whether or not sending succeeded.
pub fn transmit_once<E>(
    credentials: &mut Credentials,
    send: impl FnOnce(&Message) -> Result<(), E>,
) -> Result<(), E> {
    let mut message = Message::Credentials {
        access_key: credentials.access_key.clone(),
        private_key: SecretBytes::new(credentials.private_key.to_vec()),
    };
    let result = send(&message);
    if let Message::Credentials { private_key, .. } = &mut message {
        private_key.clear();
    }
    credentials.clear();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::{Ocb3Cipher, PlaintextCipher};

    fn seeded(seed: u64) -> CredentialManager {
        CredentialManager::with_rng(StdRng::seed_from_u64(seed), Arc::new(PlaintextCipher))
    }

    #[test]
    fn access_keys_use_the_alphabet() {
        let manager = seeded(1);
        for _ in 0..200 {
            let key = manager.generate_access_key();
            assert_eq!(key.len(), ACCESS_KEY_LEN);
            assert!(key.bytes().all(|b| b.is_ascii_alphanumeric()));
        }
    }

    #[test]
    fn access_keys_cover_the_alphabet() {
        let manager = seeded(2);
        let mut seen = [false; 62];
        for _ in 0..100 {
            for b in manager.generate_access_key().bytes() {
                let index = ALPHABET.iter().position(|&a| a == b).unwrap();
                seen[index] = true;
            }
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn same_seed_same_keys() {
        assert_eq!(
            seeded(7).generate_access_key(),
            seeded(7).generate_access_key()
        );
        assert_ne!(
            seeded(7).generate_access_key(),
            seeded(8).generate_access_key()
        );
    }

    #[test]
    fn credentials_are_encrypted_with_the_cipher() {
        let cipher = Arc::new(Ocb3Cipher::new(&[5; 16]));
        let manager = CredentialManager::with_rng(StdRng::seed_from_u64(3), cipher.clone());
        let creds = manager.generate_credentials("AK".to_string()).unwrap();
        assert_eq!(creds.private_key.len(), PRIVATE_KEY_LEN);
        assert_ne!(creds.encrypted_private_key, creds.private_key.to_vec());
        assert_eq!(
            cipher.decrypt(&creds.encrypted_private_key).unwrap().as_slice(),
            creds.private_key.as_slice()
        );
    }

    #[test]
    fn stored_form_decodes() {
        let manager = seeded(4);
        let creds = manager.generate_credentials("AK".to_string()).unwrap();
        let decoded = decode_stored_key(format!("{}\n", creds.b64_encrypted_key()).as_bytes())
            .unwrap();
        assert_eq!(decoded, creds.encrypted_private_key);
        assert!(matches!(
            decode_stored_key(b"not base64!"),
            Err(CredentialError::Encoding)
        ));
    }

    #[test]
    fn transmit_once_sends_then_clears() {
        let manager = seeded(5);
        let mut creds = manager.generate_credentials("AK".to_string()).unwrap();
        let expected = creds.private_key.to_vec();

        let mut sent = None;
        transmit_once::<()>(&mut creds, |message| {
            sent = Some(message.clone());
            Ok(())
        })
        .unwrap();

        match sent.unwrap() {
            Message::Credentials {
                access_key,
                private_key,
            } => {
                assert_eq!(access_key, "AK");
                assert_eq!(private_key.expose(), expected.as_slice());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(creds.is_cleared());
    }

    #[test]
    fn transmit_once_clears_on_send_failure() {
        let manager = seeded(6);
        let mut creds = manager.generate_credentials("AK".to_string()).unwrap();
        let result = transmit_once(&mut creds, |_| Err("writer gone"));
        assert_eq!(result, Err("writer gone"));
        assert!(creds.is_cleared());
    }

    #[test]
    fn debug_redacts() {
        let manager = seeded(9);
        let creds = manager.generate_credentials("AK".to_string()).unwrap();
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("<redacted:32 bytes>"));
        assert!(!rendered.contains(&creds.b64_private_key()));
    }
}
