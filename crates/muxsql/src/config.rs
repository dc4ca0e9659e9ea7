use std::path::PathBuf;
use std::sync::Arc;

use tracing::warn;

use crate::cipher::{KeyCipher, Ocb3Cipher, PlaintextCipher};
use crate::credentials::{CredentialError, CredentialManager};
use crate::dispatch::AccessPolicy;
use crate::process_engine::ProcessDatabases;
use crate::service::DbService;

/// Default engine executable, looked up on `PATH`.
pub const DEFAULT_ENGINE: &str = "skdb";

/// Server-wide settings.
#[derive(Clone)]
pub struct ServerConfig {
    /// Directory holding `<db>.db` files.
    pub data_dir: PathBuf,
    pub engine_binary: PathBuf,
    /// Base64 AES-128 key for private keys at rest. `None` stores keys unencrypted.
    pub master_key: Option<String>,
    pub policy: AccessPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            engine_binary: PathBuf::from(DEFAULT_ENGINE),
            master_key: None,
            policy: AccessPolicy::default(),
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("data_dir", &self.data_dir)
            .field("engine_binary", &self.engine_binary)
            .field("master_key", &self.master_key.as_ref().map(|_| "<redacted>"))
            .field("policy", &self.policy)
            .finish()
    }
}

impl ServerConfig {
    pub fn cipher(&self) -> Result<Arc<dyn KeyCipher>, CredentialError> {
        match &self.master_key {
            Some(encoded) => Ok(Arc::new(Ocb3Cipher::from_base64(encoded)?)),
            None => {
                warn!("no master key configured; private keys are stored unencrypted");
                Ok(Arc::new(PlaintextCipher))
            }
        }
    }

    pub fn databases(&self) -> ProcessDatabases {
        ProcessDatabases::new(&self.engine_binary, &self.data_dir)
    }

    pub fn credential_manager(&self) -> Result<CredentialManager, CredentialError> {
        Ok(CredentialManager::new(self.cipher()?))
    }

    pub fn service(&self) -> Result<DbService, CredentialError> {
        Ok(DbService::new(
            Arc::new(self.databases()),
            Arc::new(self.credential_manager()?),
            self.policy,
        ))
    }
}

#[cfg(test)]
mod tests {
    use base64::Engine as _;

    use super::*;

    #[test]
    fn master_key_selects_ocb3() {
        let config = ServerConfig {
            master_key: Some(base64::engine::general_purpose::STANDARD.encode([1u8; 16])),
            ..ServerConfig::default()
        };
        assert_eq!(config.cipher().unwrap().name(), "aes-128-ocb3");
        assert_eq!(ServerConfig::default().cipher().unwrap().name(), "plaintext");
    }

    #[test]
    fn bad_master_key_is_an_error() {
        let config = ServerConfig {
            master_key: Some("short".to_string()),
            ..ServerConfig::default()
        };
        assert!(config.service().is_err());
    }

    #[test]
    fn debug_redacts_master_key() {
        let config = ServerConfig {
            master_key: Some("c2VjcmV0c2VjcmV0c2VjcmV0".to_string()),
            ..ServerConfig::default()
        };
        assert!(!format!("{config:?}").contains("c2Vj"));
    }
}
