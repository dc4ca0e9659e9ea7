//! Connection-level wiring: who is connecting, and what serves their streams.

use std::fmt;
use std::sync::Arc;

use muxsql_frame::AuthRequest;
use muxsql_mux::{ConnectionService, Grant, HandshakeError, Stream, StreamHandler};
use tracing::{debug, info, warn};

use crate::credentials::{decode_stored_key, CredentialManager};
use crate::dispatch::{AccessPolicy, RequestHandler};
use crate::engine::{Databases, Engine};

const COULD_NOT_OPEN: &str = "Could not open database";
const AUTH_FAILED: &str = "Authentication failed";

/// State of one authenticated connection.
pub struct Session {
    pub engine: Arc<dyn Engine>,
    pub access_key: String,
    pub replication_id: String,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("access_key", &self.access_key)
            .field("replication_id", &self.replication_id)
            .finish_non_exhaustive()
    }
}

/// Resolves identities against the database's user table and installs a
/// [`RequestHandler`] on every stream.
pub struct DbService {
    databases: Arc<dyn Databases>,
    credentials: Arc<CredentialManager>,
    policy: AccessPolicy,
}

impl DbService {
    pub fn new(
        databases: Arc<dyn Databases>,
        credentials: Arc<CredentialManager>,
        policy: AccessPolicy,
    ) -> Self {
        Self {
            databases,
            credentials,
            policy,
        }
    }
}

impl ConnectionService for DbService {
    type Session = Session;

    fn authenticate(&self, request: &AuthRequest) -> Result<Grant<Session>, HandshakeError> {
        let engine = self.databases.open(&request.database).map_err(|err| {
            info!(database = %request.database, error = %err, "open failed");
            HandshakeError::new(COULD_NOT_OPEN)
        })?;

        let stored = engine
            .private_key_as_stored(&request.access_key)
            .map_err(|err| {
                warn!(database = %request.database, error = %err, "key lookup failed");
                HandshakeError::new(COULD_NOT_OPEN)
            })?
            .ok_or_else(|| {
                info!(access_key = %request.access_key, "unknown access key");
                HandshakeError::new(AUTH_FAILED)
            })?;

        let private_key = decode_stored_key(&stored)
            .and_then(|encrypted| self.credentials.cipher().decrypt(&encrypted))
            .map_err(|err| {
                warn!(access_key = %request.access_key, error = %err, "stored key unusable");
                HandshakeError::new(AUTH_FAILED)
            })?;

        let replication_id = engine
            .replication_id(&request.device_uuid)
            .map_err(|err| {
                warn!(error = %err, "could not assign replication id");
                HandshakeError::new(COULD_NOT_OPEN)
            })?
            .trim()
            .to_string();
        debug!(access_key = %request.access_key, %replication_id, "identity resolved");

        Ok(Grant {
            private_key,
            session: Session {
                engine,
                access_key: request.access_key.clone(),
                replication_id,
            },
        })
    }

    fn open_stream(&self, session: &Arc<Session>, _stream: &Stream) -> Box<dyn StreamHandler> {
        Box::new(RequestHandler::new(
            Arc::clone(&session.engine),
            Arc::clone(&self.credentials),
            session.access_key.clone(),
            session.replication_id.clone(),
            self.policy,
        ))
    }
}
