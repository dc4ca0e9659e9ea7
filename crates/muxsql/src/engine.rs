//! The database engine, as seen from the request handlers.
//!
//! SQL semantics live entirely behind [`Engine`]; this crate only moves
//! bytes to and from it.

use std::io;
use std::process::Child;
use std::sync::Arc;

use muxsql_frame::QueryFormat;

/// Output format handed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    Csv,
    Json,
    Raw,
}

impl OutputFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Csv => "csv",
            OutputFormat::Json => "json",
            OutputFormat::Raw => "raw",
        }
    }
}

impl From<QueryFormat> for OutputFormat {
    fn from(format: QueryFormat) -> Self {
        match format {
            QueryFormat::Csv => OutputFormat::Csv,
            QueryFormat::Json => OutputFormat::Json,
            QueryFormat::Raw => OutputFormat::Raw,
        }
    }
}

/// Parameters of a continuous change export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailRequest {
    pub table: String,
    /// Cursor; only changes after it are exported.
    pub since: u64,
    pub filter_expr: Option<String>,
}

/// Errors reported by an engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The engine ran and refused; the text is its own diagnostic.
    #[error("{0}")]
    Failed(String),

    /// The engine process could not be started.
    #[error("could not start engine: {0}")]
    Spawn(#[source] io::Error),

    /// I/O with a running engine failed.
    #[error("engine I/O error: {0}")]
    Io(#[from] io::Error),

    /// A database, table or user name that cannot be passed to the engine.
    #[error("invalid {kind} name: {name:?}")]
    InvalidName { kind: &'static str, name: String },

    #[error("database {0:?} does not exist")]
    NoSuchDatabase(String),

    #[error("database {0:?} already exists")]
    AlreadyExists(String),
}

impl EngineError {
    /// Whether the message may be shown to a client as-is.
    pub fn is_revealable(&self) -> bool {
        matches!(
            self,
            EngineError::Failed(_) | EngineError::InvalidName { .. }
        )
    }
}

/// One open database.
///
/// Shared by every connection to the database, so implementations must be
/// safe for concurrent use. Calls block; they run on the blocking pool.
pub trait Engine: Send + Sync {
    fn run_query(&self, query: &str, format: OutputFormat) -> Result<Vec<u8>, EngineError>;

    fn dump_schema(&self) -> Result<Vec<u8>, EngineError>;

    fn dump_table(&self, name: &str) -> Result<Vec<u8>, EngineError>;

    fn dump_view(&self, name: &str) -> Result<Vec<u8>, EngineError>;

    /// Register a user with the base64 form of its encrypted private key.
    fn create_user(&self, access_key: &str, b64_encrypted_key: &str) -> Result<(), EngineError>;

    /// Start a change export. The child's stdout carries the changes and its
    /// stdin stays open for as long as the export should run.
    fn tail(
        &self,
        access_key: &str,
        request: &TailRequest,
        replication_id: &str,
    ) -> Result<Child, EngineError>;

    /// Start a CSV bulk-load sink. Rows go to the child's stdin; its stdout
    /// carries acknowledgements.
    fn write_csv(
        &self,
        access_key: &str,
        table: &str,
        replication_id: &str,
    ) -> Result<Child, EngineError>;

    /// Replication id assigned to a client device.
    fn replication_id(&self, device_uuid: &str) -> Result<String, EngineError>;

    /// The stored private key of `access_key` (base64 of its encrypted form),
    /// if the user exists.
    fn private_key_as_stored(&self, access_key: &str) -> Result<Option<Vec<u8>>, EngineError>;
}

/// Opens and creates databases by name.
pub trait Databases: Send + Sync {
    fn open(&self, name: &str) -> Result<Arc<dyn Engine>, EngineError>;

    /// Create a database whose root user holds `b64_root_key` (encrypted form).
    fn create(&self, name: &str, b64_root_key: &str) -> Result<(), EngineError>;
}

/// Accept names made of ASCII letters, digits, `_` and `-`, not starting with `-`.
pub fn validate_name(kind: &'static str, name: &str) -> Result<(), EngineError> {
    let valid = !name.is_empty()
        && name.len() <= 128
        && !name.starts_with('-')
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(EngineError::InvalidName {
            kind,
            name: name.to_string(),
        })
    }
}
