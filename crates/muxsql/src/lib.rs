//! Multiplexed, authenticated front door for a reactive SQL database.
//!
//! muxsql accepts client connections, authenticates them, and serves many
//! independent request streams over each one: queries, schema dumps and user
//! provisioning are answered directly, while change tails and CSV pushes are
//! bridged to engine subprocesses.
//!
//! # Crate Structure
//!
//! - [`frame`]: wire framing and protocol messages
//! - [`mux`]: streams, connections and the listener
//! - [`dispatch`]: the per-stream request handler
//! - [`bridge`]: stream to subprocess pipes
//! - [`credentials`] and [`cipher`]: key generation and keys at rest
//! - [`engine`] and [`process_engine`]: the database engine seam
//! - [`service`]: ties authentication and dispatch together

pub mod bridge;
pub mod cipher;
pub mod config;
pub mod credentials;
pub mod dispatch;
pub mod engine;
pub mod process_engine;
pub mod service;

/// Re-export frame types.
pub mod frame {
    pub use muxsql_frame::*;
}

/// Re-export connection types.
pub mod mux {
    pub use muxsql_mux::*;
}

pub use bridge::ProcessPipe;
pub use cipher::{KeyCipher, Ocb3Cipher, PlaintextCipher};
pub use config::ServerConfig;
pub use credentials::{transmit_once, CredentialError, CredentialManager, Credentials};
pub use dispatch::{AccessPolicy, RequestHandler, ROOT_USER};
pub use engine::{Databases, Engine, EngineError, OutputFormat, TailRequest};
pub use process_engine::{ProcessDatabases, ProcessEngine};
pub use service::{DbService, Session};
