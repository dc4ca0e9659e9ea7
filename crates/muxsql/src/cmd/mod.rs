use clap::{Args, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use muxsql::config::{ServerConfig, DEFAULT_ENGINE};
use muxsql::AccessPolicy;

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod create_db;
pub mod serve;
pub mod version;

/// Listen address used when neither `--listen` nor `--socket` is given.
pub const DEFAULT_LISTEN: &str = "127.0.0.1:3586";

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve client connections.
    Serve(ServeArgs),
    /// Create a database and print its root credentials.
    CreateDb(CreateDbArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args),
        Command::CreateDb(args) => create_db::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

/// Where databases live and how keys are stored.
#[derive(Args, Debug)]
pub struct StorageArgs {
    /// Directory holding `<db>.db` files.
    #[arg(long, env = "MUXSQL_DATA_DIR", default_value = ".")]
    pub data_dir: PathBuf,
    /// Engine executable.
    #[arg(long, env = "MUXSQL_ENGINE", default_value = DEFAULT_ENGINE)]
    pub engine: PathBuf,
    /// Base64 AES-128 key encrypting private keys at rest.
    #[arg(long, env = "MUXSQL_MASTER_KEY", hide_env_values = true)]
    pub master_key: Option<String>,
}

impl StorageArgs {
    pub fn server_config(&self, policy: AccessPolicy) -> ServerConfig {
        ServerConfig {
            data_dir: self.data_dir.clone(),
            engine_binary: self.engine.clone(),
            master_key: self.master_key.clone(),
            policy,
        }
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// TCP address to listen on (default 127.0.0.1:3586).
    #[arg(long, env = "MUXSQL_LISTEN", conflicts_with = "socket")]
    pub listen: Option<String>,
    /// Unix socket path to listen on.
    #[arg(long, env = "MUXSQL_SOCKET")]
    pub socket: Option<PathBuf>,
    #[command(flatten)]
    pub storage: StorageArgs,
    /// Allow schema queries for the root key only.
    #[arg(long)]
    pub schema_requires_root: bool,
    /// Time allowed for the AUTH frame (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub handshake_timeout: String,
    /// Accepted difference between client and server clocks.
    #[arg(long, default_value = "300s")]
    pub max_clock_skew: String,
    /// PING interval.
    #[arg(long, default_value = "30s")]
    pub keepalive: String,
    /// Close connections idle for this long.
    #[arg(long, default_value = "120s")]
    pub idle_timeout: String,
}

#[derive(Args, Debug)]
pub struct CreateDbArgs {
    /// Database name.
    pub name: String,
    #[command(flatten)]
    pub storage: StorageArgs,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Parse `5s`, `500ms` or bare seconds.
pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}
