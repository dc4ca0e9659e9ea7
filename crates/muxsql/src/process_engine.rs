//! [`Engine`] backed by an engine executable.
//!
//! Every call runs `<binary> --data <data_dir>/<db>.db ...`. One-shot calls
//! collect stdout; a non-zero exit turns stderr into [`EngineError::Failed`].
//! Tail and CSV sinks are returned as running children.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread;

use tracing::{debug, info};

use crate::engine::{validate_name, Databases, Engine, EngineError, OutputFormat, TailRequest};

/// Table holding users and their stored keys.
pub const USERS_TABLE: &str = "skdb_users";

const DB_EXTENSION: &str = "db";

/// One database file driven through the engine executable.
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    binary: PathBuf,
    db_path: PathBuf,
}

impl ProcessEngine {
    pub fn new(binary: impl Into<PathBuf>, db_path: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            db_path: db_path.into(),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--data").arg(&self.db_path);
        cmd
    }

    /// Run to completion, feeding `input` on stdin.
    fn run(&self, mut cmd: Command, input: &[u8]) -> Result<Vec<u8>, EngineError> {
        debug!(binary = ?self.binary, db = ?self.db_path, "running engine");
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(EngineError::Spawn)?;

        let stdin = child.stdin.take();
        // Feed stdin on its own thread so a chatty engine cannot deadlock us.
        let output = thread::scope(|scope| {
            let writer = scope.spawn(move || -> std::io::Result<()> {
                if let Some(mut stdin) = stdin {
                    stdin.write_all(input)?;
                }
                Ok(())
            });
            let output = child.wait_with_output();
            let written = writer
                .join()
                .unwrap_or_else(|_| Err(std::io::Error::other("stdin writer panicked")));
            output.and_then(|output| written.map(|()| output))
        })?;

        if output.status.success() {
            Ok(output.stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.is_empty() {
                Err(EngineError::Failed(format!("engine exited with {}", output.status)))
            } else {
                Err(EngineError::Failed(stderr))
            }
        }
    }

    fn run_args(&self, args: &[&str]) -> Result<Vec<u8>, EngineError> {
        let mut cmd = self.command();
        cmd.args(args);
        self.run(cmd, &[])
    }

    /// Start a long-running child with piped stdin and stdout.
    fn spawn_streaming(&self, mut cmd: Command) -> Result<Child, EngineError> {
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(EngineError::Spawn)
    }

    fn initialize(&self) -> Result<(), EngineError> {
        self.run_args(&["--init"]).map(|_| ())
    }
}

/// Quote a SQL string literal.
pub fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

impl Engine for ProcessEngine {
    fn run_query(&self, query: &str, format: OutputFormat) -> Result<Vec<u8>, EngineError> {
        let mut cmd = self.command();
        cmd.arg("--format").arg(format.as_str());
        self.run(cmd, query.as_bytes())
    }

    fn dump_schema(&self) -> Result<Vec<u8>, EngineError> {
        self.run_args(&["--dump-tables"])
    }

    fn dump_table(&self, name: &str) -> Result<Vec<u8>, EngineError> {
        validate_name("table", name)?;
        self.run_args(&["--dump-table", name])
    }

    fn dump_view(&self, name: &str) -> Result<Vec<u8>, EngineError> {
        validate_name("view", name)?;
        self.run_args(&["--dump-view", name])
    }

    fn create_user(&self, access_key: &str, b64_encrypted_key: &str) -> Result<(), EngineError> {
        validate_name("user", access_key)?;
        let statement = format!(
            "INSERT INTO {USERS_TABLE} (username, privateKey) VALUES ({}, {});",
            sql_literal(access_key),
            sql_literal(b64_encrypted_key)
        );
        self.run_query(&statement, OutputFormat::Raw).map(|_| ())
    }

    fn tail(
        &self,
        access_key: &str,
        request: &TailRequest,
        replication_id: &str,
    ) -> Result<Child, EngineError> {
        validate_name("user", access_key)?;
        validate_name("table", &request.table)?;
        let mut cmd = self.command();
        cmd.arg("--tail")
            .arg(&request.table)
            .arg("--user")
            .arg(access_key)
            .arg("--since")
            .arg(request.since.to_string())
            .arg("--source")
            .arg(replication_id);
        if let Some(filter) = &request.filter_expr {
            cmd.arg("--filter").arg(filter);
        }
        cmd.arg("--follow");
        self.spawn_streaming(cmd)
    }

    fn write_csv(
        &self,
        access_key: &str,
        table: &str,
        replication_id: &str,
    ) -> Result<Child, EngineError> {
        validate_name("user", access_key)?;
        validate_name("table", table)?;
        let mut cmd = self.command();
        cmd.arg("--write-csv")
            .arg(table)
            .arg("--user")
            .arg(access_key)
            .arg("--source")
            .arg(replication_id);
        self.spawn_streaming(cmd)
    }

    fn replication_id(&self, device_uuid: &str) -> Result<String, EngineError> {
        // Client supplied; must never read as a flag.
        if !device_uuid.is_empty() {
            validate_name("device", device_uuid)?;
        }
        let output = self.run_args(&["--replication-id", device_uuid])?;
        Ok(String::from_utf8_lossy(&output).into_owned())
    }

    fn private_key_as_stored(&self, access_key: &str) -> Result<Option<Vec<u8>>, EngineError> {
        validate_name("user", access_key)?;
        let query = format!(
            "SELECT privateKey FROM {USERS_TABLE} WHERE username = {};",
            sql_literal(access_key)
        );
        let output = self.run_query(&query, OutputFormat::Raw)?;
        let stored = output.trim_ascii();
        if stored.is_empty() {
            Ok(None)
        } else {
            Ok(Some(stored.to_vec()))
        }
    }
}

/// Databases stored as `<data_dir>/<name>.db`.
#[derive(Debug, Clone)]
pub struct ProcessDatabases {
    binary: PathBuf,
    data_dir: PathBuf,
}

impl ProcessDatabases {
    pub fn new(binary: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            data_dir: data_dir.into(),
        }
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.data_dir.join(format!("{name}.{DB_EXTENSION}"))
    }

    fn engine(&self, name: &str) -> Result<ProcessEngine, EngineError> {
        validate_name("database", name)?;
        Ok(ProcessEngine::new(&self.binary, self.path_of(name)))
    }
}

impl Databases for ProcessDatabases {
    fn open(&self, name: &str) -> Result<Arc<dyn Engine>, EngineError> {
        let engine = self.engine(name)?;
        if !engine.db_path().exists() {
            return Err(EngineError::NoSuchDatabase(name.to_string()));
        }
        Ok(Arc::new(engine))
    }

    fn create(&self, name: &str, b64_root_key: &str) -> Result<(), EngineError> {
        let engine = self.engine(name)?;
        if engine.db_path().exists() {
            return Err(EngineError::AlreadyExists(name.to_string()));
        }
        std::fs::create_dir_all(&self.data_dir)?;
        engine.initialize()?;
        engine.create_user(crate::dispatch::ROOT_USER, b64_root_key)?;
        info!(database = name, path = ?engine.db_path(), "database created");
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::io::Read;
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    struct Scratch(PathBuf);

    impl Scratch {
        fn new(tag: &str) -> Self {
            let dir = std::env::temp_dir().join(format!(
                "muxsql-engine-{tag}-{}-{}",
                std::process::id(),
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap()
                    .as_nanos()
            ));
            std::fs::create_dir_all(&dir).unwrap();
            Self(dir)
        }

        /// A fake engine: a shell script with the given body.
        fn script(&self, body: &str) -> PathBuf {
            let path = self.0.join("engine.sh");
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }
    }

    impl Drop for Scratch {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }

    #[test]
    fn query_goes_to_stdin_with_format_flag() {
        let scratch = Scratch::new("query");
        let binary = scratch.script(r#"echo "$@"; cat"#);
        let engine = ProcessEngine::new(binary, "/data/app.db");

        let output = engine.run_query("select 1;", OutputFormat::Csv).unwrap();
        assert_eq!(
            String::from_utf8(output).unwrap(),
            "--data /data/app.db --format csv\nselect 1;"
        );
    }

    #[test]
    fn failure_reports_stderr() {
        let scratch = Scratch::new("fail");
        let binary = scratch.script("echo 'no such table: t' >&2; exit 3");
        let engine = ProcessEngine::new(binary, "/data/app.db");

        match engine.dump_table("t") {
            Err(EngineError::Failed(text)) => assert_eq!(text, "no such table: t"),
            other => panic!("expected engine failure, got {other:?}"),
        }
    }

    #[test]
    fn missing_binary_is_a_spawn_error() {
        let engine = ProcessEngine::new("/nonexistent/muxsql-engine", "/data/app.db");
        assert!(matches!(
            engine.dump_schema(),
            Err(EngineError::Spawn(_))
        ));
    }

    #[test]
    fn unsafe_names_never_reach_the_engine() {
        let engine = ProcessEngine::new("/nonexistent/muxsql-engine", "/data/app.db");
        assert!(matches!(
            engine.dump_view("--init"),
            Err(EngineError::InvalidName { kind: "view", .. })
        ));
        assert!(matches!(
            engine.private_key_as_stored("root' OR '1'='1"),
            Err(EngineError::InvalidName { kind: "user", .. })
        ));
        assert!(matches!(
            engine.replication_id("--init"),
            Err(EngineError::InvalidName { kind: "device", .. })
        ));
    }

    #[test]
    fn replication_id_passes_the_device() {
        let scratch = Scratch::new("replication");
        let binary = scratch.script(r#"echo "$@""#);
        let engine = ProcessEngine::new(binary, "/data/app.db");

        assert_eq!(
            engine.replication_id("2b1c7c1e-4f0a").unwrap().trim_end(),
            "--data /data/app.db --replication-id 2b1c7c1e-4f0a"
        );
        assert_eq!(
            engine.replication_id("").unwrap().trim_end(),
            "--data /data/app.db --replication-id"
        );
    }

    #[test]
    fn create_user_quotes_literals() {
        let scratch = Scratch::new("user");
        let binary = scratch.script("cat");
        let engine = ProcessEngine::new(binary, "/data/app.db");
        engine.create_user("AK1", "a'b").unwrap();
        assert_eq!(sql_literal("a'b"), "'a''b'");
    }

    #[test]
    fn stored_key_lookup() {
        let scratch = Scratch::new("key");
        let binary = scratch.script(
            r#"if grep -q "'root'"; then echo 'c2VjcmV0'; fi"#,
        );
        let engine = ProcessEngine::new(binary, "/data/app.db");
        assert_eq!(
            engine.private_key_as_stored("root").unwrap(),
            Some(b"c2VjcmV0".to_vec())
        );
        assert_eq!(engine.private_key_as_stored("u1").unwrap(), None);
    }

    #[test]
    fn tail_streams_from_a_child() {
        let scratch = Scratch::new("tail");
        let binary = scratch.script(r#"echo "$@""#);
        let engine = ProcessEngine::new(binary, "/data/app.db");
        let request = TailRequest {
            table: "events".to_string(),
            since: 42,
            filter_expr: Some("a > 1".to_string()),
        };

        let mut child = engine.tail("root", &request, "7").unwrap();
        let mut out = String::new();
        child.stdout.take().unwrap().read_to_string(&mut out).unwrap();
        child.wait().unwrap();
        assert_eq!(
            out.trim_end(),
            "--data /data/app.db --tail events --user root --since 42 --source 7 --filter a > 1 --follow"
        );
    }

    #[test]
    fn databases_open_and_create() {
        let scratch = Scratch::new("dbs");
        let binary = scratch.script(r#"case "$*" in *--init*) touch "$2";; esac; cat > /dev/null"#);
        let databases = ProcessDatabases::new(binary, scratch.0.join("data"));

        assert!(matches!(
            databases.open("app"),
            Err(EngineError::NoSuchDatabase(_))
        ));
        databases.create("app", "a2V5").unwrap();
        assert!(databases.path_of("app").exists());
        assert!(databases.open("app").is_ok());
        assert!(matches!(
            databases.create("app", "a2V5"),
            Err(EngineError::AlreadyExists(_))
        ));
        assert!(matches!(
            databases.open("../etc"),
            Err(EngineError::InvalidName { .. })
        ));
    }
}
