#![cfg(all(unix, feature = "cli"))]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use base64::Engine as _;

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "muxsql-cli-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

/// A stand-in engine: `--init` creates the database file, everything else
/// swallows its stdin and succeeds.
fn fake_engine(dir: &Path) -> PathBuf {
    let path = dir.join("engine.sh");
    std::fs::write(
        &path,
        "#!/bin/sh\ncase \"$*\" in *--init*) touch \"$2\";; esac\ncat > /dev/null\n",
    )
    .expect("engine script should be writable");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("engine script should be executable");
    path
}

fn muxsql(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_muxsql"))
        .env_remove("MUXSQL_LISTEN")
        .env_remove("MUXSQL_SOCKET")
        .env_remove("MUXSQL_DATA_DIR")
        .env_remove("MUXSQL_ENGINE")
        .env_remove("MUXSQL_MASTER_KEY")
        .arg("--log-level")
        .arg("error")
        .args(args)
        .output()
        .expect("muxsql should run")
}

#[test]
fn create_db_prints_root_credentials_once() {
    let dir = unique_temp_dir("create-db");
    let engine = fake_engine(&dir);
    let data_dir = dir.join("data");
    let master_key = base64::engine::general_purpose::STANDARD.encode([3u8; 16]);

    let output = muxsql(&[
        "create-db",
        "app",
        "--format",
        "json",
        "--data-dir",
        data_dir.to_str().unwrap(),
        "--engine",
        engine.to_str().unwrap(),
        "--master-key",
        &master_key,
    ]);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let value: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout should be json");
    assert_eq!(value["database"], "app");
    assert_eq!(value["access_key"], "root");
    assert_eq!(value["key_cipher"], "aes-128-ocb3");
    let private_key = base64::engine::general_purpose::STANDARD
        .decode(value["private_key"].as_str().unwrap())
        .unwrap();
    assert_eq!(private_key.len(), 32);
    assert!(data_dir.join("app.db").exists());

    let again = muxsql(&[
        "create-db",
        "app",
        "--data-dir",
        data_dir.to_str().unwrap(),
        "--engine",
        engine.to_str().unwrap(),
    ]);
    assert_eq!(again.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&again.stderr).contains("already exists"));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn create_db_rejects_unsafe_names() {
    let dir = unique_temp_dir("bad-name");
    let engine = fake_engine(&dir);
    let output = muxsql(&[
        "create-db",
        "../escape",
        "--data-dir",
        dir.to_str().unwrap(),
        "--engine",
        engine.to_str().unwrap(),
    ]);
    assert_eq!(output.status.code(), Some(64));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn serve_rejects_invalid_master_key() {
    let output = muxsql(&["serve", "--listen", "127.0.0.1:0", "--master-key", "tooshort"]);
    assert_eq!(output.status.code(), Some(64));
    assert!(String::from_utf8_lossy(&output.stderr).contains("invalid master key"));
}

#[test]
fn serve_reports_bind_failure() {
    let dir = unique_temp_dir("bind");
    let not_a_socket = dir.join("plain-file");
    std::fs::write(&not_a_socket, b"keep").unwrap();

    let output = muxsql(&["serve", "--socket", not_a_socket.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(3));
    assert!(not_a_socket.exists());
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn version_extended_lists_build_details() {
    let output = muxsql(&["version", "--extended"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with(&format!("muxsql {}", env!("CARGO_PKG_VERSION"))));
    assert!(stdout.contains("key_ciphers:"));
}
