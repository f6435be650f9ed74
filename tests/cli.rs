use assert_cmd::prelude::*;
use predicates::str::contains;
use std::process::Command;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

// `predstore-client` with no args should exit with a non-zero code.
#[test]
fn client_cli_no_args() {
    let temp_dir = TempDir::new().unwrap();
    let mut cmd = Command::cargo_bin("predstore-client").unwrap();
    cmd.current_dir(&temp_dir).assert().failure();
}

#[test]
fn client_cli_invalid_subcommand() {
    let temp_dir = TempDir::new().unwrap();
    Command::cargo_bin("predstore-client")
        .unwrap()
        .args(&["unknown"])
        .current_dir(&temp_dir)
        .assert()
        .failure();
}

#[test]
fn client_cli_version() {
    let temp_dir = TempDir::new().unwrap();
    Command::cargo_bin("predstore-client")
        .unwrap()
        .args(&["-V"])
        .current_dir(&temp_dir)
        .assert()
        .stdout(contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn server_cli_version() {
    let temp_dir = TempDir::new().unwrap();
    Command::cargo_bin("predstore-server")
        .unwrap()
        .args(&["-V"])
        .current_dir(&temp_dir)
        .assert()
        .stdout(contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn client_cli_invalid_arguments() {
    let temp_dir = TempDir::new().unwrap();
    Command::cargo_bin("predstore-client")
        .unwrap()
        .args(&["get", "teachers"])
        .current_dir(&temp_dir)
        .assert()
        .failure();

    Command::cargo_bin("predstore-client")
        .unwrap()
        .args(&["put", "users", "[1, 2, 3", "--addr", "127.0.0.1:4099"])
        .current_dir(&temp_dir)
        .assert()
        .failure()
        .stderr(contains("invalid JSON"));

    Command::cargo_bin("predstore-client")
        .unwrap()
        .args(&["stats", "--addr", "invalid-addr"])
        .current_dir(&temp_dir)
        .assert()
        .failure();
}

#[test]
fn cli_access_server() {
    let temp_dir = TempDir::new().unwrap();
    let addr = "127.0.0.1:4104";
    let mut server = Command::cargo_bin("predstore-server")
        .unwrap()
        .args(&["--addr", addr, "--log-level", "warn"])
        .arg("--data-dir")
        .arg(temp_dir.path())
        .spawn()
        .unwrap();
    thread::sleep(Duration::from_secs(1));

    Command::cargo_bin("predstore-client")
        .unwrap()
        .args(&["put", "users", r#"{"alice": {"email": "a@x.com"}}"#, "--addr", addr])
        .current_dir(&temp_dir)
        .assert()
        .success()
        .stdout(contains("users updated"));

    Command::cargo_bin("predstore-client")
        .unwrap()
        .args(&["get", "users", "--addr", addr])
        .current_dir(&temp_dir)
        .assert()
        .success()
        .stdout(contains("a@x.com"));

    // a payload that isn't an object is refused without touching the collection
    Command::cargo_bin("predstore-client")
        .unwrap()
        .args(&["put", "users", "[1, 2]", "--addr", addr])
        .current_dir(&temp_dir)
        .assert()
        .failure()
        .stderr(contains("JSON object"));

    Command::cargo_bin("predstore-client")
        .unwrap()
        .args(&["stats", "--addr", addr])
        .current_dir(&temp_dir)
        .assert()
        .success()
        .stdout(contains("\"total_users\": 1"));

    Command::cargo_bin("predstore-client")
        .unwrap()
        .args(&["health", "--addr", addr])
        .current_dir(&temp_dir)
        .assert()
        .success()
        .stdout(contains("files_present"));

    server.kill().expect("server exited before killed");

    assert!(temp_dir.path().join("users.json").exists());
}
