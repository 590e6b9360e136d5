use std::net::{TcpListener, TcpStream};
use std::process::{Child, Command};
use std::thread;
use std::time::{Duration, Instant};

use assert_cmd::prelude::*;
use predicates::str::{contains, is_empty};
use tempfile::TempDir;

// `depot-client` with no args should exit with a non-zero code.
#[test]
fn client_cli_no_args() {
    Command::cargo_bin("depot-client").unwrap().assert().failure();
}

#[test]
fn client_cli_version() {
    Command::cargo_bin("depot-client")
        .unwrap()
        .args(&["-V"])
        .assert()
        .stdout(contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn server_cli_version() {
    Command::cargo_bin("depot-server")
        .unwrap()
        .args(&["-V"])
        .assert()
        .stdout(contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn client_cli_invalid_subcommand() {
    Command::cargo_bin("depot-client")
        .unwrap()
        .args(&["unknown", "subcommand"])
        .assert()
        .failure();
}

#[test]
fn client_cli_missing_arguments() {
    for args in [&["permit", "ping"][..], &["revoke", "CN=bob"], &["report", "host1", "ctx"]] {
        Command::cargo_bin("depot-client")
            .unwrap()
            .args(args)
            .assert()
            .failure();
    }
}

#[test]
fn client_cli_unreachable_server() {
    Command::cargo_bin("depot-client")
        .unwrap()
        .args(&["ping", "--addr", "127.0.0.1:1"])
        .assert()
        .failure()
        .stdout(is_empty());
}

#[test]
fn server_cli_invalid_settings() {
    let temp_dir = TempDir::new().expect("unable to create temporary working directory");
    let var_dir = temp_dir.path().to_str().unwrap();
    for args in [
        &["--threads", "0"][..],
        &["--workers", "none"],
        &["--addr", "not-an-address"],
        &["--pool", "huge"],
        &["--sync"],
        &["--sync", "--dump", "--peers", "a:1"],
    ] {
        Command::cargo_bin("depot-server")
            .unwrap()
            .args(&["--var-dir", var_dir])
            .args(args)
            .assert()
            .failure();
    }
}

struct Server(Child);

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn free_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}

fn start_server(temp_dir: &TempDir, addr: &str) -> Server {
    let child = Command::cargo_bin("depot-server")
        .unwrap()
        .args(&["--addr", addr, "--var-dir"])
        .arg(temp_dir.path())
        .spawn()
        .unwrap();
    let server = Server(child);
    let deadline = Instant::now() + Duration::from_secs(10);
    while TcpStream::connect(addr).is_err() {
        assert!(Instant::now() < deadline, "server never started listening");
        thread::sleep(Duration::from_millis(50));
    }
    server
}

#[test]
fn client_talks_to_server() {
    let temp_dir = TempDir::new().expect("unable to create temporary working directory");
    let addr = free_addr();
    let _server = start_server(&temp_dir, &addr);

    Command::cargo_bin("depot-client")
        .unwrap()
        .args(&["ping", "hello depot", "--addr", &addr])
        .assert()
        .success()
        .stdout("hello depot\n");

    Command::cargo_bin("depot-client")
        .unwrap()
        .args(&["--addr", &addr, "start"])
        .assert()
        .success()
        .stdout("1\n");

    Command::cargo_bin("depot-client")
        .unwrap()
        .args(&["permit", "ping", "CN=bob", "--addr", &addr])
        .assert()
        .success()
        .stdout(is_empty());
    assert!(temp_dir.path().join("depot.permissions").exists());

    let stdout_file = temp_dir.path().join("report.xml");
    std::fs::write(&stdout_file, "<report/>").unwrap();
    Command::cargo_bin("depot-client")
        .unwrap()
        .args(&["report", "host1", "uptime", "--sysusage", "cpu_secs=1", "--addr", &addr])
        .arg(&stdout_file)
        .assert()
        .success()
        .stdout("uptime\n");

    Command::cargo_bin("depot-client")
        .unwrap()
        .args(&["logconfig", "verbose", "--addr", &addr])
        .assert()
        .failure()
        .stderr(contains("Malformed LOGCONFIG data"));

    let dump = temp_dir.path().join("dump.b64");
    Command::cargo_bin("depot-client")
        .unwrap()
        .args(&["dump", "--addr", &addr])
        .arg(&dump)
        .assert()
        .success()
        .stdout(contains("saved"));
    assert!(dump.exists());
}
