//! CLI Integration Tests
//!
//! Runs the real `rinvoke` binary: `serve` on an ephemeral port, then `call`
//! against the locator it prints.

use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};

// ============================================================================
// Test Helpers
// ============================================================================

/// A `rinvoke serve` child process, killed on drop.
struct Server {
    child: Child,
    locator: String,
}

impl Server {
    fn start(locator: &str) -> Self {
        let mut child = Command::new(env!("CARGO_BIN_EXE_rinvoke"))
            .args(["serve", locator])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn rinvoke serve");

        let stdout = child.stdout.take().expect("no stdout");
        let mut line = String::new();
        BufReader::new(stdout)
            .read_line(&mut line)
            .expect("failed to read bound locator");

        Server {
            child,
            locator: line.trim().to_string(),
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn call(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_rinvoke"))
        .arg("call")
        .args(args)
        .output()
        .expect("failed to run rinvoke call")
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_serve_prints_resolved_locator() {
    let server = Server::start("socket://127.0.0.1:0");
    assert!(server.locator.starts_with("socket://127.0.0.1:"));
    assert!(!server.locator.ends_with(":0/"));
}

#[test]
fn test_call_echo_prints_raw_json() {
    let server = Server::start("socket://127.0.0.1:0");
    let output = call(&[&server.locator, "echo", "-p", "{\"hello\":\"world\"}"]);
    assert!(output.status.success());
    assert_eq!(
        String::from_utf8_lossy(&output.stdout).trim(),
        "{\"hello\":\"world\"}"
    );
}

#[test]
fn test_call_over_http() {
    let server = Server::start("http://127.0.0.1:0");
    let output = call(&[&server.locator, "echo", "-p", "foo"]);
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "\"foo\"");
}

#[test]
fn test_call_unknown_subsystem_fails() {
    let server = Server::start("socket://127.0.0.1:0");
    let output = call(&[&server.locator, "missing"]);
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
    assert!(String::from_utf8_lossy(&output.stderr).contains("missing"));
}

#[test]
fn test_call_unreachable_server_fails() {
    let output = call(&["socket://127.0.0.1:1/?timeout=200&numberOfCallRetries=1", "echo"]);
    assert!(!output.status.success());
}
