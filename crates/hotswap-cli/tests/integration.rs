#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const MOCK_WORKER: &str = env!("CARGO_BIN_EXE_hotswap-mock-worker");
const TIMEOUT: Duration = Duration::from_secs(15);

fn hotswap(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("hotswap").unwrap();
    cmd.current_dir(dir.path())
        .env_remove("HOTSWAP_CONFIG")
        .env("HOTSWAP_AUDIT_LOG", dir.path().join("audit.jsonl"));
    cmd
}

fn audit_events(path: &Path) -> Vec<Value> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

fn event_names(path: &Path) -> Vec<String> {
    audit_events(path)
        .iter()
        .map(|e| e["event"].as_str().unwrap().to_string())
        .collect()
}

// ---------------------------------------------------------------------------
// hotswap config
// ---------------------------------------------------------------------------

#[test]
fn config_show_prints_defaults_as_yaml() {
    let dir = TempDir::new().unwrap();
    hotswap(&dir)
        .args(["config", "show", "--", "python", "server.py"])
        .assert()
        .success()
        .stdout(predicate::str::contains("command: python"))
        .stdout(predicate::str::contains("__HOTSWAP_RESTART__"))
        .stdout(predicate::str::contains("PYTHONUTF8"));
}

#[test]
fn config_show_json_merges_file_and_flags() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("hotswap.yaml");
    std::fs::write(
        &path,
        "worker:\n  command: node\n  args: [server.js]\nrestart:\n  sentinel: PLEASE_RESTART\n",
    )
    .unwrap();

    let output = hotswap(&dir)
        .args(["--config", path.to_str().unwrap(), "config", "show", "-j"])
        .args(["--max-crash-restarts", "9"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let config: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(config["worker"]["command"], "node");
    assert_eq!(config["worker"]["args"], json!(["server.js"]));
    assert_eq!(config["restart"]["sentinel"], "PLEASE_RESTART");
    assert_eq!(config["restart"]["max_crash_restarts"], 9);
}

#[test]
fn config_check_resolves_the_worker() {
    let dir = TempDir::new().unwrap();
    hotswap(&dir)
        .args(["config", "check", "--", MOCK_WORKER])
        .assert()
        .success()
        .stdout(predicate::str::contains("hotswap-mock-worker"));
}

#[test]
fn config_check_reports_missing_worker() {
    let dir = TempDir::new().unwrap();
    hotswap(&dir)
        .args(["config", "check", "-j", "--", "definitely-not-a-real-worker-binary"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("\"ok\": false"))
        .stderr(predicate::str::contains("problem"));
}

#[test]
fn config_check_rejects_matching_marker_and_sentinel() {
    let dir = TempDir::new().unwrap();
    hotswap(&dir)
        .args(["config", "check", "--ready-marker", "__HOTSWAP_RESTART__", "--", MOCK_WORKER])
        .assert()
        .failure()
        .stdout(predicate::str::contains("must differ"));
}

// ---------------------------------------------------------------------------
// hotswap run (one-shot stdin)
// ---------------------------------------------------------------------------

#[test]
fn run_without_worker_command_fails() {
    let dir = TempDir::new().unwrap();
    hotswap(&dir)
        .arg("run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("worker command is empty"));
}

#[test]
fn run_with_missing_worker_fails_and_audits() {
    let dir = TempDir::new().unwrap();
    hotswap(&dir)
        .args(["run", "--", "/no/such/worker"])
        .write_stdin("")
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to spawn worker"));

    let events = event_names(&dir.path().join("audit.jsonl"));
    assert_eq!(events, vec!["proxy_started", "proxy_stopped"]);
}

#[test]
fn run_relays_and_blocks_lone_surrogates() {
    let dir = TempDir::new().unwrap();
    let mut input = Vec::new();
    input.extend_from_slice(br#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#);
    input.push(b'\n');
    input.extend_from_slice(br#"{"jsonrpc":"2.0","id":7,"method":"echo","params":{"t":"\udc80"}}"#);
    input.push(b'\n');
    input.extend_from_slice(b"not json at all\n");

    let output = hotswap(&dir)
        .args(["run", "--", MOCK_WORKER])
        .write_stdin(input)
        .timeout(TIMEOUT)
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let responses: Vec<Value> = String::from_utf8(output.stdout)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(responses.len(), 2, "{responses:?}");
    let blocked = responses.iter().find(|r| r["id"] == 7).unwrap();
    assert_eq!(blocked["error"]["code"], -32602);
    let init = responses.iter().find(|r| r["id"] == 1).unwrap();
    assert_eq!(init["result"]["serverInfo"]["name"], "hotswap-mock-worker");

    let events = event_names(&dir.path().join("audit.jsonl"));
    for e in ["initialize_captured", "validation_blocked", "parse_dropped", "proxy_stopped"] {
        assert!(events.iter().any(|x| x == e), "missing {e}: {events:?}");
    }
}

// ---------------------------------------------------------------------------
// hotswap run (interactive session)
// ---------------------------------------------------------------------------

/// A running `hotswap run` with line-level access to its stdio.
struct Session {
    child: Child,
    stdin: Option<ChildStdin>,
    lines: mpsc::Receiver<String>,
    audit: PathBuf,
    _dir: TempDir,
}

impl Session {
    fn start(extra: &[&str]) -> Self {
        Self::start_with_env(extra, &[])
    }

    fn start_with_env(extra: &[&str], env: &[(&str, &str)]) -> Self {
        let dir = TempDir::new().unwrap();
        let audit = dir.path().join("audit.jsonl");
        let mut child = std::process::Command::new(env!("CARGO_BIN_EXE_hotswap"))
            .arg("run")
            .args(["--replay-delay-ms", "50"])
            .args(extra)
            .args(["--", MOCK_WORKER])
            .env_remove("HOTSWAP_CONFIG")
            .env("HOTSWAP_AUDIT_LOG", &audit)
            .envs(env.iter().copied())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();

        let stdout = child.stdout.take().unwrap();
        let (tx, lines) = mpsc::channel();
        std::thread::spawn(move || {
            for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });

        let stdin = child.stdin.take();
        Session {
            child,
            stdin,
            lines,
            audit,
            _dir: dir,
        }
    }

    fn send(&mut self, msg: Value) {
        let stdin = self.stdin.as_mut().unwrap();
        writeln!(stdin, "{msg}").unwrap();
        stdin.flush().unwrap();
    }

    fn recv(&self) -> Value {
        let line = self.lines.recv_timeout(TIMEOUT).expect("no response from proxy");
        serde_json::from_str(&line).unwrap()
    }

    fn request(&mut self, id: u64, method: &str) -> Value {
        self.send(json!({"jsonrpc": "2.0", "id": id, "method": method}));
        self.recv()
    }

    fn wait_for(&self, event: &str, count: usize) {
        let deadline = Instant::now() + TIMEOUT;
        loop {
            let seen = event_names(&self.audit).iter().filter(|e| *e == event).count();
            if seen >= count {
                return;
            }
            assert!(Instant::now() < deadline, "timed out waiting for {event}");
            std::thread::sleep(Duration::from_millis(25));
        }
    }

    fn close(mut self) -> Vec<Value> {
        self.stdin.take();
        let deadline = Instant::now() + TIMEOUT;
        loop {
            if let Some(status) = self.child.try_wait().unwrap() {
                assert!(status.success(), "proxy exited with {status}");
                break;
            }
            assert!(Instant::now() < deadline, "proxy did not exit");
            std::thread::sleep(Duration::from_millis(25));
        }
        audit_events(&self.audit)
    }

    fn initialize(&mut self) -> Value {
        self.send(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {"protocolVersion": "2024-11-05", "capabilities": {}},
        }));
        let resp = self.recv();
        self.send(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}));
        resp
    }
}

#[test]
fn sentinel_restart_is_invisible_to_the_client() {
    let mut s = Session::start(&[]);
    let init = s.initialize();
    let first_pid = init["result"]["serverInfo"]["pid"].clone();

    let before = s.request(2, "tools/list");
    assert_eq!(before["result"]["pid"], first_pid);

    let resp = s.request(3, "restart");
    assert_eq!(resp["id"], 3);
    s.wait_for("restart_completed", 1);

    // The replacement was initialized by the replay: no -32002 error, and
    // the replayed initialize response never reached us.
    let after = s.request(4, "tools/list");
    assert_eq!(after["id"], 4);
    assert!(after.get("error").is_none(), "{after}");
    assert_ne!(after["result"]["pid"], first_pid);

    let events = s.close();
    let completed = events
        .iter()
        .find(|e| e["event"] == "restart_completed")
        .unwrap();
    assert_eq!(completed["reason"], "requested");
    assert_eq!(completed["old_pid"], first_pid);
    assert!(completed["duration_ms"].is_u64());

    let session = events[0]["session"].clone();
    assert!(events.iter().all(|e| e["session"] == session));
}

#[test]
fn crash_is_treated_as_restart() {
    let mut s = Session::start(&[]);
    s.initialize();

    s.send(json!({"jsonrpc": "2.0", "id": 2, "method": "crash"}));
    s.wait_for("restart_completed", 1);

    let after = s.request(3, "ping");
    assert_eq!(after["id"], 3);
    assert!(after.get("error").is_none(), "{after}");

    let events = s.close();
    let names: Vec<&str> = events.iter().filter_map(|e| e["event"].as_str()).collect();
    assert!(names.contains(&"server_crashed"));
    assert!(names.contains(&"initialize_replayed"));
}

#[test]
fn crash_restarts_can_be_disabled() {
    let mut s = Session::start(&["--max-crash-restarts", "0"]);
    s.initialize();
    s.send(json!({"jsonrpc": "2.0", "id": 2, "method": "crash"}));

    let deadline = Instant::now() + TIMEOUT;
    let status = loop {
        if let Some(status) = s.child.try_wait().unwrap() {
            break status;
        }
        assert!(Instant::now() < deadline, "proxy kept running");
        std::thread::sleep(Duration::from_millis(25));
    };
    assert!(!status.success());

    let names = event_names(&s.audit);
    assert!(names.contains(&"restart_failed".to_string()));
    assert_eq!(names.last().map(String::as_str), Some("proxy_stopped"));
}

#[test]
fn ready_marker_gates_the_replay() {
    let mut s = Session::start_with_env(
        &["--ready-marker", "MOCK_READY"],
        &[("MOCK_WORKER_READY_MARKER", "MOCK_READY")],
    );
    s.initialize();
    s.request(2, "restart");
    s.wait_for("restart_completed", 1);
    assert!(s.request(3, "ping").get("error").is_none());

    let events = s.close();
    let ready = events
        .iter()
        .filter(|e| e["event"] == "server_ready")
        .last()
        .unwrap();
    assert_eq!(ready["via"], "marker");
}
