//! Mock MCP stdio worker for exercising the hotswap proxy end to end.
//!
//! Speaks newline-delimited JSON-RPC on stdin/stdout and refuses every
//! request that arrives before `initialize`, which makes a missing
//! handshake replay visible to the client.
//!
//! # Methods
//!
//! - `initialize`: answers with server info and this process's pid
//! - `restart`: answers, then writes the restart sentinel to stderr
//! - `crash`: exits with status 3 without answering
//! - `echo`: answers with the request params
//! - anything else: answers with `{ "pid", "method" }`
//!
//! # Environment Variables
//!
//! - `MOCK_WORKER_SENTINEL`: sentinel line (default: `__HOTSWAP_RESTART__`)
//! - `MOCK_WORKER_READY_MARKER`: stderr line printed once stdin is read

use serde_json::{json, Value};
use std::io::{BufRead, Write};

const DEFAULT_SENTINEL: &str = "__HOTSWAP_RESTART__";

fn main() {
    let sentinel =
        std::env::var("MOCK_WORKER_SENTINEL").unwrap_or_else(|_| DEFAULT_SENTINEL.to_string());
    if let Ok(marker) = std::env::var("MOCK_WORKER_READY_MARKER") {
        eprintln!("{marker}");
    }

    let pid = std::process::id();
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    let mut initialized = false;

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let Ok(msg) = serde_json::from_str::<Value>(&line) else {
            eprintln!("mock worker: unparseable line");
            continue;
        };
        let method = msg.get("method").and_then(Value::as_str).unwrap_or("");
        let Some(id) = msg.get("id").cloned() else {
            // Notification: no response.
            continue;
        };

        let response = match method {
            "initialize" => {
                initialized = true;
                json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {
                        "protocolVersion": "2024-11-05",
                        "capabilities": { "tools": {} },
                        "serverInfo": { "name": "hotswap-mock-worker", "pid": pid },
                    },
                })
            }
            "crash" => std::process::exit(3),
            _ if !initialized => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32002, "message": "server not initialized" },
            }),
            "echo" => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": msg.get("params").cloned().unwrap_or(Value::Null),
            }),
            _ => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": { "pid": pid, "method": method },
            }),
        };

        if writeln!(stdout, "{response}").and_then(|_| stdout.flush()).is_err() {
            break;
        }
        if method == "restart" {
            eprintln!("{sentinel}");
        }
    }
}
