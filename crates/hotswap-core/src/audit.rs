//! Append-only JSON-lines audit trail.
//!
//! One line per named event:
//!
//! ```text
//! {"timestamp":"2026-01-01T00:00:00Z","level":"info","event":"server_spawned","session":"…","pid":4242,"generation":1}
//! ```
//!
//! Every record is mirrored to `tracing` so the same events show up in the
//! proxy's stderr log. Rotation is left to the operator.

use crate::error::Result;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Shared audit sink.
///
/// Records are written synchronously: each is one small `O_APPEND` write
/// under a mutex held only for that write, so `record` stays callable from
/// sync code and current-thread runtimes. Only the task emitting the record
/// waits for it.
pub struct AuditLog {
    session: String,
    sink: Mutex<Option<Box<dyn Write + Send>>>,
}

impl AuditLog {
    /// Open (or create) the audit file in append mode.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::with_sink(Box::new(file)))
    }

    /// An audit log that only mirrors to `tracing`.
    pub fn disabled() -> Self {
        Self {
            session: uuid::Uuid::new_v4().to_string(),
            sink: Mutex::new(None),
        }
    }

    fn with_sink(sink: Box<dyn Write + Send>) -> Self {
        Self {
            session: uuid::Uuid::new_v4().to_string(),
            sink: Mutex::new(Some(sink)),
        }
    }

    /// Identifier shared by every line this proxy process writes.
    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn info(&self, event: &str, fields: Value) {
        self.record(AuditLevel::Info, event, fields);
    }

    pub fn warn(&self, event: &str, fields: Value) {
        self.record(AuditLevel::Warn, event, fields);
    }

    pub fn error(&self, event: &str, fields: Value) {
        self.record(AuditLevel::Error, event, fields);
    }

    /// Write one event. Failures to write are logged, never propagated:
    /// a full disk must not take the relay down.
    pub fn record(&self, level: AuditLevel, event: &str, fields: Value) {
        match level {
            AuditLevel::Debug => tracing::debug!(event, %fields, "audit"),
            AuditLevel::Info => tracing::info!(event, %fields, "audit"),
            AuditLevel::Warn => tracing::warn!(event, %fields, "audit"),
            AuditLevel::Error => tracing::error!(event, %fields, "audit"),
        }

        let mut line = self.render(level, event, fields);
        line.push('\n');
        let Ok(mut guard) = self.sink.lock() else {
            return;
        };
        if let Some(sink) = guard.as_mut() {
            let written = sink.write_all(line.as_bytes()).and_then(|_| sink.flush());
            if let Err(e) = written {
                tracing::warn!(event, error = %e, "failed to write audit line");
            }
        }
    }

    fn render(&self, level: AuditLevel, event: &str, fields: Value) -> String {
        let mut obj = Map::new();
        obj.insert(
            "timestamp".into(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        obj.insert(
            "level".into(),
            serde_json::to_value(level).unwrap_or(Value::Null),
        );
        obj.insert("event".into(), Value::String(event.to_string()));
        obj.insert("session".into(), Value::String(self.session.clone()));
        match fields {
            Value::Object(extra) => {
                for (k, v) in extra {
                    obj.entry(k).or_insert(v);
                }
            }
            Value::Null => {}
            other => {
                obj.insert("detail".into(), other);
            }
        }
        Value::Object(obj).to_string()
    }
}
