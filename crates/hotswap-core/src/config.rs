use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Line a worker writes to its own stderr to ask for a hot restart.
pub const DEFAULT_SENTINEL: &str = "__HOTSWAP_RESTART__";

// ---------------------------------------------------------------------------
// WorkerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Executable launched for every worker generation.
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment on top of the inherited one. The defaults force
    /// UTF-8 mode in Python-based workers regardless of host locale; entries
    /// from a config file are merged over them, not instead of them.
    #[serde(
        default = "default_worker_env",
        deserialize_with = "merge_worker_env"
    )]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

fn default_worker_env() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("PYTHONUTF8".to_string(), "1".to_string()),
        ("PYTHONIOENCODING".to_string(), "utf-8".to_string()),
    ])
}

fn merge_worker_env<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let overrides = BTreeMap::<String, String>::deserialize(deserializer)?;
    let mut env = default_worker_env();
    env.extend(overrides);
    Ok(env)
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            env: default_worker_env(),
            cwd: None,
        }
    }
}

// ---------------------------------------------------------------------------
// RestartConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartConfig {
    #[serde(default = "default_sentinel")]
    pub sentinel: String,
    /// Exact stderr line a worker prints once it accepts input. When unset
    /// the replay falls back to a fixed delay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_marker: Option<String>,
    #[serde(default = "default_replay_delay_ms")]
    pub replay_delay_ms: u64,
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
    #[serde(default = "default_replay_timeout_ms")]
    pub replay_timeout_ms: u64,
    #[serde(default = "default_terminate_grace_ms")]
    pub terminate_grace_ms: u64,
    /// Consecutive crash restarts tolerated before the proxy gives up.
    /// Zero disables crash restarts entirely.
    #[serde(default = "default_max_crash_restarts")]
    pub max_crash_restarts: u32,
    /// Replay the client's `notifications/initialized` after `initialize`.
    #[serde(default = "default_replay_initialized")]
    pub replay_initialized: bool,
}

fn default_sentinel() -> String {
    DEFAULT_SENTINEL.to_string()
}

fn default_replay_delay_ms() -> u64 {
    300
}

fn default_ready_timeout_ms() -> u64 {
    10_000
}

fn default_replay_timeout_ms() -> u64 {
    10_000
}

fn default_terminate_grace_ms() -> u64 {
    3_000
}

fn default_max_crash_restarts() -> u32 {
    5
}

fn default_replay_initialized() -> bool {
    true
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            sentinel: default_sentinel(),
            ready_marker: None,
            replay_delay_ms: default_replay_delay_ms(),
            ready_timeout_ms: default_ready_timeout_ms(),
            replay_timeout_ms: default_replay_timeout_ms(),
            terminate_grace_ms: default_terminate_grace_ms(),
            max_crash_restarts: default_max_crash_restarts(),
            replay_initialized: default_replay_initialized(),
        }
    }
}

impl RestartConfig {
    pub fn replay_delay(&self) -> Duration {
        Duration::from_millis(self.replay_delay_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn replay_timeout(&self) -> Duration {
        Duration::from_millis(self.replay_timeout_ms)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

// ---------------------------------------------------------------------------
// ProxyConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub restart: RestartConfig,
    /// Append-only JSON-lines audit file. Defaults to a file in the
    /// system temp directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_log: Option<PathBuf>,
}

impl ProxyConfig {
    /// Load a YAML config file. Missing sections fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: ProxyConfig = serde_yaml::from_str(&data)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker.command.trim().is_empty() {
            return Err(ProxyError::Config("worker command is empty".into()));
        }
        let sentinel = &self.restart.sentinel;
        if sentinel.trim().is_empty() {
            return Err(ProxyError::Config("restart sentinel is empty".into()));
        }
        if sentinel.contains('\n') {
            return Err(ProxyError::Config(
                "restart sentinel must be a single line".into(),
            ));
        }
        if self.restart.ready_marker.as_deref() == Some(sentinel.as_str()) {
            return Err(ProxyError::Config(
                "ready marker and restart sentinel must differ".into(),
            ));
        }
        Ok(())
    }

    /// Locate the worker executable on `PATH` (or as given, if it is a path).
    pub fn resolve_command(&self) -> Result<PathBuf> {
        which::which(&self.worker.command).map_err(|e| {
            ProxyError::Config(format!(
                "worker command '{}' not found: {e}",
                self.worker.command
            ))
        })
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.audit_log
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("hotswap-audit.jsonl"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn with_command(cmd: &str) -> ProxyConfig {
        let mut config = ProxyConfig::default();
        config.worker.command = cmd.to_string();
        config
    }

    #[test]
    fn defaults_force_utf8_in_worker() {
        let config = ProxyConfig::default();
        assert_eq!(config.worker.env.get("PYTHONUTF8").map(String::as_str), Some("1"));
        assert_eq!(config.restart.sentinel, DEFAULT_SENTINEL);
        assert_eq!(config.restart.replay_delay(), Duration::from_millis(300));
        assert_eq!(config.restart.max_crash_restarts, 5);
        assert!(config.restart.replay_initialized);
    }

    #[test]
    fn load_partial_yaml_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hotswap.yaml");
        std::fs::write(
            &path,
            "worker:\n  command: python\n  args: [\"-m\", \"mcp_server\"]\nrestart:\n  ready_marker: READY\n",
        )
        .unwrap();

        let config = ProxyConfig::load(&path).unwrap();
        assert_eq!(config.worker.command, "python");
        assert_eq!(config.worker.args, vec!["-m", "mcp_server"]);
        assert_eq!(config.restart.ready_marker.as_deref(), Some("READY"));
        assert_eq!(config.restart.sentinel, DEFAULT_SENTINEL);
        assert_eq!(config.worker.env.len(), 2);
        config.validate().unwrap();
    }

    #[test]
    fn load_env_merges_over_utf8_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hotswap.yaml");
        std::fs::write(
            &path,
            "worker:\n  command: python\n  env:\n    FOO: bar\n    PYTHONIOENCODING: latin-1\n",
        )
        .unwrap();

        let env = ProxyConfig::load(&path).unwrap().worker.env;
        assert_eq!(env.get("FOO").map(String::as_str), Some("bar"));
        assert_eq!(env.get("PYTHONUTF8").map(String::as_str), Some("1"));
        assert_eq!(env.get("PYTHONIOENCODING").map(String::as_str), Some("latin-1"));
        assert_eq!(env.len(), 3);
    }

    #[test]
    fn load_missing_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let err = ProxyConfig::load(&dir.path().join("nope.yaml")).unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));
    }

    #[test]
    fn validate_rejects_empty_command() {
        let err = ProxyConfig::default().validate().unwrap_err();
        assert!(err.to_string().contains("worker command is empty"));
    }

    #[test]
    fn validate_rejects_marker_equal_to_sentinel() {
        let mut config = with_command("cat");
        config.restart.ready_marker = Some(DEFAULT_SENTINEL.to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_blank_sentinel() {
        let mut config = with_command("cat");
        config.restart.sentinel = "   ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn resolve_command_finds_sh() {
        let config = with_command("sh");
        assert!(config.resolve_command().is_ok());
        let missing = with_command("definitely-not-a-real-binary-xyz");
        assert!(missing.resolve_command().is_err());
    }

    #[test]
    fn audit_log_path_prefers_explicit() {
        let mut config = with_command("cat");
        config.audit_log = Some(PathBuf::from("/tmp/explicit.jsonl"));
        assert_eq!(config.audit_log_path(), PathBuf::from("/tmp/explicit.jsonl"));
    }
}
