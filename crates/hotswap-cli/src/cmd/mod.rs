pub mod config;
pub mod run;

use anyhow::Context;
use clap::Args;
use hotswap_core::ProxyConfig;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Shared flags
// ---------------------------------------------------------------------------

/// Flags that override values from the config file.
#[derive(Args, Debug, Default)]
pub struct ProxyArgs {
    /// JSON-lines audit file (default: <tmp>/hotswap-audit.jsonl)
    #[arg(long, env = "HOTSWAP_AUDIT_LOG")]
    pub audit_log: Option<PathBuf>,

    /// Exact stderr line that asks for a hot restart
    #[arg(long)]
    pub sentinel: Option<String>,

    /// Stderr line a fresh worker prints once it accepts input
    #[arg(long)]
    pub ready_marker: Option<String>,

    /// Consecutive silent crashes tolerated before giving up (0 = never restart on crash)
    #[arg(long)]
    pub max_crash_restarts: Option<u32>,

    /// Delay before replaying the handshake when no ready marker is set
    #[arg(long, value_name = "MS")]
    pub replay_delay_ms: Option<u64>,

    /// Do not replay `notifications/initialized` after `initialize`
    #[arg(long)]
    pub no_replay_initialized: bool,

    /// Worker command and arguments
    #[arg(last = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

/// Config file (if any) with command-line overrides applied on top.
pub fn effective_config(path: Option<&Path>, args: &ProxyArgs) -> anyhow::Result<ProxyConfig> {
    let mut config = match path {
        Some(p) => {
            ProxyConfig::load(p).with_context(|| format!("loading config {}", p.display()))?
        }
        None => ProxyConfig::default(),
    };

    if let Some((command, rest)) = args.command.split_first() {
        config.worker.command = command.clone();
        config.worker.args = rest.to_vec();
    }
    if let Some(path) = &args.audit_log {
        config.audit_log = Some(path.clone());
    }
    if let Some(sentinel) = &args.sentinel {
        config.restart.sentinel = sentinel.clone();
    }
    if let Some(marker) = &args.ready_marker {
        config.restart.ready_marker = Some(marker.clone());
    }
    if let Some(max) = args.max_crash_restarts {
        config.restart.max_crash_restarts = max;
    }
    if let Some(ms) = args.replay_delay_ms {
        config.restart.replay_delay_ms = ms;
    }
    if args.no_replay_initialized {
        config.restart.replay_initialized = false;
    }

    Ok(config)
}
