use super::{effective_config, ProxyArgs};
use crate::output::{print_json, print_yaml};
use clap::Subcommand;
use serde::Serialize;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Print the effective config (file plus flags)
    Show {
        #[command(flatten)]
        args: ProxyArgs,
    },

    /// Validate the effective config and locate the worker executable
    Check {
        #[command(flatten)]
        args: ProxyArgs,
    },
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(config_path: Option<&Path>, subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ConfigSubcommand::Show { args } => show(config_path, &args, json),
        ConfigSubcommand::Check { args } => check(config_path, &args, json),
    }
}

// ---------------------------------------------------------------------------
// show
// ---------------------------------------------------------------------------

fn show(config_path: Option<&Path>, args: &ProxyArgs, json: bool) -> anyhow::Result<()> {
    let config = effective_config(config_path, args)?;
    if json {
        print_json(&config)
    } else {
        print_yaml(&config)
    }
}

// ---------------------------------------------------------------------------
// check
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct CheckReport {
    ok: bool,
    command: String,
    resolved: Option<PathBuf>,
    audit_log: PathBuf,
    sentinel: String,
    problems: Vec<String>,
}

fn check(config_path: Option<&Path>, args: &ProxyArgs, json: bool) -> anyhow::Result<()> {
    let config = effective_config(config_path, args)?;

    let mut problems = Vec::new();
    if let Err(e) = config.validate() {
        problems.push(e.to_string());
    }
    let resolved = if config.worker.command.trim().is_empty() {
        None
    } else {
        match config.resolve_command() {
            Ok(path) => Some(path),
            Err(e) => {
                problems.push(e.to_string());
                None
            }
        }
    };

    let report = CheckReport {
        ok: problems.is_empty(),
        command: config.worker.command.clone(),
        resolved,
        audit_log: config.audit_log_path(),
        sentinel: config.restart.sentinel.clone(),
        problems,
    };

    if json {
        print_json(&report)?;
    } else {
        match &report.resolved {
            Some(path) => println!("worker:    {} ({})", report.command, path.display()),
            None => println!("worker:    {}", report.command),
        }
        println!("sentinel:  {}", report.sentinel);
        println!("audit log: {}", report.audit_log.display());
        for problem in &report.problems {
            println!("  [error] {problem}");
        }
    }

    if !report.ok {
        anyhow::bail!("config has {} problem(s)", report.problems.len());
    }
    Ok(())
}
