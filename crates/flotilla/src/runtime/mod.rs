use std::ffi::OsStr;
use std::fs;
use std::process::{Output, Stdio};
use std::time::Duration;

use anyhow::Context;
use tokio::process::Command;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::config::FleetConfig;
use crate::error::FleetError;

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

pub fn ensure_fleet_root(cfg: &FleetConfig) -> anyhow::Result<()> {
    if !cfg.fleet_root.is_dir() {
        return Err(FleetError::configuration(format!(
            "fleet root does not exist: {}",
            cfg.fleet_root.display()
        ))
        .into());
    }
    Ok(())
}

pub fn ensure_template(cfg: &FleetConfig) -> anyhow::Result<()> {
    let template_config = cfg.template_dir.join(&cfg.config_file_name);
    if !template_config.is_file() {
        return Err(FleetError::configuration(format!(
            "template config not found: {}",
            template_config.display()
        ))
        .into());
    }
    Ok(())
}

/// Build a command for an external tool. stdin is closed; output is captured.
pub fn tool_command<I, S>(program: &str, args: I) -> Command
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

/// Run a prepared command to completion within `limit`.
///
/// Spawn failures, timeouts and non-zero exits all become
/// [`FleetError::ExternalTool`] labelled with `tool`.
pub async fn run_command(tool: &str, mut cmd: Command, limit: Duration) -> anyhow::Result<Output> {
    debug!(tool, ?cmd, "running external command");
    let child = cmd
        .spawn()
        .map_err(|e| FleetError::external(tool, format!("failed to start: {e}")))?;
    let output = match tokio::time::timeout(limit, child.wait_with_output()).await {
        Ok(result) => result.with_context(|| format!("failed waiting for {tool}"))?,
        Err(_) => {
            return Err(FleetError::external(tool, format!("timed out after {limit:?}")).into());
        }
    };
    if !output.status.success() {
        return Err(FleetError::external(tool, failure_message(&output)).into());
    }
    Ok(output)
}

pub async fn run_tool<I, S>(
    program: &str,
    args: I,
    limit: Duration,
) -> anyhow::Result<Output>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    run_command(program, tool_command(program, args), limit).await
}

fn failure_message(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
    let tail: Vec<&str> = tail.into_iter().rev().collect();
    if tail.is_empty() {
        format!("exited with {}", output.status)
    } else {
        format!("exited with {}: {}", output.status, tail.join(" | "))
    }
}

pub fn stdout_lines(output: &Output) -> Vec<String> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Whether `program` can be found on `PATH` (or is an existing path).
pub fn which(program: &str) -> bool {
    if program.contains('/') {
        return std::path::Path::new(program).is_file();
    }
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| dir.join(program).is_file())
}

pub fn create_dir(path: &std::path::Path) -> anyhow::Result<()> {
    fs::create_dir_all(path).with_context(|| format!("failed to create {}", path.display()))
}
