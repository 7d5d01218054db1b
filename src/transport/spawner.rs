//! Agent process spawner.
//!
//! Launches the agent with all three stdio streams piped and
//! `kill_on_drop(true)` so an abandoned child never outlives its watcher.
//! When [`ProcessSpec::inherit_env`] is `false` the parent environment is
//! cleared and only [`ALLOWED_ENV_VARS`] plus [`ProcessSpec::env`]
//! reach the child.

use std::process::Stdio;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::info;

use crate::transport::ProcessSpec;
use crate::{AppError, Result};

/// Environment variables inherited when the environment is isolated.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "RUST_LOG",
    "LANG",
    "TERM",
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERNAME",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
];

/// A freshly spawned child with its stdio split out.
#[derive(Debug)]
pub struct SpawnedProcess {
    /// Child handle; the exit watcher takes ownership of it.
    pub child: Child,
    /// OS process id.
    pub pid: Option<u32>,
    /// Agent stdin.
    pub stdin: ChildStdin,
    /// Agent stdout.
    pub stdout: ChildStdout,
    /// Agent stderr.
    pub stderr: ChildStderr,
}

/// Spawn the process described by `spec`.
///
/// # Errors
///
/// - `AppError::Spawn("failed to spawn agent: …")` on OS spawn failure.
/// - `AppError::Spawn("failed to capture agent …")` if a pipe is missing.
pub fn spawn_process(spec: &ProcessSpec) -> Result<SpawnedProcess> {
    let mut cmd = Command::new(&spec.command);
    cmd.args(&spec.args);

    if !spec.inherit_env {
        cmd.env_clear();
        for &key in ALLOWED_ENV_VARS {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }
    }
    cmd.envs(&spec.env);

    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }

    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|err| {
        AppError::Spawn(format!("failed to spawn agent `{}`: {err}", spec.command))
    })?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture agent stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture agent stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture agent stderr".into()))?;

    let pid = child.id();
    info!(command = %spec.command, ?pid, "agent process spawned");

    Ok(SpawnedProcess {
        child,
        pid,
        stdin,
        stdout,
        stderr,
    })
}
