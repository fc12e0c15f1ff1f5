//! Container engine adapter.
//!
//! The engine is an external command line tool (`docker` by default). Every
//! operation is a subprocess whose exit status decides success and whose
//! standard output, when present, carries the instance identifier.

use crate::error::{CoreError, Result};
use async_trait::async_trait;
use std::fmt;
use std::process::Stdio;

/// Keep-alive entry command for persistent sandboxes.
const KEEP_ALIVE: &str = "while true; do sleep 1; done";

/// Identifier of a sandbox instance as understood by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SandboxId(String);

impl SandboxId {
    /// Wrap an engine identifier or container name.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parameters for starting a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Container name.
    pub name: String,
    /// Hostname inside the container.
    pub hostname: String,
    /// Image to run.
    pub image: String,
}

/// Where a session's shell runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellTarget {
    /// Exec into an already running persistent sandbox.
    Existing(SandboxId),
    /// Start a fresh sandbox that is removed when the shell exits.
    Fresh(LaunchSpec),
}

/// A command line to be started on a pseudo-terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    /// Program to execute.
    pub program: String,
    /// Arguments, not including the program.
    pub args: Vec<String>,
}

/// Operations the orchestrator needs from a container engine.
#[async_trait]
pub trait SandboxEngine: Send + Sync {
    /// Human-readable engine name (e.g. "docker").
    fn name(&self) -> &str;

    /// Start a detached, long-lived sandbox and return its identifier.
    async fn run_detached(&self, spec: &LaunchSpec) -> Result<SandboxId>;

    /// Build the interactive command that runs `script` as the session shell.
    fn shell_command(&self, target: &ShellTarget, script: &str) -> ShellCommand;

    /// Force-remove the given sandboxes in a single request.
    async fn remove(&self, ids: &[SandboxId]) -> Result<()>;
}

/// Docker CLI backed engine.
///
/// Any CLI compatible with `docker run/exec/rm` (for example `podman`) can be
/// used by pointing `binary` at it.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    binary: String,
}

impl DockerEngine {
    /// Create an engine that invokes `binary`.
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl Default for DockerEngine {
    fn default() -> Self {
        Self::new("docker")
    }
}

#[async_trait]
impl SandboxEngine for DockerEngine {
    fn name(&self) -> &str {
        &self.binary
    }

    async fn run_detached(&self, spec: &LaunchSpec) -> Result<SandboxId> {
        tracing::debug!(name = %spec.name, image = %spec.image, "Starting detached sandbox");
        let output = self
            .command()
            .args(["run", "-d", "-h", &spec.hostname, "--name", &spec.name])
            .arg(&spec.image)
            .args(["bash", "-c", KEEP_ALIVE])
            .output()
            .await
            .map_err(|e| CoreError::SandboxCreateFailed {
                output: format!("failed to run {}: {e}", self.binary),
            })?;

        if !output.status.success() {
            return Err(CoreError::SandboxCreateFailed {
                output: combined_output(&output),
            });
        }

        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            return Err(CoreError::SandboxCreateFailed {
                output: format!("{} run printed no container id", self.binary),
            });
        }
        Ok(SandboxId::new(id))
    }

    fn shell_command(&self, target: &ShellTarget, script: &str) -> ShellCommand {
        let mut args: Vec<String> = match target {
            ShellTarget::Existing(id) => {
                vec!["exec".into(), "-it".into(), id.to_string()]
            }
            ShellTarget::Fresh(spec) => vec![
                "run".into(),
                "-it".into(),
                "--rm".into(),
                "-h".into(),
                spec.hostname.clone(),
                "--name".into(),
                spec.name.clone(),
                spec.image.clone(),
            ],
        };
        args.extend(["bash".into(), "-c".into(), script.to_string()]);
        ShellCommand {
            program: self.binary.clone(),
            args,
        }
    }

    async fn remove(&self, ids: &[SandboxId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        tracing::debug!(count = ids.len(), "Removing sandboxes");
        let output = self
            .command()
            .args(["rm", "-f"])
            .args(ids.iter().map(SandboxId::as_str))
            .output()
            .await?;

        if !output.status.success() {
            return Err(CoreError::SandboxRemoveFailed {
                output: combined_output(&output),
            });
        }
        Ok(())
    }
}

fn combined_output(output: &std::process::Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let text = format!("{}{}", stdout, stderr).trim().to_string();
    if text.is_empty() {
        format!("exited with {}", output.status)
    } else {
        text
    }
}
