//! Where bootstrap commands run.
//!
//! Every command is delivered as a script on stdin to `sh -s`, locally or
//! through `ssh`, so interpolated secrets never appear in an argument list.

use async_trait::async_trait;
use keel_config::bootstrap::HostSpec;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{BootstrapError, BootstrapResult};

/// Captured result of one script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Combined output for error reports.
    pub fn combined(&self) -> String {
        let out = format!("{}\n{}", self.stdout.trim(), self.stderr.trim());
        out.trim().to_string()
    }
}

/// A machine that can run shell scripts.
#[async_trait]
pub trait Target: Send + Sync {
    /// Host name used in logs and reports.
    fn name(&self) -> &str;

    /// Run a shell script, optionally as root.
    async fn run(&self, script: &str, sudo: bool) -> BootstrapResult<CommandOutput>;
}

fn shell_command(sudo: bool) -> Vec<String> {
    let mut args = Vec::new();
    if sudo {
        args.push("sudo".to_string());
        args.push("-n".to_string());
    }
    args.push("sh".to_string());
    args.push("-s".to_string());
    args
}

async fn run_with_stdin(program: &str, args: &[String], script: &str) -> BootstrapResult<CommandOutput> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| BootstrapError::Spawn {
            program: program.to_string(),
            message: e.to_string(),
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(script.as_bytes()).await?;
        stdin.shutdown().await?;
    }

    let output = child.wait_with_output().await?;
    Ok(CommandOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Runs scripts on the machine keel runs on.
pub struct LocalTarget {
    name: String,
}

impl LocalTarget {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Target for LocalTarget {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, script: &str, sudo: bool) -> BootstrapResult<CommandOutput> {
        let mut args = shell_command(sudo);
        let program = args.remove(0);
        debug!(host = %self.name, sudo, "Running local script");
        run_with_stdin(&program, &args, script).await
    }
}

/// Runs scripts on a remote host through the `ssh` binary.
pub struct SshTarget {
    host: HostSpec,
    ssh_bin: String,
}

impl SshTarget {
    pub fn new(host: HostSpec) -> Self {
        Self {
            host,
            ssh_bin: "ssh".to_string(),
        }
    }

    pub fn with_ssh_binary(mut self, ssh_bin: impl Into<String>) -> Self {
        self.ssh_bin = ssh_bin.into();
        self
    }

    /// Arguments for one invocation. Batch mode fails fast instead of
    /// prompting for a password.
    pub fn args(&self, sudo: bool) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
        ];
        if let Some(port) = self.host.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        if let Some(identity) = &self.host.identity_file {
            args.push("-i".to_string());
            args.push(identity.clone());
        }
        args.push(self.host.destination());
        args.push("--".to_string());
        args.extend(shell_command(sudo));
        args
    }
}

#[async_trait]
impl Target for SshTarget {
    fn name(&self) -> &str {
        &self.host.name
    }

    async fn run(&self, script: &str, sudo: bool) -> BootstrapResult<CommandOutput> {
        debug!(host = %self.host.name, destination = %self.host.destination(), sudo, "Running remote script");
        run_with_stdin(&self.ssh_bin, &self.args(sudo), script).await
    }
}
