use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use ember_core::{Machine, ValidationErrors};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::Instrument;

use crate::{
    config::SshConfig,
    error::ProvisionError,
    shell::{RemoteCommand, RemoteScript, ensure_safe_token},
};

/// Exit status the OpenSSH client uses for its own failures (connection
/// refused, auth failure, host key mismatch, ...).
const SSH_CLIENT_FAILURE: i32 = 255;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Connection {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub key_ref: String,
}

impl Connection {
    pub fn for_machine(machine: &Machine) -> Self {
        Self {
            host: machine.address.clone(),
            port: machine.ssh_port,
            user: machine.ssh_user.clone(),
            key_ref: machine.ssh_key_ref.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turns a non-zero exit into a [`ProvisionError::RemoteExecution`] for `step`.
    pub fn check(self, step: impl Into<String>) -> Result<Self, ProvisionError> {
        if self.success() {
            Ok(self)
        } else {
            Err(ProvisionError::remote(step, self.exit_code, &self.stderr))
        }
    }
}

/// Runs shell commands on remote hosts. Implementations never retry; retry
/// policy belongs to callers so non-idempotent commands are not re-run
/// silently.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute_with_stdin(
        &self,
        conn: &Connection,
        script: &RemoteScript,
        stdin: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<CommandOutput, ProvisionError>;

    async fn execute(
        &self,
        conn: &Connection,
        script: &RemoteScript,
        timeout: Duration,
    ) -> Result<CommandOutput, ProvisionError> {
        self.execute_with_stdin(conn, script, None, timeout).await
    }

    /// Writes `contents` to `path` on the remote host, creating parent
    /// directories. The payload travels over stdin, never through the shell.
    async fn upload(
        &self,
        conn: &Connection,
        path: &str,
        contents: &[u8],
        mode: &str,
        timeout: Duration,
    ) -> Result<(), ProvisionError> {
        let parent = Path::new(path)
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "/".to_string());
        let script = RemoteScript::new()
            .then(RemoteCommand::new("mkdir").args(["-p", parent.as_str()]).sudo())
            .then(
                RemoteCommand::new("tee")
                    .arg(path)
                    .sudo()
                    .stdout_to("/dev/null"),
            )
            .then(RemoteCommand::new("chmod").args([mode, path]).sudo());
        self.execute_with_stdin(conn, &script, Some(contents.to_vec()), timeout)
            .await?
            .check(format!("upload {path}"))?;
        Ok(())
    }
}

/// [`RemoteExecutor`] backed by the system OpenSSH client.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    cfg: SshConfig,
}

impl SshExecutor {
    pub fn new(cfg: SshConfig) -> Self {
        Self { cfg }
    }

    fn key_path(&self, key_ref: &str) -> Result<PathBuf, ProvisionError> {
        if let Err(msg) = ensure_safe_token(key_ref) {
            let mut errs = ValidationErrors::new();
            errs.add("ssh_key_ref", msg);
            return Err(ProvisionError::Validation(errs));
        }
        Ok(self.cfg.key_dir.join(key_ref))
    }
}

fn preview(command: &str) -> &str {
    let mut end = command.len().min(200);
    while !command.is_char_boundary(end) {
        end -= 1;
    }
    &command[..end]
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn execute_with_stdin(
        &self,
        conn: &Connection,
        script: &RemoteScript,
        stdin: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<CommandOutput, ProvisionError> {
        let span = tracing::debug_span!("ssh", host = %conn.host, port = conn.port);
        self.run(conn, script, stdin, timeout).instrument(span).await
    }
}

impl SshExecutor {
    async fn run(
        &self,
        conn: &Connection,
        script: &RemoteScript,
        stdin: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<CommandOutput, ProvisionError> {
        if conn.host.is_empty() || conn.host.starts_with('-') {
            return Err(ProvisionError::Connectivity {
                host: conn.host.clone(),
                message: "invalid host".to_string(),
            });
        }
        let key = self.key_path(&conn.key_ref)?;
        let rendered = script.render();

        tracing::debug!(command = preview(&rendered), "executing remote command");

        let mut cmd = tokio::process::Command::new(&self.cfg.binary);
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.cfg.connect_timeout_secs))
            .arg("-o")
            .arg("ServerAliveInterval=15")
            .arg("-p")
            .arg(conn.port.to_string())
            .arg("-i")
            .arg(&key)
            .arg("-l")
            .arg(&conn.user)
            .arg("--")
            .arg(&conn.host)
            .arg(&rendered)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| ProvisionError::Connectivity {
            host: conn.host.clone(),
            message: format!("spawn {}: {e}", self.cfg.binary.display()),
        })?;

        let child_stdin = child.stdin.take();
        let feed = async move {
            if let (Some(mut pipe), Some(bytes)) = (child_stdin, stdin) {
                // A closed pipe shows up in the exit code; nothing to add here.
                let _ = pipe.write_all(&bytes).await;
                let _ = pipe.shutdown().await;
            }
        };

        // Dropping the wait future on timeout drops the child, which kills it.
        let run = async move {
            let (_, output) = tokio::join!(feed, child.wait_with_output());
            output
        };
        let output = match tokio::time::timeout(timeout, run).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ProvisionError::Connectivity {
                    host: conn.host.clone(),
                    message: format!("ssh wait failed: {e}"),
                });
            }
            Err(_) => {
                tracing::warn!(timeout_ms = timeout.as_millis() as u64, "remote command timed out");
                return Err(ProvisionError::Timeout {
                    host: conn.host.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if exit_code == SSH_CLIENT_FAILURE {
            tracing::warn!(stderr = %crate::error::tail(&stderr, 512), "ssh connection failed");
            return Err(ProvisionError::Connectivity {
                host: conn.host.clone(),
                message: crate::error::tail(&stderr, 512),
            });
        }

        tracing::debug!(exit_code, "remote command finished");
        Ok(CommandOutput {
            exit_code,
            stdout,
            stderr,
        })
    }
}
