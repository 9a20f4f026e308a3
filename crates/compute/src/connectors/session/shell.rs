//! Remote command sessions.
//!
//! Uses `tokio::process::Command` to drive the system `ssh` client.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::ConnectorError;

/// Result of one remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status (`-1` when killed by a signal).
    pub exit_code: i32,
    /// Captured stdout.
    pub stdout: Vec<u8>,
    /// Captured stderr.
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    /// Whether the command exited with status 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout as lossy UTF-8.
    #[must_use]
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Runs shell commands on a provisioned machine.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Run `command` through the remote login shell.
    ///
    /// A non-zero exit is returned as output, not as an error; errors mean
    /// the session itself could not be established.
    async fn exec(&self, host: &str, user: &str, command: &str)
        -> Result<CommandOutput, ConnectorError>;
}

/// SSH exit status for connection-level failures.
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Session over the system `ssh` binary.
///
/// The child process is killed when the `exec` future is dropped, so a call
/// abandoned on timeout does not leave `ssh` running.
#[derive(Debug, Clone)]
pub struct SshSession {
    program: PathBuf,
    key_path: Option<PathBuf>,
    connect_timeout_secs: u64,
}

impl SshSession {
    /// Create a session using `key_path` as identity (agent keys otherwise).
    #[must_use]
    pub fn new(key_path: Option<PathBuf>) -> Self {
        Self {
            program: PathBuf::from("ssh"),
            key_path,
            connect_timeout_secs: 15,
        }
    }

    /// Use another `ssh`-compatible client binary.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }
}

impl Default for SshSession {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn exec(
        &self,
        host: &str,
        user: &str,
        command: &str,
    ) -> Result<CommandOutput, ConnectorError> {
        debug!(host = %host, user = %user, "Running remote command");

        let mut cmd = Command::new(&self.program);
        cmd.kill_on_drop(true).args([
            "-o",
            "BatchMode=yes",
            "-o",
            "StrictHostKeyChecking=accept-new",
            "-o",
            &format!("ConnectTimeout={}", self.connect_timeout_secs),
        ]);
        if let Some(key) = &self.key_path {
            cmd.arg("-i").arg(key);
        }
        cmd.arg(format!("{user}@{host}")).arg(command);

        let output = cmd
            .output()
            .await
            .map_err(|e| ConnectorError::Validation(format!("failed to run ssh: {e}")))?;

        let exit_code = output.status.code().unwrap_or(-1);
        if exit_code == SSH_CONNECTION_FAILURE {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("Permission denied") {
                return Err(ConnectorError::Auth(format!("ssh {host}: {}", stderr.trim())));
            }
            return Err(ConnectorError::Transient(format!(
                "ssh {host}: {}",
                stderr.trim()
            )));
        }

        Ok(CommandOutput {
            exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// Quote `value` for a POSIX shell.
#[must_use]
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_output_helpers() {
        let out = CommandOutput {
            exit_code: 0,
            stdout: b"ok\n".to_vec(),
            stderr: Vec::new(),
        };
        assert!(out.success());
        assert_eq!(out.stdout_text(), "ok\n");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_abandoned_exec_kills_child() {
        use std::os::unix::fs::PermissionsExt;
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("child.pid");
        let client = dir.path().join("slow-ssh");
        std::fs::write(
            &client,
            format!("#!/bin/sh\necho $$ > '{}'\nexec sleep 30\n", pid_file.display()),
        )
        .unwrap();
        std::fs::set_permissions(&client, std::fs::Permissions::from_mode(0o755)).unwrap();

        let session = SshSession::new(None).with_program(&client);
        let call = session.exec("10.0.0.1", "ubuntu", "tail -f train.log");
        assert!(tokio::time::timeout(Duration::from_millis(300), call)
            .await
            .is_err());

        let pid = std::fs::read_to_string(&pid_file).unwrap();
        let stat = format!("/proc/{}/stat", pid.trim());
        let mut gone = false;
        for _ in 0..100 {
            match std::fs::read_to_string(&stat) {
                // Killed but not yet reaped.
                Ok(content) if content.contains(") Z") => {
                    gone = true;
                    break;
                }
                Ok(_) => tokio::time::sleep(Duration::from_millis(20)).await,
                Err(_) => {
                    gone = true;
                    break;
                }
            }
        }
        assert!(gone, "ssh child {} still running", pid.trim());
    }
}
